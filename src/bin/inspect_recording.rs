use activity_decoder::config::PipelineConfig;
use activity_decoder::data_loading::{read_recording, RecordingFormat};
use activity_decoder::epochs::split;
use activity_decoder::preprocessing::clean;
use activity_decoder::Recording;
use anyhow::{anyhow, Result};
use std::path::Path;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} <recording_file>", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);
    let format = RecordingFormat::from_path(path)
        .ok_or_else(|| anyhow!("Unsupported recording format: {}", path.display()))?;
    let stream = read_recording(path)?;
    let config = PipelineConfig::default();

    println!("\nRecording: {} ({:?})", stream.source, format);
    println!("  Samples: {}", stream.len());
    match stream.effective_rate() {
        Some(rate) => println!("  Sampling rate: {:.2} Hz", rate),
        None => println!("  Sampling rate: unknown"),
    }
    let flagged = stream.samples.iter().filter(|s| s.worn == Some(false)).count();
    println!("  Flagged not worn by device: {}", flagged);

    let Some(recording) = Recording::new(stream, config.sample_period()) else {
        println!("  No samples, nothing else to show");
        return Ok(());
    };
    println!("  Begin: {}", recording.begin_time);
    println!("  End:   {}", recording.end_time);
    println!("  Duration: {} minutes", recording.duration().num_minutes());

    let cleaned = clean(&recording.stream, &config);
    println!(
        "\nAt {} Hz: {} samples, {} not worn",
        config.sample_rate, cleaned.total_samples, cleaned.not_worn_count
    );

    println!("\nEpochs:");
    for epoch in split(&recording.stream, recording.begin_time, recording.end_time, &config).values() {
        println!(
            "  {:>9}  {} - {}  {} samples{}",
            epoch.key.label(),
            epoch.start.format("%H:%M"),
            epoch.end.format("%H:%M"),
            epoch.stream.len(),
            if epoch.is_partial(&config) { " (partial)" } else { "" }
        );
    }

    Ok(())
}
