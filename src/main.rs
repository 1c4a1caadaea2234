use activity_decoder::cache::PredictionCache;
use activity_decoder::config::{Args, PipelineConfig};
use activity_decoder::diagnostics::Severity;
use activity_decoder::model::TrainedModel;
use activity_decoder::output::write_results;
use activity_decoder::pipeline::Pipeline;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_args(&args);
    config.validate()?;

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to configure worker threads")?;
    }

    let model_path = config
        .model_path
        .clone()
        .ok_or_else(|| anyhow!("No model given, use --model or model_path in the config"))?;
    let model = TrainedModel::load(&model_path)?;

    let mut pipeline = Pipeline::new(config.clone(), &model);
    if let Some(dir) = &config.cache_dir {
        pipeline = pipeline.with_cache(PredictionCache::new(dir, args.process_all));
    }

    let report = pipeline.run(&args.raw_data_dir)?;
    let diagnostics = report.diagnostics();
    diagnostics.flush_to_log();

    let (days, epochs) = report.tables(config.round_decimals);
    let written = write_results(&args.output_dir, &days, &epochs, config.round_decimals)?;

    let log_path = args.output_dir.join(format!(
        "warnings_{}.log",
        chrono::Local::now().format("%Y-%m-%d")
    ));
    diagnostics
        .write_log(&log_path)
        .with_context(|| format!("Failed to write {}", log_path.display()))?;

    println!(
        "Processed {} subject-days ({} skipped), {} day rows, {} epoch rows",
        report.successes(),
        report.failures().count(),
        days.len(),
        epochs.len()
    );
    println!(
        "{} warnings, {} errors, see {}",
        diagnostics.count(Severity::Warning),
        diagnostics.count(Severity::Error),
        log_path.display()
    );
    for path in &written {
        info!("Output: {}", path.display());
    }
    Ok(())
}
