#![allow(dead_code)]

use activity_decoder::classification::{ActivityLabel, Classifier, FeatureVector};
use activity_decoder::config::PipelineConfig;
use activity_decoder::error::ClassifyError;
use activity_decoder::{period_from_rate, SensorSample, SensorStream};
use chrono::{DateTime, NaiveDate, Utc};
use std::io::Write;
use std::path::Path;

/// Thresholds on mean ENMO, deterministic.
pub struct StubModel;

impl Classifier for StubModel {
    fn version(&self) -> &str {
        "integration-stub"
    }

    fn score(&self, features: &FeatureVector) -> Result<ActivityLabel, ClassifyError> {
        let enmo = features.get("enmo_mean").unwrap_or(0.0);
        Ok(if enmo < 0.02 {
            ActivityLabel::Sedentary
        } else if enmo < 0.1 {
            ActivityLabel::Light
        } else {
            ActivityLabel::Moderate
        })
    }
}

pub fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2024, 3, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
        .and_utc()
}

pub fn one_hertz() -> PipelineConfig {
    PipelineConfig {
        sample_rate: 1.0,
        ..Default::default()
    }
}

/// Wrist movement around one g.
pub fn active_stream(start: DateTime<Utc>, seconds: usize) -> SensorStream {
    let period = period_from_rate(1.0);
    let samples = (0..seconds)
        .map(|i| {
            let t = i as f32;
            SensorSample::new(
                start + period * i as i32,
                0.1 * (t * 0.7).sin(),
                0.1 * (t * 1.3).cos(),
                1.0 + 0.1 * (t * 0.3).sin(),
            )
        })
        .collect();
    SensorStream::new("integration", samples).with_rate(1.0)
}

/// Device left on a table.
pub fn resting_stream(start: DateTime<Utc>, seconds: usize) -> SensorStream {
    let period = period_from_rate(1.0);
    let samples = (0..seconds)
        .map(|i| SensorSample::new(start + period * i as i32, 0.0, 0.0, 1.0))
        .collect();
    SensorStream::new("integration", samples).with_rate(1.0)
}

pub fn write_csv_recording(path: &Path, stream: &SensorStream) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = std::fs::File::create(path).unwrap();
    writeln!(file, "timestamp,x,y,z").unwrap();
    for s in &stream.samples {
        writeln!(
            file,
            "{},{},{},{}",
            s.timestamp.format("%Y-%m-%d %H:%M:%S"),
            s.x,
            s.y,
            s.z
        )
        .unwrap();
    }
}

pub fn write_pain_scores(subject_dir: &Path, subject: &str, rows: &str) {
    let dir = subject_dir.join("pain_score");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{}_pain_score.csv", subject)),
        format!("date,time,score\n{}", rows),
    )
    .unwrap();
}
