use crate::classification::{ActivityLabel, Chunk, ClassifiedChunk, ClassifiedSeries};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct CachedChunk {
    index: usize,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    range_start: usize,
    range_end: usize,
    seconds: f32,
    label: ActivityLabel,
    model_version: String,
    settings: String,
}

/// Classified day series stored as `<subject>/<day>.csv`. An entry is only
/// reused for the same model version and the same prediction settings.
#[derive(Debug, Clone)]
pub struct PredictionCache {
    dir: PathBuf,
    process_all: bool,
}

impl PredictionCache {
    /// With `process_all` every lookup misses, fresh results are still stored.
    pub fn new(dir: impl Into<PathBuf>, process_all: bool) -> Self {
        Self {
            dir: dir.into(),
            process_all,
        }
    }

    fn path_for(&self, subject: &str, day: &str) -> PathBuf {
        self.dir
            .join(file_component(subject))
            .join(format!("{}.csv", file_component(day)))
    }

    pub fn load(
        &self,
        subject: &str,
        day: &str,
        model_version: &str,
        settings: &str,
    ) -> Option<ClassifiedSeries> {
        if self.process_all {
            return None;
        }
        let path = self.path_for(subject, day);
        if !path.exists() {
            return None;
        }
        match read_series(&path) {
            Ok((series, stored)) if series.model_version == model_version && stored == settings => {
                debug!("Using cached predictions from {}", path.display());
                Some(series)
            }
            Ok((series, stored)) => {
                debug!(
                    "Ignoring cached predictions of model {} with settings {} in {}",
                    series.model_version,
                    stored,
                    path.display()
                );
                None
            }
            Err(err) => {
                warn!("Ignoring unreadable cache file {}: {:#}", path.display(), err);
                None
            }
        }
    }

    pub fn store(
        &self,
        subject: &str,
        day: &str,
        series: &ClassifiedSeries,
        settings: &str,
    ) -> Result<()> {
        let path = self.path_for(subject, day);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to create cache file {}", path.display()))?;
        for classified in &series.chunks {
            let chunk = &classified.chunk;
            writer.serialize(CachedChunk {
                index: chunk.index,
                start: chunk.start,
                end: chunk.end,
                range_start: chunk.range.start,
                range_end: chunk.range.end,
                seconds: chunk.seconds,
                label: classified.label,
                model_version: series.model_version.clone(),
                settings: settings.to_string(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Keeps `[A-Za-z0-9_-]` and inner dots, percent-encodes every other byte.
/// Distinct ids never map to the same name.
fn file_component(id: &str) -> String {
    if id.is_empty() {
        return "%".to_string();
    }
    let mut name = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || (byte == b'.' && i > 0) {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

/// The series and the settings it was computed with.
fn read_series(path: &Path) -> Result<(ClassifiedSeries, String)> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut series = ClassifiedSeries::default();
    let mut settings = String::new();
    for row in reader.deserialize() {
        let row: CachedChunk = row?;
        if series.chunks.is_empty() {
            series.model_version = row.model_version.clone();
            settings = row.settings.clone();
        } else if series.model_version != row.model_version || settings != row.settings {
            bail!("mixed model versions or settings in {}", path.display());
        }
        series.chunks.push(ClassifiedChunk {
            chunk: Chunk {
                index: row.index,
                range: row.range_start..row.range_end,
                start: row.start,
                end: row.end,
                seconds: row.seconds,
            },
            label: row.label,
        });
    }
    Ok((series, settings))
}
