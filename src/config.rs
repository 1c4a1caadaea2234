use crate::error::ConfigError;
use crate::period_from_rate;
use chrono::Duration;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How a trailing chunk shorter than the configured size is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingChunkPolicy {
    /// Not classified at all (default)
    #[default]
    Drop,
    /// Filled up to full length by repeating the last sample
    Pad,
    /// Classified as is when it holds at least one base unit
    Reduced,
}

impl FromStr for TrailingChunkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(TrailingChunkPolicy::Drop),
            "pad" => Ok(TrailingChunkPolicy::Pad),
            "reduced" => Ok(TrailingChunkPolicy::Reduced),
            _ => Err(format!(
                "Invalid trailing chunk policy: {}. Use drop (default), pad or reduced",
                s
            )),
        }
    }
}

/// Rule deciding which samples were recorded while the device was off the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WornRule {
    /// A window is not worn when at least `min_axes` axes are nearly flat.
    RollingStd {
        window_seconds: f32,
        /// Standard deviation below which an axis counts as still, in g
        std_threshold: f32,
        /// Value range below which an axis counts as still, in g
        range_threshold: f32,
        min_axes: usize,
    },
    /// Trust the device's own worn flag only
    VendorFlag,
}

impl Default for WornRule {
    fn default() -> Self {
        WornRule::RollingStd {
            window_seconds: 1800.0,
            std_threshold: 0.013,
            range_threshold: 0.05,
            min_axes: 2,
        }
    }
}

/// Static parameters of a processing run, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Canonical sampling rate after downsampling, in Hz
    pub sample_rate: f32,
    pub base_unit_seconds: u32,
    /// Base units per classified chunk
    pub chunk_size: usize,
    pub epoch_hours: u32,
    pub worn_rule: WornRule,
    pub trailing_chunk: TrailingChunkPolicy,
    pub model_path: Option<PathBuf>,
    /// When false a subject without a pain table is processed with every
    /// pain field missing instead of being skipped
    pub require_pain_scores: bool,
    pub round_decimals: u32,
    pub cache_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 10.0,
            base_unit_seconds: 10,
            chunk_size: 6,
            epoch_hours: 2,
            worn_rule: WornRule::default(),
            trailing_chunk: TrailingChunkPolicy::default(),
            model_path: None,
            require_pain_scores: true,
            round_decimals: 3,
            cache_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.base_unit_seconds == 0 || self.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "base_unit_seconds and chunk_size must be at least 1".to_string(),
            ));
        }
        if self.epoch_hours == 0 {
            return Err(ConfigError::Invalid(
                "epoch_hours must be at least 1".to_string(),
            ));
        }
        if let WornRule::RollingStd {
            window_seconds,
            min_axes,
            ..
        } = &self.worn_rule
        {
            if *window_seconds <= 0.0 || *min_axes == 0 || *min_axes > 3 {
                return Err(ConfigError::Invalid(
                    "rolling_std needs a positive window and 1..=3 axes".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Command line values take precedence over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(model) = &args.model {
            self.model_path = Some(model.clone());
        }
        if let Some(chunk_size) = args.chunk_size {
            self.chunk_size = chunk_size;
        }
        if let Some(rate) = args.sample_rate {
            self.sample_rate = rate;
        }
        if let Some(policy) = args.trailing_chunk {
            self.trailing_chunk = policy;
        }
        if let Some(dir) = &args.cache_dir {
            self.cache_dir = Some(dir.clone());
        }
        if args.allow_missing_pain {
            self.require_pain_scores = false;
        }
    }

    /// The settings a classified series depends on, apart from the model.
    pub fn prediction_settings(&self) -> String {
        let worn = match &self.worn_rule {
            WornRule::RollingStd {
                window_seconds,
                std_threshold,
                range_threshold,
                min_axes,
            } => format!(
                "rolling_std:{}:{}:{}:{}",
                window_seconds, std_threshold, range_threshold, min_axes
            ),
            WornRule::VendorFlag => "vendor_flag".to_string(),
        };
        format!(
            "{}hz;{}s;x{};{:?};{}",
            self.sample_rate, self.base_unit_seconds, self.chunk_size, self.trailing_chunk, worn
        )
    }

    pub fn sample_period(&self) -> Duration {
        period_from_rate(self.sample_rate)
    }

    pub fn samples_per_base_unit(&self) -> usize {
        ((self.base_unit_seconds as f32 * self.sample_rate).round() as usize).max(1)
    }

    pub fn samples_per_chunk(&self, chunk_size: usize) -> usize {
        self.samples_per_base_unit() * chunk_size.max(1)
    }

    pub fn epoch_length(&self) -> Duration {
        Duration::hours(self.epoch_hours as i64)
    }
}

/// Classify activity levels in wearable recordings
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding one sub-directory per subject
    #[arg(help = "Directory holding one sub-directory per subject")]
    pub raw_data_dir: PathBuf,

    /// JSON pipeline configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Trained model file (JSON), overrides model_path from the config
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Directory the result tables are written to
    #[arg(long, default_value = "Results")]
    pub output_dir: PathBuf,

    /// Number of ten-second base units per classified chunk
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Canonical sampling rate in Hz
    #[arg(long)]
    pub sample_rate: Option<f32>,

    /// Trailing chunk policy (drop [default], pad, reduced)
    #[arg(long)]
    pub trailing_chunk: Option<TrailingChunkPolicy>,

    /// Directory for cached day-level predictions
    #[arg(long, env = "ACTIVITY_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Ignore cached predictions and classify everything again
    #[arg(long)]
    pub process_all: bool,

    /// Process subjects without a pain table instead of skipping them
    #[arg(long)]
    pub allow_missing_pain: bool,

    /// Worker threads, defaults to one per core
    #[arg(long)]
    pub threads: Option<usize>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short)]
    pub verbose: bool,
}
