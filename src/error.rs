use std::path::PathBuf;
use thiserror::Error;

/// Reasons a subject-day is skipped entirely.
#[derive(Debug, Error)]
pub enum UnitError {
    /// Missing or unreadable recording, pain table or directory
    #[error("input error: {0}")]
    Input(String),

    #[error("recording {0} contains no samples")]
    EmptyRecording(String),
}

impl UnitError {
    /// Keeps the whole context chain of a loader error.
    pub fn input(err: &anyhow::Error) -> Self {
        UnitError::Input(format!("{:#}", err))
    }
}

/// Reasons a single chunk cannot be scored. Never fatal for a series.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifyError {
    #[error("chunk has no samples")]
    EmptyChunk,

    #[error("feature {name} is not finite ({value})")]
    NonFiniteFeature { name: &'static str, value: f32 },

    #[error("model refers to unknown feature {0}")]
    UnknownFeature(String),

    #[error("tree {tree} does not reach a leaf from node {node}")]
    MalformedTree { tree: usize, node: usize },

    #[error("model produced class index {0} which has no label")]
    UnknownClass(usize),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnnotationError {
    #[error("no pain score for {date}{}", .time.as_ref().map(|t| format!(" at {}", t)).unwrap_or_default())]
    NoMatch {
        date: chrono::NaiveDate,
        time: Option<String>,
    },

    #[error("cannot derive a time of day from epoch key {0:?}")]
    MalformedEpochKey(String),

    #[error("cannot parse time of day {0:?}")]
    MalformedTime(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid model: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
