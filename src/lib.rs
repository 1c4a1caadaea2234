pub mod cache;
pub mod characteristics;
pub mod classification;
pub mod config;
pub mod data_loading;
pub mod diagnostics;
pub mod epochs;
pub mod error;
pub mod model;
pub mod output;
pub mod pain;
pub mod pipeline;
pub mod preprocessing;

use chrono::{DateTime, Duration, Utc};

/// One tri-axial accelerometer reading, in g.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub timestamp: DateTime<Utc>,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Worn flag reported by the device itself, if it has one
    pub worn: Option<bool>,
}

impl SensorSample {
    pub fn new(timestamp: DateTime<Utc>, x: f32, y: f32, z: f32) -> Self {
        Self {
            timestamp,
            x,
            y,
            z,
            worn: None,
        }
    }

    pub fn with_worn(mut self, worn: Option<bool>) -> Self {
        self.worn = worn;
        self
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Euclidean norm minus one g, clipped at zero
    pub fn enmo(&self) -> f32 {
        (self.magnitude() - 1.0).max(0.0)
    }
}

/// Ordered samples of one subject-day.
#[derive(Debug, Clone, Default)]
pub struct SensorStream {
    /// Where the samples came from (file name, epoch label, ...)
    pub source: String,
    pub nominal_rate: Option<f32>,
    pub samples: Vec<SensorSample>,
}

impl SensorStream {
    pub fn new(source: impl Into<String>, samples: Vec<SensorSample>) -> Self {
        Self {
            source: source.into(),
            nominal_rate: None,
            samples,
        }
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.nominal_rate = Some(rate);
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.timestamp)
    }

    /// Sort by time and drop samples sharing a timestamp with their
    /// predecessor. Returns how many samples were dropped.
    pub fn normalise(&mut self) -> usize {
        let before = self.samples.len();
        self.samples.sort_by_key(|s| s.timestamp);
        self.samples.dedup_by_key(|s| s.timestamp);
        before - self.samples.len()
    }

    /// Sample period from the nominal rate, or the median spacing when the
    /// source did not declare one.
    pub fn estimated_period(&self) -> Option<Duration> {
        if let Some(rate) = self.nominal_rate.filter(|r| *r > 0.0) {
            return Some(period_from_rate(rate));
        }
        if self.samples.len() < 2 {
            return None;
        }

        let mut deltas: Vec<i64> = self
            .samples
            .windows(2)
            .filter_map(|w| (w[1].timestamp - w[0].timestamp).num_nanoseconds())
            .filter(|d| *d > 0)
            .collect();
        if deltas.is_empty() {
            return None;
        }
        deltas.sort_unstable();
        Some(Duration::nanoseconds(deltas[deltas.len() / 2]))
    }

    pub fn effective_rate(&self) -> Option<f32> {
        self.estimated_period()
            .and_then(|p| p.num_nanoseconds())
            .filter(|ns| *ns > 0)
            .map(|ns| (1e9 / ns as f64) as f32)
    }

    /// Copy of the samples with `start <= timestamp < end`.
    pub fn slice_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> SensorStream {
        let from = self.samples.partition_point(|s| s.timestamp < start);
        let to = self.samples.partition_point(|s| s.timestamp < end).max(from);
        SensorStream {
            source: self.source.clone(),
            nominal_rate: self.nominal_rate,
            samples: self.samples[from..to].to_vec(),
        }
    }
}

/// A stream together with the wall-clock interval it covers.
#[derive(Debug, Clone)]
pub struct Recording {
    pub stream: SensorStream,
    pub begin_time: DateTime<Utc>,
    /// One sample period past the last sample, so `[begin, end)` covers it
    pub end_time: DateTime<Utc>,
}

impl Recording {
    /// Returns `None` for a stream without samples.
    pub fn new(stream: SensorStream, fallback_period: Duration) -> Option<Self> {
        let begin_time = stream.first_timestamp()?;
        let last = stream.last_timestamp()?;
        let period = stream.estimated_period().unwrap_or(fallback_period);
        Some(Self {
            stream,
            begin_time,
            end_time: last + period,
        })
    }

    pub fn duration(&self) -> Duration {
        self.end_time - self.begin_time
    }
}

pub fn period_from_rate(rate: f32) -> Duration {
    Duration::nanoseconds((1e9 / rate as f64).round() as i64)
}
