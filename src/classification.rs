use crate::config::{PipelineConfig, TrailingChunkPolicy};
use crate::diagnostics::{Channel, Diagnostics};
use crate::error::ClassifyError;
use crate::{SensorSample, SensorStream};
use chrono::{DateTime, Utc};
use log::trace;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

pub const FEATURE_NAMES: [&str; 12] = [
    "enmo_mean",
    "enmo_std",
    "unit_enmo_mean",
    "unit_enmo_max",
    "unit_enmo_std",
    "magnitude_std",
    "x_std",
    "y_std",
    "z_std",
    "magnitude_mad",
    "dominant_frequency",
    "dominant_power_ratio",
];

pub const FEATURE_COUNT: usize = FEATURE_NAMES.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLabel {
    Sedentary,
    Light,
    Moderate,
    Vigorous,
    /// Sentinel for chunks the model could not score
    Unclassifiable,
}

impl ActivityLabel {
    pub const SCORED: [ActivityLabel; 4] = [
        ActivityLabel::Sedentary,
        ActivityLabel::Light,
        ActivityLabel::Moderate,
        ActivityLabel::Vigorous,
    ];

    /// Numeric intensity, `None` for the sentinel
    pub fn level(self) -> Option<u8> {
        match self {
            ActivityLabel::Sedentary => Some(0),
            ActivityLabel::Light => Some(1),
            ActivityLabel::Moderate => Some(2),
            ActivityLabel::Vigorous => Some(3),
            ActivityLabel::Unclassifiable => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ActivityLabel::Sedentary => "sedentary",
            ActivityLabel::Light => "light",
            ActivityLabel::Moderate => "moderate",
            ActivityLabel::Vigorous => "vigorous",
            ActivityLabel::Unclassifiable => "unclassifiable",
        }
    }
}

impl fmt::Display for ActivityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActivityLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sedentary" => Ok(ActivityLabel::Sedentary),
            "light" => Ok(ActivityLabel::Light),
            "moderate" => Ok(ActivityLabel::Moderate),
            "vigorous" => Ok(ActivityLabel::Vigorous),
            "unclassifiable" => Ok(ActivityLabel::Unclassifiable),
            _ => Err(format!("Unknown activity label: {}", s)),
        }
    }
}

/// Summary statistics of one chunk, in `FEATURE_NAMES` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    values: [f32; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn from_values(values: [f32; FEATURE_COUNT]) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32; FEATURE_COUNT] {
        &self.values
    }

    pub fn index_of(name: &str) -> Option<usize> {
        FEATURE_NAMES.iter().position(|n| *n == name)
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        Self::index_of(name).map(|i| self.values[i])
    }

    pub fn check_finite(&self) -> Result<(), ClassifyError> {
        match self
            .values
            .iter()
            .zip(FEATURE_NAMES)
            .find(|(v, _)| !v.is_finite())
        {
            Some((value, name)) => Err(ClassifyError::NonFiniteFeature {
                name,
                value: *value,
            }),
            None => Ok(()),
        }
    }
}

/// A trained, read-only model shared by every classify call.
pub trait Classifier: Send + Sync {
    fn version(&self) -> &str;

    fn score(&self, features: &FeatureVector) -> Result<ActivityLabel, ClassifyError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Sample positions within the cleaned stream
    pub range: Range<usize>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Covered time; the nominal chunk length unless the chunk was reduced
    pub seconds: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedChunk {
    pub chunk: Chunk,
    pub label: ActivityLabel,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedSeries {
    pub model_version: String,
    pub chunks: Vec<ClassifiedChunk>,
}

impl ClassifiedSeries {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = ActivityLabel> + '_ {
        self.chunks.iter().map(|c| c.label)
    }
}

/// Index ranges of the chunks of a stream of `len` samples. Full chunks
/// start at zero; the remainder follows `policy`.
pub fn chunk_ranges(
    len: usize,
    chunk_len: usize,
    base_unit_len: usize,
    policy: TrailingChunkPolicy,
) -> Vec<Range<usize>> {
    let chunk_len = chunk_len.max(1);
    let full = len / chunk_len;
    let mut ranges: Vec<_> = (0..full)
        .map(|i| i * chunk_len..(i + 1) * chunk_len)
        .collect();

    let remainder = full * chunk_len..len;
    if !remainder.is_empty() {
        let keep = match policy {
            TrailingChunkPolicy::Drop => false,
            TrailingChunkPolicy::Pad => true,
            TrailingChunkPolicy::Reduced => remainder.len() >= base_unit_len,
        };
        if keep {
            ranges.push(remainder);
        }
    }
    ranges
}

pub fn chunk_stream(stream: &SensorStream, config: &PipelineConfig, chunk_size: usize) -> Vec<Chunk> {
    let chunk_len = config.samples_per_chunk(chunk_size);
    let period = config.sample_period();
    let nominal_seconds = chunk_len as f32 / config.sample_rate;

    chunk_ranges(
        stream.len(),
        chunk_len,
        config.samples_per_base_unit(),
        config.trailing_chunk,
    )
    .into_iter()
    .enumerate()
    .map(|(index, range)| {
        let first = &stream.samples[range.start];
        let last = &stream.samples[range.end - 1];
        let seconds = match config.trailing_chunk {
            TrailingChunkPolicy::Reduced => range.len() as f32 / config.sample_rate,
            _ => nominal_seconds,
        };
        Chunk {
            index,
            start: first.timestamp,
            end: last.timestamp + period,
            seconds,
            range,
        }
    })
    .collect()
}

/// Labels every chunk of a cleaned stream. Chunks the model cannot score
/// become `Unclassifiable`; the series itself never fails.
pub fn classify(
    stream: &SensorStream,
    config: &PipelineConfig,
    chunk_size: usize,
    model: &dyn Classifier,
    diagnostics: &mut Diagnostics,
) -> ClassifiedSeries {
    let chunk_len = config.samples_per_chunk(chunk_size);
    let base_unit_len = config.samples_per_base_unit();
    let mut planner = FftPlanner::new();
    let mut failures = 0usize;

    let chunks: Vec<ClassifiedChunk> = chunk_stream(stream, config, chunk_size)
        .into_iter()
        .map(|chunk| {
            let samples = &stream.samples[chunk.range.clone()];
            let padded;
            let samples = if config.trailing_chunk == TrailingChunkPolicy::Pad
                && samples.len() < chunk_len
            {
                padded = pad_samples(samples, chunk_len);
                &padded[..]
            } else {
                samples
            };

            let label = score_chunk(samples, config.sample_rate, base_unit_len, model, &mut planner)
                .unwrap_or_else(|err| {
                    trace!("{}: chunk {} unclassifiable: {}", stream.source, chunk.index, err);
                    if failures == 0 {
                        diagnostics.warn(
                            Channel::Processing,
                            format!("{}: chunk {} unclassifiable: {}", stream.source, chunk.index, err),
                        );
                    }
                    failures += 1;
                    ActivityLabel::Unclassifiable
                });
            ClassifiedChunk { chunk, label }
        })
        .collect();

    if failures > 1 {
        diagnostics.warn(
            Channel::Processing,
            format!("{}: {} chunks unclassifiable in total", stream.source, failures),
        );
    }

    ClassifiedSeries {
        model_version: model.version().to_string(),
        chunks,
    }
}

fn score_chunk(
    samples: &[SensorSample],
    sample_rate: f32,
    base_unit_len: usize,
    model: &dyn Classifier,
    planner: &mut FftPlanner<f32>,
) -> Result<ActivityLabel, ClassifyError> {
    if samples.is_empty() {
        return Err(ClassifyError::EmptyChunk);
    }
    let features = extract_features_with(samples, sample_rate, base_unit_len, planner);
    features.check_finite()?;
    model.score(&features)
}

fn pad_samples(samples: &[SensorSample], len: usize) -> Vec<SensorSample> {
    let mut padded = samples.to_vec();
    if let Some(last) = samples.last() {
        padded.resize(len, *last);
    }
    padded
}

pub fn extract_features(samples: &[SensorSample], sample_rate: f32, base_unit_len: usize) -> FeatureVector {
    extract_features_with(samples, sample_rate, base_unit_len, &mut FftPlanner::new())
}

fn extract_features_with(
    samples: &[SensorSample],
    sample_rate: f32,
    base_unit_len: usize,
    planner: &mut FftPlanner<f32>,
) -> FeatureVector {
    let magnitudes: Vec<f32> = samples.iter().map(|s| s.magnitude()).collect();
    let enmo: Vec<f32> = samples.iter().map(|s| s.enmo()).collect();
    let (enmo_mean, enmo_std) = mean_std(&enmo);

    // Per ten-second unit
    let unit_means: Vec<f32> = enmo
        .chunks(base_unit_len.max(1))
        .map(|unit| mean_std(unit).0)
        .collect();
    let (unit_mean, unit_std) = mean_std(&unit_means);
    let unit_max = unit_means.iter().cloned().fold(0.0f32, f32::max);

    let (magnitude_mean, magnitude_std) = mean_std(&magnitudes);
    let magnitude_mad = if magnitudes.is_empty() {
        0.0
    } else {
        magnitudes.iter().map(|m| (m - magnitude_mean).abs()).sum::<f32>() / magnitudes.len() as f32
    };
    let axis_std = |axis: fn(&SensorSample) -> f32| {
        let values: Vec<f32> = samples.iter().map(axis).collect();
        mean_std(&values).1
    };
    let (dominant_frequency, dominant_power_ratio) =
        dominant_frequency(&magnitudes, magnitude_mean, sample_rate, planner);

    FeatureVector::from_values([
        enmo_mean,
        enmo_std,
        unit_mean,
        unit_max,
        unit_std,
        magnitude_std,
        axis_std(|s: &SensorSample| s.x),
        axis_std(|s: &SensorSample| s.y),
        axis_std(|s: &SensorSample| s.z),
        magnitude_mad,
        dominant_frequency,
        dominant_power_ratio,
    ])
}

/// Population mean and standard deviation; zeros for an empty slice.
fn mean_std(values: &[f32]) -> (f32, f32) {
    let n = values.len() as f32;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f32>() / n;
    let variance = values
        .iter()
        .map(|&x| {
            let diff = x - mean;
            diff * diff
        })
        .sum::<f32>()
        / n;
    (mean, variance.sqrt())
}

fn create_hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos()))
        .collect()
}

/// Strongest non-DC frequency of the magnitude signal and its share of the
/// total spectral power.
fn dominant_frequency(
    magnitudes: &[f32],
    mean: f32,
    sample_rate: f32,
    planner: &mut FftPlanner<f32>,
) -> (f32, f32) {
    let n = magnitudes.len();
    if n < 4 {
        return (0.0, 0.0);
    }

    let window = create_hann_window(n);
    let mut buffer: Vec<Complex<f32>> = magnitudes
        .iter()
        .zip(window.iter())
        .map(|(&m, &w)| Complex::new((m - mean) * w, 0.0))
        .collect();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    let freq_resolution = sample_rate / n as f32;
    let mut total_power = 0.0f32;
    let mut peak_power = 0.0f32;
    let mut peak_bin = 0usize;
    for (bin, value) in buffer.iter().enumerate().take(n / 2 + 1).skip(1) {
        let power = value.norm_sqr();
        total_power += power;
        if power > peak_power {
            peak_power = power;
            peak_bin = bin;
        }
    }

    if total_power <= f32::EPSILON {
        return (0.0, 0.0);
    }
    (peak_bin as f32 * freq_resolution, peak_power / total_power)
}
