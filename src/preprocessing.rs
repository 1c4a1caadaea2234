use crate::config::{PipelineConfig, WornRule};
use crate::{period_from_rate, SensorSample, SensorStream};
use chrono::Duration;
use log::{debug, trace};
use sci_rs::signal::filter::{design::Sos, sosfiltfilt_dyn};
use std::f32::consts::PI;

/// Shorter streams are not filtered; sosfiltfilt needs room for its padding
const MIN_FILTER_SAMPLES: usize = 64;

/// Result of cleaning one stream. `worn_mask` runs parallel to the
/// resampled stream, `stream` holds only its worn samples.
#[derive(Debug, Clone)]
pub struct CleanedStream {
    pub stream: SensorStream,
    pub worn_mask: Vec<bool>,
    pub not_worn_count: usize,
    /// Length of the resampled stream before not-worn samples were removed
    pub total_samples: usize,
}

impl CleanedStream {
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }
}

/// Resample to the canonical rate and drop samples recorded off the body.
pub fn clean(stream: &SensorStream, config: &PipelineConfig) -> CleanedStream {
    let resampled = downsample(stream, config.sample_rate);
    let worn_mask = detect_worn(&resampled, &config.worn_rule, config.sample_rate);

    let samples: Vec<SensorSample> = resampled
        .samples
        .iter()
        .zip(&worn_mask)
        .filter(|(_, worn)| **worn)
        .map(|(s, _)| *s)
        .collect();
    let total_samples = resampled.len();
    let not_worn_count = total_samples - samples.len();

    debug!(
        "{}: {} of {} samples not worn",
        stream.source, not_worn_count, total_samples
    );

    CleanedStream {
        stream: SensorStream {
            source: resampled.source,
            nominal_rate: resampled.nominal_rate,
            samples,
        },
        worn_mask,
        not_worn_count,
        total_samples,
    }
}

/// Averages samples into buckets of one target period, anchored at the
/// first sample. A stream already on that grid comes back unchanged.
pub fn downsample(stream: &SensorStream, target_rate: f32) -> SensorStream {
    let mut out = SensorStream::new(stream.source.clone(), Vec::new()).with_rate(target_rate);
    let Some(origin) = stream.first_timestamp() else {
        return out;
    };

    let period = period_from_rate(target_rate);
    let period_ns = period.num_nanoseconds().unwrap_or(i64::MAX).max(1);

    // Anti-aliasing only when there is something to remove
    let source_rate = stream.effective_rate().unwrap_or(target_rate);
    let filtered = if source_rate > target_rate * 1.5 && stream.len() >= MIN_FILTER_SAMPLES {
        let cutoff = 0.8 * target_rate / 2.0;
        trace!(
            "Low-pass filtering {} at {:.2} Hz (source {:.2} Hz)",
            stream.source,
            cutoff,
            source_rate
        );
        Some([
            low_pass(&axis_values(&stream.samples, |s| s.x), cutoff, source_rate),
            low_pass(&axis_values(&stream.samples, |s| s.y), cutoff, source_rate),
            low_pass(&axis_values(&stream.samples, |s| s.z), cutoff, source_rate),
        ])
    } else {
        None
    };

    let mut bucket = Bucket::default();
    for (i, sample) in stream.samples.iter().enumerate() {
        let offset = (sample.timestamp - origin).num_nanoseconds().unwrap_or(i64::MAX);
        let index = offset / period_ns;
        let (x, y, z) = match &filtered {
            Some([fx, fy, fz]) => (fx[i], fy[i], fz[i]),
            None => (sample.x, sample.y, sample.z),
        };

        if bucket.count > 0 && index != bucket.index {
            out.samples.push(bucket.finish(origin, period_ns));
            bucket = Bucket::default();
        }
        bucket.index = index;
        bucket.add(x, y, z, sample.worn);
    }
    if bucket.count > 0 {
        out.samples.push(bucket.finish(origin, period_ns));
    }
    out
}

#[derive(Default)]
struct Bucket {
    index: i64,
    count: usize,
    sum: [f64; 3],
    flagged_off: bool,
    flagged_on: bool,
}

impl Bucket {
    fn add(&mut self, x: f32, y: f32, z: f32, worn: Option<bool>) {
        self.count += 1;
        self.sum[0] += x as f64;
        self.sum[1] += y as f64;
        self.sum[2] += z as f64;
        match worn {
            Some(false) => self.flagged_off = true,
            Some(true) => self.flagged_on = true,
            None => {}
        }
    }

    fn finish(&self, origin: chrono::DateTime<chrono::Utc>, period_ns: i64) -> SensorSample {
        let n = self.count as f64;
        let worn = if self.flagged_off {
            Some(false)
        } else if self.flagged_on {
            Some(true)
        } else {
            None
        };
        SensorSample::new(
            origin + Duration::nanoseconds(self.index.saturating_mul(period_ns)),
            (self.sum[0] / n) as f32,
            (self.sum[1] / n) as f32,
            (self.sum[2] / n) as f32,
        )
        .with_worn(worn)
    }
}

fn axis_values(samples: &[SensorSample], axis: impl Fn(&SensorSample) -> f32) -> Vec<f32> {
    samples.iter().map(axis).collect()
}

/// Second order Butterworth low-pass coefficients (bilinear transform).
fn design_low_pass(cutoff: f32, sample_rate: f32) -> (Vec<f32>, Vec<f32>) {
    let w0 = 2.0 * PI * cutoff / sample_rate;
    let q = std::f32::consts::FRAC_1_SQRT_2;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let a0 = 1.0 + alpha;

    let b = vec![
        (1.0 - cos_w0) / 2.0 / a0,
        (1.0 - cos_w0) / a0,
        (1.0 - cos_w0) / 2.0 / a0,
    ];
    let a = vec![1.0, -2.0 * cos_w0 / a0, (1.0 - alpha) / a0];
    (b, a)
}

/// Zero-phase low-pass filter
pub fn low_pass(data: &[f32], cutoff: f32, sample_rate: f32) -> Vec<f32> {
    if data.len() < MIN_FILTER_SAMPLES || cutoff <= 0.0 || cutoff >= sample_rate / 2.0 {
        return data.to_vec();
    }
    let (b, a) = design_low_pass(cutoff, sample_rate);
    let sos_array = vec![Sos::new([b[0], b[1], b[2]], [a[0], a[1], a[2]])];
    sosfiltfilt_dyn(data.iter(), &sos_array)
}

/// Marks each sample worn (`true`) or not worn (`false`). A device flag of
/// `Some(false)` always wins.
pub fn detect_worn(stream: &SensorStream, rule: &WornRule, sample_rate: f32) -> Vec<bool> {
    let mut mask: Vec<bool> = stream
        .samples
        .iter()
        .map(|s| s.worn != Some(false))
        .collect();

    let WornRule::RollingStd {
        window_seconds,
        std_threshold,
        range_threshold,
        min_axes,
    } = rule
    else {
        return mask;
    };

    let window = ((window_seconds * sample_rate).round() as usize).max(1);
    for range in window_ranges(stream.len(), window) {
        let still_axes = axis_spread(&stream.samples[range.clone()])
            .iter()
            .filter(|(std, spread)| *std < *std_threshold && *spread < *range_threshold)
            .count();
        if still_axes >= *min_axes {
            trace!(
                "{}: samples {}..{} look not worn",
                stream.source,
                range.start,
                range.end
            );
            mask[range].iter_mut().for_each(|m| *m = false);
        }
    }
    mask
}

/// Consecutive windows over `len` samples; a short trailing window is merged
/// into the one before it.
fn window_ranges(len: usize, window: usize) -> Vec<std::ops::Range<usize>> {
    let mut ranges: Vec<_> = (0..len)
        .step_by(window)
        .map(|start| start..(start + window).min(len))
        .collect();
    if ranges.len() > 1 {
        let last = ranges[ranges.len() - 1].clone();
        if last.len() < window / 2 {
            ranges.pop();
            if let Some(prev) = ranges.last_mut() {
                prev.end = last.end;
            }
        }
    }
    ranges
}

/// Standard deviation and value range per axis
fn axis_spread(samples: &[SensorSample]) -> [(f32, f32); 3] {
    let stats = |values: Vec<f32>| -> (f32, f32) {
        let n = values.len() as f64;
        if n == 0.0 {
            return (0.0, 0.0);
        }
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = values
            .iter()
            .map(|&v| {
                let diff = v as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / n;
        let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        (variance.sqrt() as f32, max - min)
    };

    [
        stats(axis_values(samples, |s| s.x)),
        stats(axis_values(samples, |s| s.y)),
        stats(axis_values(samples, |s| s.z)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    fn config(rate: f32, window_seconds: f32) -> PipelineConfig {
        PipelineConfig {
            sample_rate: rate,
            worn_rule: WornRule::RollingStd {
                window_seconds,
                std_threshold: 0.013,
                range_threshold: 0.05,
                min_axes: 2,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_downsample_averages_buckets() {
        let stream = active_stream(at(8, 0, 0), 10, 4.0);
        let mut unfiltered = stream.clone();
        // Below the filter threshold so the bucket means are exact
        unfiltered.samples.truncate(40);
        let out = downsample(&unfiltered, 1.0);
        assert_eq!(out.len(), 10);
        assert_eq!(out.nominal_rate, Some(1.0));
        assert_eq!(out.samples[0].timestamp, at(8, 0, 0));
        let expected_x = unfiltered.samples[..4].iter().map(|s| s.x).sum::<f32>() / 4.0;
        assert!((out.samples[0].x - expected_x).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_is_idempotent_on_grid() {
        let stream = active_stream(at(8, 0, 0), 300, 1.0);
        let once = downsample(&stream, 1.0);
        let twice = downsample(&once, 1.0);
        assert_eq!(once.samples, twice.samples);
        assert_eq!(once.samples, stream.samples);
    }

    #[test]
    fn test_downsample_keeps_first_timestamp_across_gaps() {
        let mut stream = active_stream(at(8, 0, 0), 100, 10.0);
        stream.samples.drain(200..700);
        let out = downsample(&stream, 1.0);
        assert_eq!(out.first_timestamp(), Some(at(8, 0, 0)));
        assert_eq!(out.last_timestamp(), Some(at(8, 1, 39)));
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn test_low_pass_removes_fast_oscillation() {
        let rate = 50.0;
        let signal: Vec<f32> = (0..500)
            .map(|i| (2.0 * PI * 20.0 * i as f32 / rate).sin())
            .collect();
        let filtered = low_pass(&signal, 2.0, rate);
        assert_eq!(filtered.len(), signal.len());
        let peak = filtered[100..400].iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(peak < 0.1, "residual amplitude {}", peak);
    }

    #[test]
    fn test_clean_removes_resting_period() {
        let mut stream = active_stream(at(8, 0, 0), 600, 1.0);
        let rest = resting_stream(at(8, 10, 0), 600, 1.0);
        stream.samples.extend(rest.samples);

        let cleaned = clean(&stream, &config(1.0, 60.0));
        assert_eq!(cleaned.total_samples, 1200);
        assert_eq!(cleaned.not_worn_count, 600);
        assert_eq!(cleaned.stream.len(), 600);
        assert_eq!(cleaned.worn_mask.len(), 1200);
        assert!(cleaned.stream.samples.iter().all(|s| s.timestamp < at(8, 10, 0)));
    }

    #[test]
    fn test_all_not_worn_is_empty_but_valid() {
        let stream = resting_stream(at(8, 0, 0), 3600, 1.0);
        let cleaned = clean(&stream, &config(1.0, 1800.0));
        assert!(cleaned.is_empty());
        assert_eq!(cleaned.not_worn_count, cleaned.total_samples);
        assert_eq!(cleaned.total_samples, 3600);
    }

    #[test]
    fn test_empty_input_is_valid() {
        let stream = SensorStream::new("empty", Vec::new());
        let cleaned = clean(&stream, &PipelineConfig::default());
        assert!(cleaned.is_empty());
        assert_eq!(cleaned.not_worn_count, 0);
        assert_eq!(cleaned.total_samples, 0);
    }

    #[test]
    fn test_vendor_flag_always_marks_not_worn() {
        let mut stream = active_stream(at(8, 0, 0), 60, 1.0);
        stream.samples[5].worn = Some(false);
        let mask = detect_worn(&stream, &WornRule::VendorFlag, 1.0);
        assert_eq!(mask.iter().filter(|w| !**w).count(), 1);
        assert!(!mask[5]);
    }

    #[test]
    fn test_short_trailing_window_is_merged() {
        assert_eq!(window_ranges(24, 10), vec![0..10, 10..24]);
        // Half a window is long enough to stand alone
        assert_eq!(window_ranges(25, 10), vec![0..10, 10..20, 20..25]);
        assert_eq!(window_ranges(26, 10), vec![0..10, 10..20, 20..26]);
        assert_eq!(window_ranges(3, 10), vec![0..3]);
        assert!(window_ranges(0, 10).is_empty());
    }
}
