mod common;

use activity_decoder::classification::chunk_ranges;
use activity_decoder::config::{PipelineConfig, TrailingChunkPolicy, WornRule};
use activity_decoder::epochs::split;
use activity_decoder::preprocessing::{clean, downsample};
use activity_decoder::{SensorSample, SensorStream};
use chrono::Duration;
use common::at;
use proptest::prelude::*;

fn policy() -> impl Strategy<Value = TrailingChunkPolicy> {
    prop_oneof![
        Just(TrailingChunkPolicy::Drop),
        Just(TrailingChunkPolicy::Pad),
        Just(TrailingChunkPolicy::Reduced),
    ]
}

/// Irregular samples: (gap in ms, x, y, z, worn flag).
fn samples() -> impl Strategy<Value = Vec<(i64, f32, f32, f32, Option<bool>)>> {
    prop::collection::vec(
        (
            20i64..1500,
            -2.0f32..2.0,
            -2.0f32..2.0,
            -2.0f32..2.0,
            prop_oneof![Just(None), Just(Some(true)), Just(Some(false))],
        ),
        0..400,
    )
}

fn build_stream(raw: &[(i64, f32, f32, f32, Option<bool>)]) -> SensorStream {
    let mut t = at(1, 8, 0);
    let samples = raw
        .iter()
        .map(|&(gap, x, y, z, worn)| {
            t = t + Duration::milliseconds(gap);
            SensorSample::new(t, x, y, z).with_worn(worn)
        })
        .collect();
    SensorStream::new("prop", samples)
}

fn short_window_config() -> PipelineConfig {
    PipelineConfig {
        sample_rate: 2.0,
        worn_rule: WornRule::RollingStd {
            window_seconds: 30.0,
            std_threshold: 0.013,
            range_threshold: 0.05,
            min_axes: 2,
        },
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn epoch_durations_cover_the_recording(
        start_minute in 0i64..1440,
        minutes in 0i64..3000,
        epoch_hours in 1u32..4,
    ) {
        let begin = at(1, 0, 0) + Duration::minutes(start_minute);
        let end = begin + Duration::minutes(minutes);
        let config = PipelineConfig { epoch_hours, ..Default::default() };
        let epochs = split(&SensorStream::default(), begin, end, &config);

        let total = epochs.values().fold(Duration::zero(), |acc, e| acc + e.duration());
        prop_assert_eq!(total, end - begin);

        let starts: Vec<_> = epochs.keys().map(|k| k.start()).collect();
        prop_assert!(starts.windows(2).all(|w| w[0] < w[1]));
        let mut labels: Vec<_> = epochs.keys().map(|k| k.label().to_string()).collect();
        let count = labels.len();
        labels.sort();
        labels.dedup();
        prop_assert_eq!(labels.len(), count);
    }

    #[test]
    fn cleaning_accounts_for_every_resampled_sample(raw in samples()) {
        let stream = build_stream(&raw);
        let config = short_window_config();
        let cleaned = clean(&stream, &config);
        let resampled = downsample(&stream, config.sample_rate);

        prop_assert_eq!(cleaned.total_samples, resampled.len());
        prop_assert_eq!(cleaned.not_worn_count + cleaned.stream.len(), cleaned.total_samples);
        prop_assert_eq!(cleaned.worn_mask.len(), cleaned.total_samples);
    }

    #[test]
    fn downsampling_is_idempotent(raw in samples()) {
        let once = downsample(&build_stream(&raw), 2.0);
        let twice = downsample(&once, 2.0);
        prop_assert_eq!(once.samples, twice.samples);
    }

    #[test]
    fn chunking_is_deterministic_and_aligned(
        len in 0usize..5000,
        chunk_len in 1usize..700,
        policy in policy(),
    ) {
        let base_unit = (chunk_len / 6).max(1);
        let first = chunk_ranges(len, chunk_len, base_unit, policy);
        prop_assert_eq!(&first, &chunk_ranges(len, chunk_len, base_unit, policy));

        for (i, range) in first.iter().enumerate() {
            prop_assert_eq!(range.start, i * chunk_len);
            prop_assert!(range.len() <= chunk_len);
            prop_assert!(range.end <= len);
        }
        let full = len / chunk_len;
        let expected = match policy {
            TrailingChunkPolicy::Drop => full,
            TrailingChunkPolicy::Pad => full + usize::from(len % chunk_len > 0),
            TrailingChunkPolicy::Reduced => full + usize::from(len % chunk_len >= base_unit),
        };
        prop_assert_eq!(first.len(), expected);
    }
}
