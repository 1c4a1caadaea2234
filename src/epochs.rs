use crate::config::PipelineConfig;
use crate::SensorStream;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one epoch. Ordered by start time, displayed as its label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochKey {
    start: DateTime<Utc>,
    label: String,
}

impl EpochKey {
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for EpochKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone)]
pub struct Epoch {
    pub key: EpochKey,
    pub start: DateTime<Utc>,
    /// Exclusive; earlier than `start + epoch_length` for a trailing epoch
    pub end: DateTime<Utc>,
    pub stream: SensorStream,
}

impl Epoch {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_partial(&self, config: &PipelineConfig) -> bool {
        self.duration() < config.epoch_length()
    }
}

/// Cuts `[begin_time, end_time)` into epochs of `config.epoch_hours`,
/// anchored at `begin_time`. Every slot is returned, also the ones
/// without samples.
pub fn split(
    stream: &SensorStream,
    begin_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    config: &PipelineConfig,
) -> BTreeMap<EpochKey, Epoch> {
    let length = config.epoch_length();
    let multi_day = end_time - begin_time > Duration::days(1);
    let mut epochs = BTreeMap::new();

    let mut start = begin_time;
    while start < end_time {
        let end = (start + length).min(end_time);
        let key = EpochKey {
            start,
            label: epoch_label(begin_time, start, end, multi_day),
        };
        let mut content = stream.slice_between(start, end);
        content.source = format!("{}#{}", stream.source, key.label);

        epochs.insert(
            key.clone(),
            Epoch {
                key,
                start,
                end,
                stream: content,
            },
        );
        start = end;
    }
    epochs
}

/// `"08_10"`, or `"d1_08_10"` for an epoch starting one calendar day after
/// the recording began when the recording spans more than a day.
fn epoch_label(
    begin_time: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    multi_day: bool,
) -> String {
    let hours = format!("{:02}_{:02}", start.hour(), end.hour());
    let day_offset = (start.date_naive() - begin_time.date_naive()).num_days();
    if multi_day && day_offset > 0 {
        format!("d{}_{}", day_offset, hours)
    } else {
        hours
    }
}
