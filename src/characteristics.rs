use crate::classification::{ActivityLabel, ClassifiedSeries};
use chrono::{DateTime, Utc};
use std::fmt;

/// Summary metrics of a classified series, in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    AverageActivityLevel,
    ActivityLevelStd,
    TotalChunks,
    ClassifiedChunks,
    UnclassifiableChunks,
    SedentaryChunks,
    LightChunks,
    ModerateChunks,
    VigorousChunks,
    SedentaryFraction,
    LightFraction,
    ModerateFraction,
    VigorousFraction,
    SedentaryMinutes,
    LightMinutes,
    ModerateMinutes,
    VigorousMinutes,
    MvpaMinutes,
    ValidMinutes,
    TotalMinutes,
    LongestSedentaryBoutMinutes,
    ActivityTransitions,
}

impl Metric {
    pub const ALL: [Metric; 22] = [
        Metric::AverageActivityLevel,
        Metric::ActivityLevelStd,
        Metric::TotalChunks,
        Metric::ClassifiedChunks,
        Metric::UnclassifiableChunks,
        Metric::SedentaryChunks,
        Metric::LightChunks,
        Metric::ModerateChunks,
        Metric::VigorousChunks,
        Metric::SedentaryFraction,
        Metric::LightFraction,
        Metric::ModerateFraction,
        Metric::VigorousFraction,
        Metric::SedentaryMinutes,
        Metric::LightMinutes,
        Metric::ModerateMinutes,
        Metric::VigorousMinutes,
        Metric::MvpaMinutes,
        Metric::ValidMinutes,
        Metric::TotalMinutes,
        Metric::LongestSedentaryBoutMinutes,
        Metric::ActivityTransitions,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn name(self) -> &'static str {
        match self {
            Metric::AverageActivityLevel => "average_activity_level",
            Metric::ActivityLevelStd => "activity_level_std",
            Metric::TotalChunks => "total_chunks",
            Metric::ClassifiedChunks => "classified_chunks",
            Metric::UnclassifiableChunks => "unclassifiable_chunks",
            Metric::SedentaryChunks => "sedentary_chunks",
            Metric::LightChunks => "light_chunks",
            Metric::ModerateChunks => "moderate_chunks",
            Metric::VigorousChunks => "vigorous_chunks",
            Metric::SedentaryFraction => "sedentary_fraction",
            Metric::LightFraction => "light_fraction",
            Metric::ModerateFraction => "moderate_fraction",
            Metric::VigorousFraction => "vigorous_fraction",
            Metric::SedentaryMinutes => "sedentary_minutes",
            Metric::LightMinutes => "light_minutes",
            Metric::ModerateMinutes => "moderate_minutes",
            Metric::VigorousMinutes => "vigorous_minutes",
            Metric::MvpaMinutes => "mvpa_minutes",
            Metric::ValidMinutes => "valid_minutes",
            Metric::TotalMinutes => "total_minutes",
            Metric::LongestSedentaryBoutMinutes => "longest_sedentary_bout_minutes",
            Metric::ActivityTransitions => "activity_transitions",
        }
    }

    pub fn from_name(name: &str) -> Option<Metric> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }

    fn chunks_of(label: ActivityLabel) -> Metric {
        match label {
            ActivityLabel::Sedentary => Metric::SedentaryChunks,
            ActivityLabel::Light => Metric::LightChunks,
            ActivityLabel::Moderate => Metric::ModerateChunks,
            ActivityLabel::Vigorous => Metric::VigorousChunks,
            ActivityLabel::Unclassifiable => Metric::UnclassifiableChunks,
        }
    }

    fn fraction_of(label: ActivityLabel) -> Option<Metric> {
        match label {
            ActivityLabel::Sedentary => Some(Metric::SedentaryFraction),
            ActivityLabel::Light => Some(Metric::LightFraction),
            ActivityLabel::Moderate => Some(Metric::ModerateFraction),
            ActivityLabel::Vigorous => Some(Metric::VigorousFraction),
            ActivityLabel::Unclassifiable => None,
        }
    }

    fn minutes_of(label: ActivityLabel) -> Option<Metric> {
        match label {
            ActivityLabel::Sedentary => Some(Metric::SedentaryMinutes),
            ActivityLabel::Light => Some(Metric::LightMinutes),
            ActivityLabel::Moderate => Some(Metric::ModerateMinutes),
            ActivityLabel::Vigorous => Some(Metric::VigorousMinutes),
            ActivityLabel::Unclassifiable => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metric values; `None` means no data.
#[derive(Debug, Clone, PartialEq)]
pub struct Characteristics {
    values: [Option<f64>; Metric::COUNT],
}

impl Default for Characteristics {
    fn default() -> Self {
        Self {
            values: [None; Metric::COUNT],
        }
    }
}

impl Characteristics {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values[metric.index()]
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        self.values[metric.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, Option<f64>)> + '_ {
        Metric::ALL.into_iter().map(move |m| (m, self.get(m)))
    }
}

/// Computes every metric of a series. Counts and durations of an empty
/// series are zero, averages and fractions are `None`.
pub fn summarize(series: &ClassifiedSeries) -> Characteristics {
    let mut out = Characteristics::default();

    let levels: Vec<f64> = series
        .labels()
        .filter_map(|l| l.level())
        .map(f64::from)
        .collect();
    let classified = levels.len();

    if classified > 0 {
        let mean = levels.iter().sum::<f64>() / classified as f64;
        let variance = levels.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / classified as f64;
        out.set(Metric::AverageActivityLevel, Some(mean));
        out.set(Metric::ActivityLevelStd, Some(variance.sqrt()));
    }

    out.set(Metric::TotalChunks, Some(series.len() as f64));
    out.set(Metric::ClassifiedChunks, Some(classified as f64));

    let mut total_minutes = 0.0;
    let mut valid_minutes = 0.0;
    for label in ActivityLabel::SCORED
        .iter()
        .chain(std::iter::once(&ActivityLabel::Unclassifiable))
    {
        let chunks: Vec<_> = series.chunks.iter().filter(|c| c.label == *label).collect();
        let minutes = chunks.iter().map(|c| c.chunk.seconds as f64).sum::<f64>() / 60.0;
        total_minutes += minutes;

        out.set(Metric::chunks_of(*label), Some(chunks.len() as f64));
        if let Some(metric) = Metric::minutes_of(*label) {
            valid_minutes += minutes;
            out.set(metric, Some(minutes));
        }
        if let Some(metric) = Metric::fraction_of(*label) {
            let fraction = (classified > 0).then(|| chunks.len() as f64 / classified as f64);
            out.set(metric, fraction);
        }
    }

    let mvpa = out.get(Metric::ModerateMinutes).unwrap_or(0.0)
        + out.get(Metric::VigorousMinutes).unwrap_or(0.0);
    out.set(Metric::MvpaMinutes, Some(mvpa));
    out.set(Metric::ValidMinutes, Some(valid_minutes));
    out.set(Metric::TotalMinutes, Some(total_minutes));
    out.set(
        Metric::LongestSedentaryBoutMinutes,
        Some(longest_sedentary_bout(series)),
    );
    out.set(
        Metric::ActivityTransitions,
        Some(activity_transitions(series) as f64),
    );
    out
}

/// Longest run of back-to-back sedentary chunks, in minutes. A gap in time
/// (removed not-worn data) ends the bout.
fn longest_sedentary_bout(series: &ClassifiedSeries) -> f64 {
    let mut longest = 0.0f64;
    let mut current = 0.0f64;
    let mut previous_end = None;

    for c in &series.chunks {
        let contiguous = previous_end.map_or(true, |end| end == c.chunk.start);
        if c.label == ActivityLabel::Sedentary {
            if !contiguous {
                current = 0.0;
            }
            current += c.chunk.seconds as f64 / 60.0;
            longest = longest.max(current);
        } else {
            current = 0.0;
        }
        previous_end = Some(c.chunk.end);
    }
    longest
}

/// Level changes between consecutive scored chunks.
fn activity_transitions(series: &ClassifiedSeries) -> usize {
    let levels: Vec<_> = series.labels().filter_map(|l| l.level()).collect();
    levels.windows(2).filter(|w| w[0] != w[1]).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PainStatus {
    Matched,
    #[default]
    Missing,
}

impl PainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PainStatus::Matched => "matched",
            PainStatus::Missing => "missing",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "matched" => Some(PainStatus::Matched),
            "missing" => Some(PainStatus::Missing),
            _ => None,
        }
    }
}

pub const PAIN_COLUMNS: [&str; 4] = ["pain_score", "pain_min", "pain_max", "pain_reports"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PainFields {
    pub score: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub reports: Option<f64>,
}

impl PainFields {
    fn values(&self) -> [Option<f64>; 4] {
        [self.score, self.min, self.max, self.reports]
    }

    fn slot(&mut self, name: &str) -> Option<&mut Option<f64>> {
        match name {
            "pain_score" => Some(&mut self.score),
            "pain_min" => Some(&mut self.min),
            "pain_max" => Some(&mut self.max),
            "pain_reports" => Some(&mut self.reports),
            _ => None,
        }
    }
}

/// Who and what a record describes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordIdentity {
    pub subject: String,
    pub day: String,
    /// Samples of the span after resampling, worn or not
    pub samples: usize,
    pub not_worn_samples: usize,
    /// Source identifier of the recording
    pub name: String,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Epoch label, `None` for day records
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicsRecord {
    pub identity: RecordIdentity,
    pub characteristics: Characteristics,
    pub pain_status: PainStatus,
    pub pain: PainFields,
}

pub fn aggregate(identity: RecordIdentity, series: &ClassifiedSeries) -> CharacteristicsRecord {
    CharacteristicsRecord {
        identity,
        characteristics: summarize(series),
        pain_status: PainStatus::Missing,
        pain: PainFields::default(),
    }
}

impl CharacteristicsRecord {
    /// Numeric column names: characteristics followed by pain fields.
    pub fn metric_columns() -> impl Iterator<Item = &'static str> {
        Metric::ALL
            .into_iter()
            .map(Metric::name)
            .chain(PAIN_COLUMNS)
    }

    /// Values in `metric_columns` order.
    pub fn metric_values(&self) -> Vec<Option<f64>> {
        self.characteristics
            .iter()
            .map(|(_, v)| v)
            .chain(self.pain.values())
            .collect()
    }

    /// Returns false when `name` is not a metric column.
    pub fn set_metric(&mut self, name: &str, value: Option<f64>) -> bool {
        if let Some(metric) = Metric::from_name(name) {
            self.characteristics.set(metric, value);
            return true;
        }
        match self.pain.slot(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn round_metrics(&mut self, decimals: u32) {
        for metric in Metric::ALL {
            let value = self.characteristics.get(metric).map(|v| round_to(v, decimals));
            self.characteristics.set(metric, value);
        }
        for name in PAIN_COLUMNS {
            if let Some(slot) = self.pain.slot(name) {
                *slot = slot.map(|v| round_to(v, decimals));
            }
        }
    }
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let rounded = (value * factor).round() / factor;
    // Avoid writing "-0"
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}
