use crate::characteristics::{CharacteristicsRecord, PainFields, PainStatus};
use crate::error::AnnotationError;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::debug;
use std::io::Read;
use std::path::Path;

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y%m%d", "%d-%m-%Y", "%d/%m/%Y"];

/// One self-reported pain score.
#[derive(Debug, Clone, PartialEq)]
pub struct PainScore {
    pub date: NaiveDate,
    /// `"HH:MM"`, absent for once-a-day reports
    pub time: Option<String>,
    pub score: f64,
}

/// All pain scores of one subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PainTable {
    scores: Vec<PainScore>,
}

impl PainTable {
    pub fn new(scores: Vec<PainScore>) -> Self {
        Self { scores }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open pain scores {}", path.display()))?;
        let table = Self::from_reader(file)
            .with_context(|| format!("Failed to read pain scores {}", path.display()))?;
        debug!("Loaded {} pain scores from {}", table.len(), path.display());
        Ok(table)
    }

    /// Reads a CSV with a `date` column, an optional `time` column and a
    /// `score` (or `pain_score`) column. Other columns are ignored.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = reader.headers()?.clone();
        let date_col =
            find_column(&headers, &["date"]).ok_or_else(|| anyhow!("missing date column"))?;
        let score_col = find_column(&headers, &["score", "pain_score"])
            .ok_or_else(|| anyhow!("missing score column"))?;
        let time_col = find_column(&headers, &["time"]);

        let mut scores = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let row = line + 2;
            let date_text = record.get(date_col).unwrap_or_default();
            let date = parse_day(date_text)
                .ok_or_else(|| anyhow!("row {}: invalid date {:?}", row, date_text))?;
            let score_text = record.get(score_col).unwrap_or_default();
            let score: f64 = score_text
                .parse()
                .with_context(|| format!("row {}: invalid score {:?}", row, score_text))?;
            let time = match time_col.and_then(|c| record.get(c)).filter(|t| !t.is_empty()) {
                Some(text) => Some(
                    normalise_time(text).map_err(|e| anyhow!("row {}: {}", row, e))?,
                ),
                None => None,
            };
            scores.push(PainScore { date, time, score });
        }
        Ok(Self { scores })
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn scores(&self) -> &[PainScore] {
        &self.scores
    }

    /// Scores on `date`, restricted to `time` when given.
    pub fn lookup<'a>(
        &'a self,
        date: NaiveDate,
        time: Option<&'a str>,
    ) -> impl Iterator<Item = &'a PainScore> + 'a {
        self.scores.iter().filter(move |s| {
            s.date == date && time.map_or(true, |t| s.time.as_deref() == Some(t))
        })
    }
}

fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
}

/// Parses a day directory name as a calendar date.
pub fn parse_day(day: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(day, format).ok())
}

/// `"H:MM"` and `"HH:MM:SS"` become `"HH:MM"`.
fn normalise_time(text: &str) -> Result<String, AnnotationError> {
    NaiveTime::parse_from_str(text, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M:%S"))
        .map(|t| t.format("%H:%M").to_string())
        .map_err(|_| AnnotationError::MalformedTime(text.to_string()))
}

/// Start time of an epoch as `"HH:00"`, taken from the start hour of its
/// key (`"10_12"`, `"d1_10_12"`).
pub fn epoch_time_of_day(key: &str) -> Result<String, AnnotationError> {
    let parts: Vec<&str> = key.split('_').collect();
    let hour = parts
        .len()
        .checked_sub(2)
        .and_then(|i| parts[i].parse::<u32>().ok())
        .filter(|h| *h < 24)
        .ok_or_else(|| AnnotationError::MalformedEpochKey(key.to_string()))?;
    Ok(format!("{:02}:00", hour))
}

/// Day to join an epoch's pain score on. Epochs starting on the day's own
/// date keep `day`; epochs past midnight use their start date.
pub fn epoch_day(day: &str, begin_time: DateTime<Utc>, epoch_start: DateTime<Utc>) -> String {
    let day_date = parse_day(day).unwrap_or_else(|| begin_time.date_naive());
    let epoch_date = epoch_start.date_naive();
    if epoch_date == day_date {
        day.to_string()
    } else {
        epoch_date.format("%Y-%m-%d").to_string()
    }
}

/// Joins pain scores into `record`. Without a match the record is kept
/// with its pain fields empty and the status set to missing.
pub fn annotate(
    table: &PainTable,
    record: &mut CharacteristicsRecord,
    day: &str,
    time: Option<&str>,
) -> Result<(), AnnotationError> {
    let date = parse_day(day).unwrap_or_else(|| record.identity.begin_time.date_naive());
    let scores: Vec<f64> = table.lookup(date, time).map(|s| s.score).collect();

    if scores.is_empty() {
        record.pain_status = PainStatus::Missing;
        record.pain = PainFields::default();
        return Err(AnnotationError::NoMatch {
            date,
            time: time.map(str::to_string),
        });
    }

    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    record.pain = PainFields {
        score: Some(mean),
        min: Some(min),
        max: Some(max),
        reports: Some(scores.len() as f64),
    };
    record.pain_status = PainStatus::Matched;
    Ok(())
}
