use crate::characteristics::{round_to, CharacteristicsRecord, PainStatus, RecordIdentity};
use crate::characteristics::{Characteristics, PainFields};
use anyhow::{anyhow, bail, Context, Result};
use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMillisecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use ndarray::Array2;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SUBJECT: &str = "subject";
const DAY: &str = "day";
const SAMPLES: &str = "Samples";
const NOT_WORN: &str = "not_worn_samples";
const NAME: &str = "Name";
const BEGIN: &str = "begintime";
const END: &str = "endtime";
const KEY: &str = "key";
const PAIN_STATUS: &str = "pain_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Day,
    Epoch,
}

impl Track {
    pub fn file_stem(self) -> &'static str {
        match self {
            Track::Day => "results_days",
            Track::Epoch => "results_2hours",
        }
    }

    pub fn identity_columns(self) -> Vec<&'static str> {
        let mut columns = vec![SUBJECT, DAY, SAMPLES, NOT_WORN, NAME, BEGIN, END];
        if self == Track::Epoch {
            columns.push(KEY);
        }
        columns.push(PAIN_STATUS);
        columns
    }
}

/// Records of one track. Metrics are rounded on append.
#[derive(Debug, Clone)]
pub struct ResultTable {
    track: Track,
    decimals: u32,
    rows: Vec<CharacteristicsRecord>,
}

impl ResultTable {
    pub fn new(track: Track, decimals: u32) -> Self {
        Self {
            track,
            decimals,
            rows: Vec::new(),
        }
    }

    pub fn track(&self) -> Track {
        self.track
    }

    pub fn rows(&self) -> &[CharacteristicsRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn append(&mut self, mut record: CharacteristicsRecord) {
        record.round_metrics(self.decimals);
        self.rows.push(record);
    }

    /// Sorts rows by subject, day and start time.
    pub fn finalize(&mut self) {
        self.rows.sort_by(|a, b| {
            let (a, b) = (&a.identity, &b.identity);
            (&a.subject, &a.day, a.begin_time).cmp(&(&b.subject, &b.day, b.begin_time))
        });
    }

    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = self.track.identity_columns();
        columns.extend(CharacteristicsRecord::metric_columns());
        columns
    }

    fn identity_cells(&self, record: &CharacteristicsRecord) -> Vec<String> {
        let id = &record.identity;
        let mut cells = vec![
            id.subject.clone(),
            id.day.clone(),
            id.samples.to_string(),
            id.not_worn_samples.to_string(),
            id.name.clone(),
            format_time(id.begin_time),
            format_time(id.end_time),
        ];
        if self.track == Track::Epoch {
            cells.push(id.key.clone().unwrap_or_default());
        }
        cells.push(record.pain_status.as_str().to_string());
        cells
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writer.write_record(self.columns())?;
        for record in &self.rows {
            let mut cells = self.identity_cells(record);
            cells.extend(record.metric_values().into_iter().map(format_value));
            writer.write_record(&cells)?;
        }
        writer.flush()?;
        info!("Wrote {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }

    /// Loads a table written by `write_csv`.
    pub fn read_csv(path: &Path, track: Track, decimals: u32) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| anyhow!("{} has no column {}", path.display(), name))
        };
        let identity: Vec<usize> = track
            .identity_columns()
            .into_iter()
            .map(column)
            .collect::<Result<_>>()?;

        let mut table = Self::new(track, decimals);
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let cell = |i: usize| row.get(identity[i]).unwrap_or_default();
            let parse_err = |what: &str| anyhow!("row {}: invalid {}", line + 2, what);

            let (key, status) = match track {
                Track::Day => (None, cell(7)),
                Track::Epoch => (Some(cell(7).to_string()), cell(8)),
            };
            let mut record = CharacteristicsRecord {
                identity: RecordIdentity {
                    subject: cell(0).to_string(),
                    day: cell(1).to_string(),
                    samples: cell(2).parse().map_err(|_| parse_err(SAMPLES))?,
                    not_worn_samples: cell(3).parse().map_err(|_| parse_err(NOT_WORN))?,
                    name: cell(4).to_string(),
                    begin_time: parse_time(cell(5)).ok_or_else(|| parse_err(BEGIN))?,
                    end_time: parse_time(cell(6)).ok_or_else(|| parse_err(END))?,
                    key,
                },
                characteristics: Characteristics::default(),
                pain_status: PainStatus::parse(status).ok_or_else(|| parse_err(PAIN_STATUS))?,
                pain: PainFields::default(),
            };

            for (name, text) in headers.iter().zip(row.iter()) {
                if identity.iter().any(|&i| headers.get(i) == Some(name)) {
                    continue;
                }
                let value = if text.is_empty() {
                    None
                } else {
                    Some(text.parse::<f64>().map_err(|_| parse_err(name))?)
                };
                if !record.set_metric(name, value) {
                    bail!("{} has unknown column {}", path.display(), name);
                }
            }
            table.append(record);
        }
        Ok(table)
    }

    fn schema(&self) -> Schema {
        let timestamp = DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()));
        let mut fields = vec![
            Field::new(SUBJECT, DataType::Utf8, false),
            Field::new(DAY, DataType::Utf8, false),
            Field::new(SAMPLES, DataType::UInt64, false),
            Field::new(NOT_WORN, DataType::UInt64, false),
            Field::new(NAME, DataType::Utf8, false),
            Field::new(BEGIN, timestamp.clone(), false),
            Field::new(END, timestamp, false),
        ];
        if self.track == Track::Epoch {
            fields.push(Field::new(KEY, DataType::Utf8, false));
        }
        fields.push(Field::new(PAIN_STATUS, DataType::Utf8, false));
        fields.extend(
            CharacteristicsRecord::metric_columns().map(|name| Field::new(name, DataType::Float64, true)),
        );
        Schema::new(fields)
    }

    /// Writes the table as an Arrow IPC file; missing values become nulls.
    pub fn write_ipc(&self, path: &Path) -> Result<()> {
        let schema = Arc::new(self.schema());
        let ids: Vec<&RecordIdentity> = self.rows.iter().map(|r| &r.identity).collect();
        let strings = |f: fn(&RecordIdentity) -> &str| -> ArrayRef {
            Arc::new(StringArray::from(ids.iter().map(|id| f(id)).collect::<Vec<_>>()))
        };
        let times = |f: fn(&RecordIdentity) -> DateTime<Utc>| -> ArrayRef {
            Arc::new(
                TimestampMillisecondArray::from(
                    ids.iter().map(|id| f(id).timestamp_millis()).collect::<Vec<_>>(),
                )
                .with_timezone("UTC"),
            )
        };

        let mut columns: Vec<ArrayRef> = vec![
            strings(|id| &id.subject),
            strings(|id| &id.day),
            Arc::new(UInt64Array::from(
                ids.iter().map(|id| id.samples as u64).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                ids.iter().map(|id| id.not_worn_samples as u64).collect::<Vec<_>>(),
            )),
            strings(|id| &id.name),
            times(|id| id.begin_time),
            times(|id| id.end_time),
        ];
        if self.track == Track::Epoch {
            columns.push(strings(|id| id.key.as_deref().unwrap_or_default()));
        }
        columns.push(Arc::new(StringArray::from(
            self.rows
                .iter()
                .map(|r| r.pain_status.as_str())
                .collect::<Vec<_>>(),
        )));

        let metric_rows: Vec<Vec<Option<f64>>> = self.rows.iter().map(|r| r.metric_values()).collect();
        let metric_count = CharacteristicsRecord::metric_columns().count();
        for m in 0..metric_count {
            let values: Vec<Option<f64>> = metric_rows.iter().map(|row| row[m]).collect();
            columns.push(Arc::new(Float64Array::from(values)));
        }

        let batch = RecordBatch::try_new(schema.clone(), columns)?;
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = FileWriter::try_new(file, &schema)?;
        writer.write(&batch)?;
        writer.finish()?;
        info!("Wrote {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }

    /// Values of one metric column across rows.
    pub fn metric_column(&self, index: usize) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.metric_values()[index]).collect()
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Pearson correlations between the metric columns of a table.
#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    pub columns: Vec<&'static str>,
    /// NaN where a pair has fewer than two complete rows or no variance
    pub values: Array2<f64>,
}

impl CorrelationMatrix {
    pub fn from_table(table: &ResultTable) -> Self {
        let columns: Vec<&'static str> = CharacteristicsRecord::metric_columns().collect();
        let data: Vec<Vec<Option<f64>>> = (0..columns.len()).map(|i| table.metric_column(i)).collect();
        let n = columns.len();
        let mut values = Array2::from_elem((n, n), f64::NAN);
        for i in 0..n {
            for j in i..n {
                let mut r = pearson(&data[i], &data[j]);
                if i == j && !r.is_nan() {
                    r = 1.0;
                }
                values[[i, j]] = r;
                values[[j, i]] = r;
            }
        }
        Self { columns, values }
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.columns.iter().position(|c| *c == a)?;
        let j = self.columns.iter().position(|c| *c == b)?;
        let r = self.values[[i, j]];
        (!r.is_nan()).then_some(r)
    }

    pub fn write_csv(&self, path: &Path, decimals: u32) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut header = vec![""];
        header.extend(&self.columns);
        writer.write_record(&header)?;
        for (i, name) in self.columns.iter().enumerate() {
            let mut cells = vec![name.to_string()];
            cells.extend(self.values.row(i).iter().map(|&r| {
                format_value((!r.is_nan()).then(|| round_to(r, decimals)))
            }));
            writer.write_record(&cells)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Pairwise-complete Pearson correlation.
fn pearson(a: &[Option<f64>], b: &[Option<f64>]) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return f64::NAN;
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

/// Writes both tables in CSV and Arrow form plus the correlation matrix of
/// the day table. Returns the written paths.
pub fn write_results(
    dir: &Path,
    days: &ResultTable,
    epochs: &ResultTable,
    decimals: u32,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let mut written = Vec::new();
    for table in [days, epochs] {
        let csv_path = dir.join(format!("{}.csv", table.track().file_stem()));
        table.write_csv(&csv_path)?;
        written.push(csv_path);

        let ipc_path = dir.join(format!("{}.arrow", table.track().file_stem()));
        table.write_ipc(&ipc_path)?;
        written.push(ipc_path);
    }

    let correlations = dir.join("correlations.csv");
    CorrelationMatrix::from_table(days).write_csv(&correlations, decimals)?;
    written.push(correlations);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristics::Metric;
    use crate::test_support::at;
    use arrow::array::Array;
    use arrow::ipc::reader::FileReaderBuilder;

    fn record(subject: &str, hour: u32, level: Option<f64>, pain: Option<f64>) -> CharacteristicsRecord {
        let mut record = CharacteristicsRecord {
            identity: RecordIdentity {
                subject: subject.to_string(),
                day: "2024-03-01".to_string(),
                samples: 7200,
                not_worn_samples: 120,
                name: format!("{}/2024-03-01/rec.csv", subject),
                begin_time: at(hour, 0, 0),
                end_time: at(hour + 2, 0, 0),
                key: Some(format!("{:02}_{:02}", hour, hour + 2)),
            },
            characteristics: Characteristics::default(),
            pain_status: PainStatus::Missing,
            pain: PainFields::default(),
        };
        record.set_metric("average_activity_level", level);
        record.set_metric("total_chunks", Some(120.0));
        if pain.is_some() {
            record.pain_status = PainStatus::Matched;
            record.set_metric("pain_score", pain);
        }
        record
    }

    #[test]
    fn test_append_rounds_and_finalize_sorts() {
        let mut table = ResultTable::new(Track::Epoch, 3);
        table.append(record("S02", 8, Some(1.0), None));
        table.append(record("S01", 10, Some(2.0 / 3.0), None));
        table.append(record("S01", 8, None, Some(4.0)));
        table.finalize();

        let order: Vec<_> = table
            .rows()
            .iter()
            .map(|r| (r.identity.subject.as_str(), r.identity.key.as_deref().unwrap()))
            .collect();
        assert_eq!(order, [("S01", "08_10"), ("S01", "10_12"), ("S02", "08_10")]);
        assert_eq!(
            table.rows()[1].characteristics.get(Metric::AverageActivityLevel),
            Some(0.667)
        );
    }

    #[test]
    fn test_columns_partition() {
        let days = ResultTable::new(Track::Day, 3).columns();
        assert_eq!(days[..3], ["subject", "day", "Samples"]);
        assert_eq!(days[7], "pain_status");
        assert_eq!(days[8], "average_activity_level");
        assert_eq!(days.last(), Some(&"pain_reports"));

        let epochs = ResultTable::new(Track::Epoch, 3).columns();
        assert_eq!(epochs[7], "key");
        assert_eq!(epochs.len(), days.len() + 1);
    }

    #[test]
    fn test_csv_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results_2hours.csv");
        let mut table = ResultTable::new(Track::Epoch, 3);
        table.append(record("S01", 8, Some(1.23456), Some(4.5)));
        table.append(record("S01", 10, None, None));
        table.write_csv(&path).unwrap();

        let read = ResultTable::read_csv(&path, Track::Epoch, 3).unwrap();
        assert_eq!(read.rows(), table.rows());

        // Writing what was read changes nothing
        let again = dir.path().join("again.csv");
        read.write_csv(&again).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::fs::read_to_string(&again).unwrap()
        );
    }

    #[test]
    fn test_missing_values_are_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("days.csv");
        let mut table = ResultTable::new(Track::Day, 3);
        table.append(record("S01", 8, None, None));
        table.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.starts_with("S01,2024-03-01,7200,120,S01/2024-03-01/rec.csv,2024-03-01T08:00:00Z,"));
        assert!(row.contains(",missing,,,120,"));
    }

    #[test]
    fn test_read_rejects_unknown_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("days.csv");
        let mut table = ResultTable::new(Track::Day, 3);
        table.append(record("S01", 8, Some(1.0), None));
        table.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap().replace("total_chunks", "steps");
        std::fs::write(&path, format!("{}\n{}\n", header, lines.next().unwrap())).unwrap();
        assert!(ResultTable::read_csv(&path, Track::Day, 3).is_err());
    }

    #[test]
    fn test_ipc_has_nulls_for_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results_days.arrow");
        let mut table = ResultTable::new(Track::Day, 3);
        table.append(record("S01", 8, Some(1.5), None));
        table.append(record("S02", 8, None, Some(3.0)));
        table.write_ipc(&path).unwrap();

        let reader = FileReaderBuilder::new()
            .build(File::open(&path).unwrap())
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), table.columns().len());

        let level = batch
            .column_by_name("average_activity_level")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(level.value(0), 1.5);
        assert!(level.is_null(1));
    }

    #[test]
    fn test_correlations_are_pairwise_complete() {
        let mut table = ResultTable::new(Track::Day, 3);
        table.append(record("S01", 8, Some(1.0), Some(2.0)));
        table.append(record("S02", 8, Some(2.0), Some(4.0)));
        table.append(record("S03", 8, Some(3.0), None));
        table.append(record("S04", 8, Some(4.0), Some(7.0)));
        table.append(record("S05", 8, None, Some(1.0)));

        let matrix = CorrelationMatrix::from_table(&table);
        let r = matrix.get("average_activity_level", "pain_score").unwrap();
        // Complete pairs: (1, 2), (2, 4), (4, 7)
        let expected = 69.0 / (42.0f64 * 114.0).sqrt();
        assert!((r - expected).abs() < 1e-12);
        assert_eq!(matrix.get("average_activity_level", "average_activity_level"), Some(1.0));
        // Constant column
        assert_eq!(matrix.get("total_chunks", "pain_score"), None);
    }

    #[test]
    fn test_write_results_creates_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("Results");
        let mut days = ResultTable::new(Track::Day, 3);
        days.append(record("S01", 8, Some(1.0), Some(2.0)));
        let epochs = ResultTable::new(Track::Epoch, 3);

        let written = write_results(&out, &days, &epochs, 3).unwrap();
        assert_eq!(written.len(), 5);
        for path in &written {
            assert!(path.exists(), "{} missing", path.display());
        }
        let correlations = std::fs::read_to_string(out.join("correlations.csv")).unwrap();
        assert!(correlations.starts_with(",average_activity_level,"));
    }
}
