use crate::{SensorSample, SensorStream};
use anyhow::{anyhow, bail, Context, Result};
use arrow::array::{Array, ArrayRef, BooleanArray, Float32Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, TimeUnit};
use arrow::ipc::reader::FileReaderBuilder;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const PAIN_SCORE_DIR: &str = "pain_score";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingFormat {
    Csv,
    Feather,
    /// Vendor dump: a sequence of CBOR batch items
    Cbor,
}

impl RecordingFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(RecordingFormat::Csv),
            "feather" | "arrow" | "ipc" => Some(RecordingFormat::Feather),
            "raw" | "cbor" => Some(RecordingFormat::Cbor),
            _ => None,
        }
    }
}

/// Envelope of one vendor record.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchItem {
    pub seq: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VendorRecord {
    /// Little-endian i16 counts per axis, `scale` counts per g, first
    /// sample at `ts` (unix seconds), `freq` samples per second
    #[serde(rename = "accel")]
    Accel {
        ts: i64,
        freq: u16,
        scale: f32,
        #[serde(with = "serde_bytes")]
        x: Vec<u8>,
        #[serde(with = "serde_bytes")]
        y: Vec<u8>,
        #[serde(with = "serde_bytes")]
        z: Vec<u8>,
        #[serde(default)]
        worn: Option<bool>,
    },
}

impl VendorRecord {
    fn into_samples(self) -> Vec<SensorSample> {
        let VendorRecord::Accel {
            ts,
            freq,
            scale,
            x,
            y,
            z,
            worn,
        } = self;
        if freq == 0 || scale == 0.0 {
            return Vec::new();
        }

        let decode = |bytes: &[u8]| -> Vec<f32> {
            bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / scale)
                .collect()
        };
        let (x, y, z) = (decode(&x), decode(&y), decode(&z));
        let n = x.len().min(y.len()).min(z.len());
        let Some(start) = DateTime::from_timestamp(ts, 0) else {
            return Vec::new();
        };
        let step = crate::period_from_rate(freq as f32);

        (0..n)
            .map(|i| SensorSample::new(start + step * i as i32, x[i], y[i], z[i]).with_worn(worn))
            .collect()
    }
}

/// Loads one recording in any supported format, sorted and de-duplicated.
/// A file with a header but no rows gives an empty stream.
pub fn read_recording(path: &Path) -> Result<SensorStream> {
    let format = RecordingFormat::from_path(path)
        .ok_or_else(|| anyhow!("Unsupported recording format: {}", path.display()))?;
    let mut stream = match format {
        RecordingFormat::Csv => read_csv_recording(path)?,
        RecordingFormat::Feather => read_feather_recording(path)?,
        RecordingFormat::Cbor => read_cbor_recording(path)?,
    };

    let dropped = stream.normalise();
    if dropped > 0 {
        warn!(
            "Dropped {} samples with duplicate timestamps from {}",
            dropped,
            path.display()
        );
    }
    debug!("Loaded {} samples from {}", stream.len(), path.display());
    Ok(stream)
}

pub fn decode_batch_items(file_path: &Path) -> Result<Vec<(u32, VendorRecord)>> {
    let file = File::open(file_path)
        .with_context(|| format!("Failed to open file: {}", file_path.display()))?;
    let mut reader = BufReader::new(file);
    let mut items = Vec::new();

    loop {
        let batch_item: BatchItem = match ciborium::from_reader(&mut reader) {
            Ok(item) => item,
            Err(ciborium::de::Error::Io(error))
                if error.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(ciborium::de::Error::Io(error)) => {
                return Err(error).with_context(|| format!("Failed to read {}", file_path.display()));
            }
            Err(e) => {
                warn!("Skipping malformed CBOR data: {}", e);
                continue;
            }
        };

        // Records of other types (temperature, battery, ...) are skipped
        if let Ok(record) = ciborium::from_reader(batch_item.data.as_slice()) {
            items.push((batch_item.seq, record));
        }
    }

    Ok(items)
}

pub fn read_cbor_recording(path: &Path) -> Result<SensorStream> {
    let mut items = decode_batch_items(path)?;
    items.sort_by_key(|(seq, _)| *seq);

    let mut rate = None;
    let mut samples = Vec::new();
    for (_, record) in items {
        let VendorRecord::Accel { freq, .. } = &record;
        rate.get_or_insert(*freq as f32);
        samples.extend(record.into_samples());
    }

    let mut stream = SensorStream::new(source_name(path), samples);
    stream.nominal_rate = rate;
    Ok(stream)
}

/// CSV with a header holding `timestamp`, `x`, `y`, `z` and optionally `worn`.
pub fn read_csv_recording(path: &Path) -> Result<SensorStream> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = rdr.headers()?.clone();
    let column = |names: &[&str]| -> Option<usize> {
        headers
            .iter()
            .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
    };
    let ts_col = column(&["timestamp", "time", "ts"])
        .ok_or_else(|| anyhow!("{} has no timestamp column", path.display()))?;
    let x_col = column(&["x", "acc_x"]).ok_or_else(|| anyhow!("{} has no x column", path.display()))?;
    let y_col = column(&["y", "acc_y"]).ok_or_else(|| anyhow!("{} has no y column", path.display()))?;
    let z_col = column(&["z", "acc_z"]).ok_or_else(|| anyhow!("{} has no z column", path.display()))?;
    let worn_col = column(&["worn"]);

    let mut samples = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let field = |idx: usize| -> Result<&str> {
            record
                .get(idx)
                .ok_or_else(|| anyhow!("Row {} of {} is too short", line + 2, path.display()))
        };

        let timestamp = parse_timestamp(field(ts_col)?)
            .with_context(|| format!("Row {} of {}", line + 2, path.display()))?;
        let axis = |idx: usize| -> Result<f32> {
            let value = field(idx)?;
            value
                .parse::<f32>()
                .with_context(|| format!("Row {}: invalid value {:?}", line + 2, value))
        };
        let worn = match worn_col.and_then(|idx| record.get(idx)) {
            Some("1") | Some("true") | Some("True") => Some(true),
            Some("0") | Some("false") | Some("False") => Some(false),
            _ => None,
        };

        samples.push(SensorSample::new(timestamp, axis(x_col)?, axis(y_col)?, axis(z_col)?).with_worn(worn));
    }

    Ok(SensorStream::new(source_name(path), samples))
}

/// Arrow IPC file with a `timestamp` column (strings or an Arrow timestamp
/// type) and numeric `x`, `y`, `z` columns. Rows with a null axis are skipped.
pub fn read_feather_recording(path: &Path) -> Result<SensorStream> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = FileReaderBuilder::new().build(file)?;
    let mut samples = Vec::new();
    let mut skipped = 0usize;

    for batch in reader {
        let batch = batch?;
        let column = |name: &str| -> Result<&ArrayRef> {
            batch
                .column_by_name(name)
                .ok_or_else(|| anyhow!("{} column missing in {}", name, path.display()))
        };

        let timestamps = timestamp_column(column("timestamp")?)?;
        let axes = [
            float_column(column("x")?)?,
            float_column(column("y")?)?,
            float_column(column("z")?)?,
        ];
        let worn = match batch.column_by_name("worn") {
            Some(col) => Some(
                cast(col, &DataType::Boolean)?
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .cloned()
                    .ok_or_else(|| anyhow!("worn column should be boolean"))?,
            ),
            None => None,
        };

        for row in 0..batch.num_rows() {
            let Some(timestamp) = timestamps[row] else {
                skipped += 1;
                continue;
            };
            if axes.iter().any(|a| a.is_null(row)) {
                skipped += 1;
                continue;
            }
            let flag = worn
                .as_ref()
                .filter(|w| !w.is_null(row))
                .map(|w| w.value(row));
            samples.push(
                SensorSample::new(
                    timestamp,
                    axes[0].value(row),
                    axes[1].value(row),
                    axes[2].value(row),
                )
                .with_worn(flag),
            );
        }
    }

    if skipped > 0 {
        warn!("Skipped {} incomplete rows in {}", skipped, path.display());
    }
    Ok(SensorStream::new(source_name(path), samples))
}

fn float_column(array: &ArrayRef) -> Result<Float32Array> {
    let converted = cast(array, &DataType::Float32)?;
    converted
        .as_any()
        .downcast_ref::<Float32Array>()
        .cloned()
        .ok_or_else(|| anyhow!("axis column should be numeric"))
}

fn timestamp_column(array: &ArrayRef) -> Result<Vec<Option<DateTime<Utc>>>> {
    match array.data_type() {
        DataType::Utf8 => {
            let strings = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| anyhow!("timestamp column should be strings"))?;
            (0..strings.len())
                .map(|i| {
                    if strings.is_null(i) {
                        Ok(None)
                    } else {
                        parse_timestamp(strings.value(i)).map(Some)
                    }
                })
                .collect()
        }
        DataType::Timestamp(_, _) => {
            let millis = cast(array, &DataType::Timestamp(TimeUnit::Millisecond, None))?;
            let millis = cast(&millis, &DataType::Int64)?;
            let millis = millis
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| anyhow!("timestamp column could not be read as milliseconds"))?;
            Ok((0..millis.len())
                .map(|i| {
                    if millis.is_null(i) {
                        None
                    } else {
                        DateTime::from_timestamp_millis(millis.value(i))
                    }
                })
                .collect())
        }
        other => bail!("Unsupported timestamp column type {:?}", other),
    }
}

/// Accepts `YYYY-MM-DD HH:MM:SS[.fff]`, the ISO `T` form, or unix seconds.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(seconds) = value.parse::<f64>() {
        let nanos = (seconds.fract() * 1e9).round() as u32;
        if let Some(dt) = DateTime::from_timestamp(seconds.trunc() as i64, nanos) {
            return Ok(dt);
        }
    }
    bail!("Unrecognised timestamp {:?}", value)
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Clone)]
pub struct SubjectEntry {
    pub id: String,
    pub path: PathBuf,
}

impl SubjectEntry {
    pub fn pain_score_path(&self) -> PathBuf {
        self.path
            .join(PAIN_SCORE_DIR)
            .join(format!("{}_pain_score.csv", self.id))
    }
}

#[derive(Debug, Clone)]
pub struct DayEntry {
    pub id: String,
    pub path: PathBuf,
    /// First supported recording in the day directory, by name
    pub recording: Option<PathBuf>,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Sub-directories of `dir`, sorted by name, hidden entries skipped.
fn child_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) || !entry.file_type().is_dir() {
            continue;
        }
        dirs.push((name, entry.into_path()));
    }
    Ok(dirs)
}

pub fn discover_subjects(raw_dir: &Path) -> Result<Vec<SubjectEntry>> {
    Ok(child_dirs(raw_dir)?
        .into_iter()
        .map(|(id, path)| SubjectEntry { id, path })
        .collect())
}

pub fn discover_days(subject: &SubjectEntry) -> Result<Vec<DayEntry>> {
    let mut days = Vec::new();
    for (id, path) in child_dirs(&subject.path)? {
        if id == PAIN_SCORE_DIR {
            continue;
        }
        let recording = WalkDir::new(&path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| !is_hidden(&e.file_name().to_string_lossy()))
            .map(|e| e.into_path())
            .find(|p| RecordingFormat::from_path(p).is_some());
        days.push(DayEntry { id, path, recording });
    }
    Ok(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Float64Array;
    use arrow::datatypes::{Field, Schema};
    use arrow::ipc::writer::FileWriter;
    use arrow::record_batch::RecordBatch;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(RecordingFormat::from_path(Path::new("a.CSV")), Some(RecordingFormat::Csv));
        assert_eq!(RecordingFormat::from_path(Path::new("a.feather")), Some(RecordingFormat::Feather));
        assert_eq!(RecordingFormat::from_path(Path::new("a.RAW")), Some(RecordingFormat::Cbor));
        assert_eq!(RecordingFormat::from_path(Path::new("a.txt")), None);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = parse_timestamp("2024-03-01 08:00:00").unwrap();
        assert_eq!(parse_timestamp("2024-03-01T08:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01 08:00").unwrap(), expected);
        assert_eq!(parse_timestamp(&expected.timestamp().to_string()).unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_read_csv_recording_sorts_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "timestamp,x,y,z,worn").unwrap();
        writeln!(file, "2024-03-01 08:00:01,0.1,0.0,1.0,1").unwrap();
        writeln!(file, "2024-03-01 08:00:00,0.0,0.1,1.0,0").unwrap();
        drop(file);

        let stream = read_recording(&path).unwrap();
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.samples[0].worn, Some(false));
        assert_eq!(stream.samples[1].x, 0.1);
        assert_eq!(stream.source, "day.csv");
    }

    #[test]
    fn test_read_csv_rejects_missing_axis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, "timestamp,x,y\n2024-03-01 08:00:00,0,0\n").unwrap();
        assert!(read_recording(&path).is_err());
    }

    #[test]
    fn test_header_only_recording_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "timestamp,x,y,z\n").unwrap();
        assert!(read_recording(&path).unwrap().is_empty());
    }

    #[test]
    fn test_read_cbor_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.RAW");
        let mut file = File::create(&path).unwrap();

        let counts = |values: &[i16]| values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
        for (seq, ts) in [(1u32, 1_709_280_002i64), (0, 1_709_280_000)] {
            let record = VendorRecord::Accel {
                ts,
                freq: 2,
                scale: 256.0,
                x: counts(&[0, 128, 0, 128]),
                y: counts(&[0, 0, 0, 0]),
                z: counts(&[256, 256, 256, 256]),
                worn: Some(true),
            };
            let mut data = Vec::new();
            ciborium::into_writer(&record, &mut data).unwrap();
            ciborium::into_writer(&BatchItem { seq, data }, &mut file).unwrap();
        }
        drop(file);

        let stream = read_recording(&path).unwrap();
        assert_eq!(stream.len(), 8);
        assert_eq!(stream.nominal_rate, Some(2.0));
        assert_eq!(stream.samples[1].x, 0.5);
        assert_eq!(stream.samples[0].z, 1.0);
        assert_eq!(stream.samples[4].timestamp.timestamp(), 1_709_280_002);
    }

    #[test]
    fn test_read_feather_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.feather");
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Utf8, true),
            Field::new("x", DataType::Float64, true),
            Field::new("y", DataType::Float64, false),
            Field::new("z", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![
                    Some("2024-03-01 08:00:00"),
                    Some("2024-03-01 08:00:01"),
                    None,
                ])),
                Arc::new(Float64Array::from(vec![Some(0.1), None, Some(0.3)])),
                Arc::new(Float64Array::from(vec![0.0, 0.0, 0.0])),
                Arc::new(Float64Array::from(vec![1.0, 1.0, 1.0])),
            ],
        )
        .unwrap();
        let file = File::create(&path).unwrap();
        let mut writer = FileWriter::try_new(file, &schema).unwrap();
        writer.write(&batch).unwrap();
        writer.finish().unwrap();

        let stream = read_recording(&path).unwrap();
        assert_eq!(stream.len(), 1);
        assert!((stream.samples[0].x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_discovery_skips_hidden_and_pain_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let subject = dir.path().join("S01");
        std::fs::create_dir_all(subject.join(PAIN_SCORE_DIR)).unwrap();
        std::fs::create_dir_all(subject.join("2024-03-02")).unwrap();
        std::fs::create_dir_all(subject.join("2024-03-01")).unwrap();
        std::fs::create_dir_all(dir.path().join(".DS_Store")).unwrap();
        std::fs::write(subject.join("2024-03-01").join("b.csv"), "").unwrap();
        std::fs::write(subject.join("2024-03-01").join("a.txt"), "").unwrap();

        let subjects = discover_subjects(dir.path()).unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].id, "S01");
        assert!(subjects[0].pain_score_path().ends_with("pain_score/S01_pain_score.csv"));

        let days = discover_days(&subjects[0]).unwrap();
        let ids: Vec<_> = days.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["2024-03-01", "2024-03-02"]);
        assert!(days[0].recording.as_ref().unwrap().ends_with("b.csv"));
        assert!(days[1].recording.is_none());
    }
}
