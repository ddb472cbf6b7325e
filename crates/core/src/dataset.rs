//! Dataset provider and file readers
//!
//! Datasets are CSV, JSON, or Parquet files with at least OHLCV columns in
//! some naming convention; readers map known header aliases onto the
//! canonical names and normalize timestamps to epoch milliseconds.

use std::path::{Path, PathBuf};

use arrow::array::{
    Array, Float32Array, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;
use tracing::debug;

use crate::dataframe::{Column, ColumnData, DataFrame, SIGNAL_COLUMN, TIMESTAMP_COLUMN};
use crate::error::{Error, Result};

/// Supported dataset file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// Comma-separated values with a header row
    Csv,
    /// JSON array of row objects
    Json,
    /// Apache Parquet
    Parquet,
}

impl DatasetFormat {
    /// Derive the format from a file extension.
    pub fn from_extension(extension: &str) -> Option<DatasetFormat> {
        match extension {
            "csv" => Some(DatasetFormat::Csv),
            "json" => Some(DatasetFormat::Json),
            "parquet" => Some(DatasetFormat::Parquet),
            _ => None,
        }
    }

    /// Derive the format from a path.
    pub fn from_path(path: &Path) -> Option<DatasetFormat> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// One known dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    /// Symbolic name (file stem)
    pub name: String,
    /// Absolute file path
    pub path: PathBuf,
    /// File format
    pub format: DatasetFormat,
    /// File size in bytes
    pub size_bytes: u64,
}

/// Resolves symbolic dataset names to files.
pub trait DatasetProvider: Send + Sync {
    /// Resolve a symbolic name (with or without extension) to a path.
    fn resolve(&self, name: &str) -> Result<PathBuf>;

    /// Enumerate all known datasets.
    fn list(&self) -> Result<Vec<DatasetDescriptor>>;

    /// The directory datasets live in, for read-only container mounts.
    fn root(&self) -> Option<&Path> {
        None
    }
}

/// Filesystem-backed dataset provider over one root directory.
#[derive(Debug, Clone)]
pub struct FsDatasetProvider {
    root: PathBuf,
}

impl FsDatasetProvider {
    /// Provider over the given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DatasetProvider for FsDatasetProvider {
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        // Reject path traversal outright; dataset names are flat.
        if name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(Error::Dataset(format!(
                "dataset name '{name}' must not contain path separators"
            )));
        }
        let direct = self.root.join(name);
        if DatasetFormat::from_path(&direct).is_some() && direct.is_file() {
            return Ok(direct);
        }
        for extension in ["csv", "parquet", "json"] {
            let candidate = self.root.join(format!("{name}.{extension}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::Dataset(format!(
            "dataset '{name}' not found under {}",
            self.root.display()
        )))
    }

    fn list(&self) -> Result<Vec<DatasetDescriptor>> {
        let mut datasets = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(datasets),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(format) = DatasetFormat::from_path(&path) else {
                continue;
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            datasets.push(DatasetDescriptor {
                name: stem.to_string(),
                path: path.clone(),
                format,
                size_bytes,
            });
        }
        datasets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(datasets)
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// Header aliases mapped onto canonical column names.
const COLUMN_ALIASES: [(&str, &str); 12] = [
    ("ts", TIMESTAMP_COLUMN),
    ("time", TIMESTAMP_COLUMN),
    ("date", TIMESTAMP_COLUMN),
    ("datetime", TIMESTAMP_COLUMN),
    ("o", "open"),
    ("h", "high"),
    ("l", "low"),
    ("c", "close"),
    ("v", "volume"),
    ("vol", "volume"),
    ("sig", SIGNAL_COLUMN),
    ("adj_close", "adj_close"),
];

/// Map a header name to its canonical form (lowercased, aliased).
fn canonical_column_name(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    for (alias, canonical) in COLUMN_ALIASES {
        if lower == alias {
            return canonical.to_string();
        }
    }
    lower
}

/// One raw cell before typing.
#[derive(Debug, Clone, PartialEq)]
enum RawCell {
    Number(f64),
    Text(String),
}

/// Read a dataset file into a frame with canonical column names, sorted by
/// timestamp ascending.
pub fn read_dataset(path: &Path) -> Result<DataFrame> {
    let format = DatasetFormat::from_path(path).ok_or_else(|| {
        Error::Dataset(format!(
            "unsupported dataset format for '{}'",
            path.display()
        ))
    })?;
    debug!(path = %path.display(), ?format, "reading dataset");
    let raw_columns = match format {
        DatasetFormat::Csv => read_csv(path)?,
        DatasetFormat::Json => read_json(path)?,
        DatasetFormat::Parquet => read_parquet(path)?,
    };
    build_frame(raw_columns, path)
}

fn read_csv(path: &Path) -> Result<Vec<(String, Vec<Option<RawCell>>)>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))?
        .iter()
        .map(canonical_column_name)
        .collect();
    let mut columns: Vec<(String, Vec<Option<RawCell>>)> =
        headers.into_iter().map(|name| (name, Vec::new())).collect();

    for record in reader.records() {
        let record =
            record.map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))?;
        for (i, (_, values)) in columns.iter_mut().enumerate() {
            let cell = record.get(i).unwrap_or("");
            values.push(parse_cell(cell));
        }
    }
    Ok(columns)
}

fn parse_cell(cell: &str) -> Option<RawCell> {
    if cell.is_empty() {
        return None;
    }
    match cell.parse::<f64>() {
        Ok(number) => Some(RawCell::Number(number)),
        Err(_) => Some(RawCell::Text(cell.to_string())),
    }
}

fn read_json(path: &Path) -> Result<Vec<(String, Vec<Option<RawCell>>)>> {
    let body = std::fs::read_to_string(path)?;
    let rows: Vec<Value> = serde_json::from_str(&body)
        .map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))?;

    // Collect column order from first appearance across rows.
    let mut names: Vec<String> = Vec::new();
    for row in &rows {
        if let Value::Object(object) = row {
            for key in object.keys() {
                let canonical = canonical_column_name(key);
                if !names.contains(&canonical) {
                    names.push(canonical);
                }
            }
        } else {
            return Err(Error::Dataset(format!(
                "{}: JSON dataset must be an array of row objects",
                path.display()
            )));
        }
    }

    let mut columns: Vec<(String, Vec<Option<RawCell>>)> =
        names.iter().map(|name| (name.clone(), Vec::new())).collect();
    for row in &rows {
        let object = row.as_object().expect("checked above");
        // Re-map the row under canonical names for lookup.
        let canonical: std::collections::HashMap<String, &Value> = object
            .iter()
            .map(|(k, v)| (canonical_column_name(k), v))
            .collect();
        for (name, values) in columns.iter_mut() {
            let cell = match canonical.get(name) {
                Some(Value::Number(n)) => n.as_f64().map(RawCell::Number),
                Some(Value::String(s)) => Some(RawCell::Text(s.clone())),
                Some(Value::Bool(b)) => Some(RawCell::Number(f64::from(*b as i32))),
                _ => None,
            };
            values.push(cell);
        }
    }
    Ok(columns)
}

fn read_parquet(path: &Path) -> Result<Vec<(String, Vec<Option<RawCell>>)>> {
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))?;
    let reader = builder
        .build()
        .map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))?;

    let mut columns: Vec<(String, Vec<Option<RawCell>>)> = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))?;
        if columns.is_empty() {
            columns = batch
                .schema()
                .fields()
                .iter()
                .map(|field| (canonical_column_name(field.name()), Vec::new()))
                .collect();
        }
        for (i, (name, values)) in columns.iter_mut().enumerate() {
            let array = batch.column(i);
            append_arrow_column(name, array.as_ref(), values).map_err(|message| {
                Error::Dataset(format!("{}: column '{name}': {message}", path.display()))
            })?;
        }
    }
    Ok(columns)
}

/// Append one arrow array's values as raw cells.
fn append_arrow_column(
    _name: &str,
    array: &dyn Array,
    values: &mut Vec<Option<RawCell>>,
) -> std::result::Result<(), String> {
    macro_rules! push_numeric {
        ($array_type:ty, $scale:expr) => {{
            let typed = array
                .as_any()
                .downcast_ref::<$array_type>()
                .ok_or("unexpected array layout")?;
            for i in 0..typed.len() {
                values.push(if typed.is_null(i) {
                    None
                } else {
                    Some(RawCell::Number(typed.value(i) as f64 * $scale))
                });
            }
        }};
    }

    match array.data_type() {
        DataType::Int64 => push_numeric!(Int64Array, 1.0),
        DataType::Int32 => push_numeric!(Int32Array, 1.0),
        DataType::Float64 => push_numeric!(Float64Array, 1.0),
        DataType::Float32 => push_numeric!(Float32Array, 1.0),
        // Timestamps normalize to epoch milliseconds
        DataType::Timestamp(TimeUnit::Second, _) => push_numeric!(TimestampSecondArray, 1_000.0),
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            push_numeric!(TimestampMillisecondArray, 1.0)
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            push_numeric!(TimestampMicrosecondArray, 1e-3)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            push_numeric!(TimestampNanosecondArray, 1e-6)
        }
        DataType::Utf8 => {
            let typed = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or("unexpected array layout")?;
            for i in 0..typed.len() {
                values.push(if typed.is_null(i) {
                    None
                } else {
                    Some(RawCell::Text(typed.value(i).to_string()))
                });
            }
        }
        other => return Err(format!("unsupported arrow type {other}")),
    }
    Ok(())
}

/// Assemble typed columns and sort by timestamp.
fn build_frame(
    raw_columns: Vec<(String, Vec<Option<RawCell>>)>,
    path: &Path,
) -> Result<DataFrame> {
    let mut columns = Vec::with_capacity(raw_columns.len());
    let mut seen = std::collections::HashSet::new();
    for (name, cells) in raw_columns {
        if !seen.insert(name.clone()) {
            // Two aliases mapping to the same canonical name: first one wins.
            continue;
        }
        let data = if name == TIMESTAMP_COLUMN {
            ColumnData::Int(
                cells
                    .iter()
                    .map(|cell| cell.as_ref().and_then(parse_timestamp_cell))
                    .collect(),
            )
        } else if name == SIGNAL_COLUMN {
            ColumnData::Int(
                cells
                    .iter()
                    .map(|cell| match cell {
                        Some(RawCell::Number(n)) => Some(*n as i64),
                        _ => None,
                    })
                    .collect(),
            )
        } else if cells
            .iter()
            .flatten()
            .all(|cell| matches!(cell, RawCell::Number(_)))
        {
            ColumnData::Float(
                cells
                    .iter()
                    .map(|cell| match cell {
                        Some(RawCell::Number(n)) => Some(*n),
                        _ => None,
                    })
                    .collect(),
            )
        } else {
            ColumnData::Str(
                cells
                    .iter()
                    .map(|cell| match cell {
                        Some(RawCell::Number(n)) => Some(n.to_string()),
                        Some(RawCell::Text(s)) => Some(s.clone()),
                        None => None,
                    })
                    .collect(),
            )
        };
        columns.push(Column::new(name, data));
    }

    let frame = DataFrame::from_columns(columns)
        .map_err(|message| Error::Dataset(format!("{}: {message}", path.display())))?;
    if !frame.has_column(TIMESTAMP_COLUMN) {
        return Err(Error::Dataset(format!(
            "{}: dataset has no timestamp column (or recognized alias)",
            path.display()
        )));
    }
    frame
        .sort_by_timestamp()
        .map_err(|message| Error::Dataset(format!("{}: {message}", path.display())))
}

/// Epoch-millisecond threshold: numeric timestamps below this are seconds.
const MS_EPOCH_THRESHOLD: f64 = 1e12;

fn parse_timestamp_cell(cell: &RawCell) -> Option<i64> {
    match cell {
        RawCell::Number(n) => {
            if n.abs() >= MS_EPOCH_THRESHOLD {
                Some(*n as i64)
            } else {
                Some((*n * 1000.0) as i64)
            }
        }
        RawCell::Text(text) => parse_timestamp_text(text),
    }
}

/// Parse a textual timestamp: RFC 3339, `YYYY-MM-DD HH:MM:SS`, or a date.
pub fn parse_timestamp_text(text: &str) -> Option<i64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp_millis());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc().timestamp_millis());
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(parsed.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    const SAMPLE_CSV: &str = "\
ts,Open,High,Low,Close,Vol
2024-01-01,100,105,99,104,1000
2024-01-02,104,106,103,105,1100
2024-01-03,105,107,104,106,900
";

    #[test]
    fn test_read_csv_maps_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "sample.csv", SAMPLE_CSV);
        let frame = read_dataset(&path).unwrap();
        assert_eq!(
            frame.column_names(),
            vec!["timestamp", "open", "high", "low", "close", "volume"]
        );
        assert_eq!(frame.len(), 3);
        let ts = frame.timestamps().unwrap();
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            frame.float_values("close").unwrap(),
            vec![Some(104.0), Some(105.0), Some(106.0)]
        );
    }

    #[test]
    fn test_read_csv_sorts_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let body = "\
timestamp,close
2024-01-03,3
2024-01-01,1
2024-01-02,2
";
        let path = write(dir.path(), "unsorted.csv", body);
        let frame = read_dataset(&path).unwrap();
        assert_eq!(
            frame.float_values("close").unwrap(),
            vec![Some(1.0), Some(2.0), Some(3.0)]
        );
    }

    #[test]
    fn test_read_csv_numeric_epoch_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let body = "time,close\n1704067200,10.5\n1704153600,11.0\n";
        let path = write(dir.path(), "epoch.csv", body);
        let frame = read_dataset(&path).unwrap();
        assert_eq!(
            frame.timestamps().unwrap(),
            vec![1_704_067_200_000, 1_704_153_600_000]
        );
    }

    #[test]
    fn test_read_csv_numeric_epoch_millis_kept() {
        let dir = tempfile::tempdir().unwrap();
        let body = "time,close\n1704067200000,10.5\n";
        let path = write(dir.path(), "ms.csv", body);
        let frame = read_dataset(&path).unwrap();
        assert_eq!(frame.timestamps().unwrap(), vec![1_704_067_200_000]);
    }

    #[test]
    fn test_read_csv_missing_timestamp_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "no_ts.csv", "open,close\n1,2\n");
        let err = read_dataset(&path).unwrap_err();
        assert!(err.to_string().contains("no timestamp column"));
    }

    #[test]
    fn test_read_json_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"[
            {"date": "2024-01-02", "close": 11.0, "symbol": "SPY"},
            {"date": "2024-01-01", "close": 10.0, "symbol": "SPY"}
        ]"#;
        let path = write(dir.path(), "rows.json", body);
        let frame = read_dataset(&path).unwrap();
        assert_eq!(frame.len(), 2);
        // Sorted ascending despite source order
        assert_eq!(
            frame.float_values("close").unwrap(),
            vec![Some(10.0), Some(11.0)]
        );
        // String column survives typing
        assert!(frame.column("symbol").is_some());
    }

    #[test]
    fn test_read_json_rejects_non_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.json", "[1, 2, 3]");
        assert!(read_dataset(&path).is_err());
    }

    #[test]
    fn test_signal_column_is_integer() {
        let dir = tempfile::tempdir().unwrap();
        let body = "timestamp,close,signal\n2024-01-01,10,1\n2024-01-02,11,-1\n";
        let path = write(dir.path(), "signals.csv", body);
        let frame = read_dataset(&path).unwrap();
        match &frame.column(SIGNAL_COLUMN).unwrap().data {
            ColumnData::Int(values) => assert_eq!(values, &vec![Some(1), Some(-1)]),
            other => panic!("signal column should be integer, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "data.xlsx", "whatever");
        assert!(read_dataset(&path).is_err());
    }

    #[test]
    fn test_provider_resolve_with_and_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sample_ohlcv.csv", SAMPLE_CSV);
        let provider = FsDatasetProvider::new(dir.path());

        let by_name = provider.resolve("sample_ohlcv").unwrap();
        let by_file = provider.resolve("sample_ohlcv.csv").unwrap();
        assert_eq!(by_name, by_file);
        assert!(provider.resolve("missing").is_err());
    }

    #[test]
    fn test_provider_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsDatasetProvider::new(dir.path());
        assert!(provider.resolve("../etc/passwd").is_err());
        assert!(provider.resolve("a/b").is_err());
    }

    #[test]
    fn test_provider_list() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.csv", SAMPLE_CSV);
        write(dir.path(), "a.json", "[]");
        write(dir.path(), "notes.txt", "ignored");
        let provider = FsDatasetProvider::new(dir.path());
        let datasets = provider.list().unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].name, "a");
        assert_eq!(datasets[0].format, DatasetFormat::Json);
        assert_eq!(datasets[1].name, "b");
        assert!(datasets[1].size_bytes > 0);
    }

    #[test]
    fn test_provider_list_missing_root() {
        let provider = FsDatasetProvider::new("/nonexistent/datasets");
        assert!(provider.list().unwrap().is_empty());
    }

    #[test]
    fn test_parse_timestamp_text_formats() {
        assert_eq!(
            parse_timestamp_text("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000)
        );
        assert_eq!(
            parse_timestamp_text("2024-01-01 00:00:00"),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_timestamp_text("2024-01-01"), Some(1_704_067_200_000));
        assert_eq!(parse_timestamp_text("yesterday"), None);
    }

    #[test]
    fn test_parquet_roundtrip() {
        use arrow::array::{ArrayRef, Float64Array as F64, TimestampMillisecondArray as TsMs};
        use arrow::datatypes::{Field, Schema};
        use arrow::record_batch::RecordBatch;
        use parquet::arrow::ArrowWriter;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.parquet");

        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "timestamp",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
            Field::new("close", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TsMs::from(vec![1_704_067_200_000i64, 1_704_153_600_000])) as ArrayRef,
                Arc::new(F64::from(vec![10.0, 11.0])) as ArrayRef,
            ],
        )
        .unwrap();

        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let frame = read_dataset(&path).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(
            frame.timestamps().unwrap(),
            vec![1_704_067_200_000, 1_704_153_600_000]
        );
        assert_eq!(
            frame.float_values("close").unwrap(),
            vec![Some(10.0), Some(11.0)]
        );
    }
}
