//! Data loader node
//!
//! Resolves a dataset by symbolic name, filters it to the requested date
//! range, and projects the canonical OHLCV columns. `symbol` and `timeframe`
//! are recorded into frame metadata; when the dataset carries a `symbol`
//! column the rows are filtered on it as well.

use serde_json::{Map, Value};

use super::NodeOutput;
use crate::artifact::Artifact;
use crate::catalog::param_str;
use crate::dataframe::{Column, ColumnData, DataFrame, OHLCV_COLUMNS};
use crate::dataset::{parse_timestamp_text, read_dataset, DatasetProvider};
use crate::error::{ErrorCode, NodeError};
use crate::run::LogCollector;

/// Milliseconds in one day minus one; date-valued `end_date` is inclusive.
const END_OF_DAY_MS: i64 = 86_400_000 - 1;

/// Execute the data loader.
pub fn run(
    params: &Map<String, Value>,
    datasets: &dyn DatasetProvider,
    logs: &mut LogCollector,
) -> NodeOutput {
    let dataset = param_str(params, "dataset").ok_or_else(|| {
        NodeError::new(ErrorCode::NodeRuntimeError, "dataset parameter is missing")
    })?;
    let path = datasets
        .resolve(dataset)
        .map_err(|err| NodeError::new(ErrorCode::InfrastructureError, err.to_string()))?;
    let frame = read_dataset(&path)
        .map_err(|err| NodeError::new(ErrorCode::InfrastructureError, err.to_string()))?;
    logs.info(format!(
        "loaded {} rows from '{}'",
        frame.len(),
        path.display()
    ));

    let frame = match param_str(params, "symbol") {
        Some(symbol) => filter_symbol(&frame, symbol)?,
        None => frame,
    };

    let start = parse_date_param(params, "start_date")?;
    let end = parse_date_param(params, "end_date")?.map(|ms| ms + END_OF_DAY_MS);
    let frame = frame
        .filter_by_timestamp(start, end)
        .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
    if (start.is_some() || end.is_some()) && frame.is_empty() {
        logs.warn("date filter matched no rows");
    }

    let mut projected = project_ohlcv(&frame)?;
    for key in ["symbol", "timeframe", "dataset"] {
        if let Some(value) = param_str(params, key) {
            projected.insert_metadata(key, Value::from(value));
        }
    }
    logs.info(format!("emitting {} rows", projected.len()));
    Ok(Artifact::Dataframe(projected))
}

fn parse_date_param(
    params: &Map<String, Value>,
    key: &str,
) -> Result<Option<i64>, NodeError> {
    match param_str(params, key) {
        None => Ok(None),
        Some(text) => parse_timestamp_text(text).map(Some).ok_or_else(|| {
            NodeError::new(
                ErrorCode::NodeRuntimeError,
                format!("parameter '{key}' is not a valid date: '{text}'"),
            )
        }),
    }
}

fn filter_symbol(frame: &DataFrame, symbol: &str) -> Result<DataFrame, NodeError> {
    let Some(column) = frame.column("symbol") else {
        return Ok(frame.clone());
    };
    let ColumnData::Str(values) = &column.data else {
        return Ok(frame.clone());
    };
    let indices: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, value)| value.as_deref() == Some(symbol))
        .map(|(i, _)| i)
        .collect();
    Ok(frame.select_rows(&indices))
}

fn project_ohlcv(frame: &DataFrame) -> Result<DataFrame, NodeError> {
    let missing: Vec<&str> = OHLCV_COLUMNS
        .iter()
        .copied()
        .filter(|name| !frame.has_column(name))
        .collect();
    if !missing.is_empty() {
        return Err(NodeError::new(
            ErrorCode::NodeRuntimeError,
            format!("dataset is missing OHLCV columns [{}]", missing.join(", ")),
        ));
    }
    let columns: Vec<Column> = OHLCV_COLUMNS
        .iter()
        .map(|name| frame.column(name).expect("checked above").clone())
        .collect();
    DataFrame::from_columns(columns)
        .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::FsDatasetProvider;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const CSV: &str = "\
timestamp,open,high,low,close,volume,symbol
2024-01-01,10,11,9,10.5,1000,SPY
2024-01-02,10.5,12,10,11.5,1200,SPY
2024-01-03,11.5,13,11,12.5,900,QQQ
2024-01-04,12.5,14,12,13.5,800,SPY
";

    fn provider() -> (tempfile::TempDir, FsDatasetProvider) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample_ohlcv.csv"), CSV).unwrap();
        let provider = FsDatasetProvider::new(dir.path());
        (dir, provider)
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_load_projects_ohlcv() {
        let (_dir, provider) = provider();
        let mut logs = LogCollector::new("loader");
        let artifact = run(
            &params(json!({"symbol": "SPY", "timeframe": "1d", "dataset": "sample_ohlcv"})),
            &provider,
            &mut logs,
        )
        .unwrap();
        let frame = artifact.as_dataframe().unwrap();
        assert_eq!(frame.column_names(), OHLCV_COLUMNS.to_vec());
        // QQQ row filtered out by symbol
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.metadata()["symbol"], json!("SPY"));
        assert_eq!(frame.metadata()["timeframe"], json!("1d"));
        assert!(!logs.into_entries().is_empty());
    }

    #[test]
    fn test_load_date_range_inclusive() {
        let (_dir, provider) = provider();
        let mut logs = LogCollector::new("loader");
        let artifact = run(
            &params(json!({
                "symbol": "SPY", "timeframe": "1d", "dataset": "sample_ohlcv",
                "start_date": "2024-01-02", "end_date": "2024-01-04"
            })),
            &provider,
            &mut logs,
        )
        .unwrap();
        let frame = artifact.as_dataframe().unwrap();
        assert_eq!(frame.len(), 2); // Jan 2 and Jan 4 (Jan 3 is QQQ)
    }

    #[test]
    fn test_load_unknown_dataset_is_infrastructure_error() {
        let (_dir, provider) = provider();
        let mut logs = LogCollector::new("loader");
        let err = run(
            &params(json!({"symbol": "SPY", "timeframe": "1d", "dataset": "missing"})),
            &provider,
            &mut logs,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InfrastructureError);
    }

    #[test]
    fn test_load_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("thin.csv"), "timestamp,close\n2024-01-01,1\n").unwrap();
        let provider = FsDatasetProvider::new(dir.path());
        let mut logs = LogCollector::new("loader");
        let err = run(
            &params(json!({"symbol": "S", "timeframe": "1d", "dataset": "thin"})),
            &provider,
            &mut logs,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::NodeRuntimeError);
        assert!(err.message.contains("open"));
    }

    #[test]
    fn test_bad_date_parameter() {
        let (_dir, provider) = provider();
        let mut logs = LogCollector::new("loader");
        let err = run(
            &params(json!({
                "symbol": "SPY", "timeframe": "1d", "dataset": "sample_ohlcv",
                "start_date": "soon"
            })),
            &provider,
            &mut logs,
        )
        .unwrap_err();
        assert!(err.message.contains("start_date"));
    }

    #[test]
    fn test_empty_range_warns() {
        let (_dir, provider) = provider();
        let mut logs = LogCollector::new("loader");
        let artifact = run(
            &params(json!({
                "symbol": "SPY", "timeframe": "1d", "dataset": "sample_ohlcv",
                "start_date": "2025-01-01"
            })),
            &provider,
            &mut logs,
        )
        .unwrap();
        assert!(artifact.as_dataframe().unwrap().is_empty());
        assert!(logs
            .into_entries()
            .iter()
            .any(|e| e.message.contains("matched no rows")));
    }
}
