//! Feature generator node
//!
//! Appends derived feature columns to a price frame: simple and log returns,
//! high-low range, and rolling volatility of returns.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{float_column, input_frame, NodeOutput};
use crate::artifact::Artifact;
use crate::catalog::{features_from_params, param_i64};
use crate::dataframe::ColumnData;
use crate::error::{ErrorCode, NodeError};
use crate::run::LogCollector;

/// Feature names this node understands.
pub const KNOWN_FEATURES: [&str; 4] = ["returns", "log_returns", "hl_range", "volatility"];

/// Execute the feature generator.
pub fn run(
    params: &Map<String, Value>,
    inputs: &[Arc<Artifact>],
    logs: &mut LogCollector,
) -> NodeOutput {
    let features = features_from_params(params);
    let window = param_i64(params, "window").unwrap_or(20) as usize;

    let frame = input_frame(inputs, 0)?;
    let close = float_column(frame, "close")?;
    let returns = simple_returns(&close);

    let mut result = frame.clone();
    for feature in &features {
        let (name, data) = match feature.as_str() {
            "returns" => ("returns".to_string(), returns.clone()),
            "log_returns" => ("log_returns".to_string(), log_returns(&close)),
            "hl_range" => {
                let high = float_column(frame, "high")?;
                let low = float_column(frame, "low")?;
                ("hl_range".to_string(), hl_range(&high, &low, &close))
            }
            "volatility" => (
                format!("volatility_{window}"),
                rolling_std(&returns, window),
            ),
            other => {
                return Err(NodeError::new(
                    ErrorCode::NodeRuntimeError,
                    format!(
                        "unknown feature '{other}', expected one of [{}]",
                        KNOWN_FEATURES.join(", ")
                    ),
                ))
            }
        };
        if result.has_column(&name) {
            continue;
        }
        result
            .add_column(name.clone(), ColumnData::Float(data))
            .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
        logs.info(format!("appended feature '{name}'"));
    }
    Ok(Artifact::Dataframe(result))
}

fn simple_returns(close: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = vec![None; close.len()];
    for i in 1..close.len() {
        if let (Some(prev), Some(curr)) = (close[i - 1], close[i]) {
            if prev != 0.0 {
                out[i] = Some(curr / prev - 1.0);
            }
        }
    }
    out
}

fn log_returns(close: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = vec![None; close.len()];
    for i in 1..close.len() {
        if let (Some(prev), Some(curr)) = (close[i - 1], close[i]) {
            if prev > 0.0 && curr > 0.0 {
                out[i] = Some((curr / prev).ln());
            }
        }
    }
    out
}

fn hl_range(high: &[Option<f64>], low: &[Option<f64>], close: &[Option<f64>]) -> Vec<Option<f64>> {
    (0..close.len())
        .map(|i| match (high[i], low[i], close[i]) {
            (Some(h), Some(l), Some(c)) if c != 0.0 => Some((h - l) / c),
            _ => None,
        })
        .collect()
}

fn rolling_std(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window < 2 {
        return out;
    }
    for i in (window - 1)..values.len() {
        let slice = &values[i + 1 - window..=i];
        if slice.iter().any(Option::is_none) {
            continue;
        }
        let mean = slice.iter().map(|v| v.unwrap()).sum::<f64>() / window as f64;
        let variance = slice
            .iter()
            .map(|v| {
                let v = v.unwrap();
                (v - mean) * (v - mean)
            })
            .sum::<f64>()
            / window as f64;
        out[i] = Some(variance.sqrt());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_support::ohlcv_frame;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn run_on(closes: &[f64], p: Value) -> NodeOutput {
        let inputs = vec![Arc::new(Artifact::Dataframe(ohlcv_frame(closes)))];
        let mut logs = LogCollector::new("features");
        run(&params(p), &inputs, &mut logs)
    }

    #[test]
    fn test_returns() {
        let artifact = run_on(&[100.0, 110.0, 99.0], json!({"features": ["returns"]})).unwrap();
        let frame = artifact.as_dataframe().unwrap();
        let returns = frame.float_values("returns").unwrap();
        assert_eq!(returns[0], None);
        assert!((returns[1].unwrap() - 0.1).abs() < 1e-9);
        assert!((returns[2].unwrap() + 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_log_returns() {
        let artifact =
            run_on(&[100.0, 110.0], json!({"features": ["log_returns"]})).unwrap();
        let frame = artifact.as_dataframe().unwrap();
        let lr = frame.float_values("log_returns").unwrap();
        assert!((lr[1].unwrap() - (1.1f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_hl_range() {
        let artifact = run_on(&[100.0, 200.0], json!({"features": ["hl_range"]})).unwrap();
        let frame = artifact.as_dataframe().unwrap();
        let range = frame.float_values("hl_range").unwrap();
        // ohlcv_frame puts high = close+1, low = close-1
        assert!((range[0].unwrap() - 0.02).abs() < 1e-9);
        assert!((range[1].unwrap() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_volatility_window_naming() {
        let closes: Vec<f64> = (1..=10).map(|i| 100.0 + i as f64).collect();
        let artifact = run_on(
            &closes,
            json!({"features": ["volatility"], "window": 4}),
        )
        .unwrap();
        let frame = artifact.as_dataframe().unwrap();
        let vol = frame.float_values("volatility_4").unwrap();
        // Needs window returns, and returns start at row 1
        assert_eq!(vol[3], None);
        assert!(vol[4].is_some());
    }

    #[test]
    fn test_default_feature_set() {
        let artifact = run_on(&[1.0, 2.0], json!({})).unwrap();
        assert!(artifact.as_dataframe().unwrap().has_column("returns"));
    }

    #[test]
    fn test_unknown_feature() {
        let err = run_on(&[1.0], json!({"features": ["entropy"]})).unwrap_err();
        assert!(err.message.contains("entropy"));
    }
}
