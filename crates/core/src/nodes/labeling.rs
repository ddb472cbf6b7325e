//! Labeling node
//!
//! Appends a forward-return label column: `1` when the return over the next
//! `horizon` rows exceeds `threshold`, `-1` below `-threshold`, `0` inside
//! the band. Rows without a full horizon ahead stay null.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{float_column, input_frame, NodeOutput};
use crate::artifact::Artifact;
use crate::catalog::{param_f64, param_i64};
use crate::dataframe::ColumnData;
use crate::error::{ErrorCode, NodeError};
use crate::run::LogCollector;

/// Execute the labeling node.
pub fn run(
    params: &Map<String, Value>,
    inputs: &[Arc<Artifact>],
    logs: &mut LogCollector,
) -> NodeOutput {
    let horizon = param_i64(params, "horizon").ok_or_else(|| {
        NodeError::new(ErrorCode::NodeRuntimeError, "horizon parameter is missing")
    })? as usize;
    let threshold = param_f64(params, "threshold").unwrap_or(0.0);

    let frame = input_frame(inputs, 0)?;
    let close = float_column(frame, "close")?;

    let labels = forward_labels(&close, horizon, threshold);
    let labeled = labels.iter().filter(|v| v.is_some()).count();
    logs.info(format!(
        "labeled {labeled} of {} rows (horizon {horizon})",
        labels.len()
    ));

    let mut result = frame.clone();
    if !result.has_column("label") {
        result
            .add_column("label", ColumnData::Int(labels))
            .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
    }
    Ok(Artifact::Dataframe(result))
}

fn forward_labels(close: &[Option<f64>], horizon: usize, threshold: f64) -> Vec<Option<i64>> {
    let mut out = vec![None; close.len()];
    if horizon == 0 {
        return out;
    }
    for i in 0..close.len().saturating_sub(horizon) {
        if let (Some(now), Some(future)) = (close[i], close[i + horizon]) {
            if now != 0.0 {
                let forward_return = future / now - 1.0;
                out[i] = Some(if forward_return > threshold {
                    1
                } else if forward_return < -threshold {
                    -1
                } else {
                    0
                });
            }
        }
    }
    out
}
