//! Crossover signal node
//!
//! Aligns two indicator frames on timestamp (inner join) and emits
//! `signal ∈ {1, -1, 0}` when the fast series crosses the slow one. With
//! `confirmation_periods = n` the crossing condition must hold for n
//! consecutive rows before the stance flips; repeated conditions in the same
//! direction emit a signal only once per flip.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{float_column, input_frame, NodeOutput};
use crate::artifact::Artifact;
use crate::catalog::{param_f64, param_i64, param_str};
use crate::dataframe::{Column, ColumnData, DataFrame, SIGNAL_COLUMN, TIMESTAMP_COLUMN};
use crate::error::{ErrorCode, NodeError};
use crate::run::LogCollector;

/// Execute the crossover node.
pub fn run(
    params: &Map<String, Value>,
    inputs: &[Arc<Artifact>],
    logs: &mut LogCollector,
) -> NodeOutput {
    let fast_frame = input_frame(inputs, 0)?;
    let slow_frame = input_frame(inputs, 1)?;

    let fast_column = resolve_column(params, "fast_column", fast_frame)?;
    let slow_column = resolve_column(params, "slow_column", slow_frame)?;
    let threshold = param_f64(params, "threshold").unwrap_or(0.0);
    let confirmation = param_i64(params, "confirmation_periods").unwrap_or(1).max(1) as usize;

    let (fast_aligned, slow_aligned) = fast_frame
        .align_on_timestamp(slow_frame)
        .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
    if fast_aligned.is_empty() {
        logs.warn("inputs share no timestamps");
    }

    let timestamps = fast_aligned
        .timestamps()
        .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
    let fast = float_column(&fast_aligned, &fast_column)?;
    let slow = float_column(&slow_aligned, &slow_column)?;

    let signals = crossover_signals(&fast, &slow, threshold, confirmation);
    let flips = signals.iter().filter(|&&s| s != 0).count();
    logs.info(format!(
        "compared '{fast_column}' against '{slow_column}': {flips} signal(s) over {} rows",
        signals.len()
    ));

    let frame = DataFrame::from_columns(vec![
        Column::new(
            TIMESTAMP_COLUMN,
            ColumnData::Int(timestamps.into_iter().map(Some).collect()),
        ),
        Column::new(
            SIGNAL_COLUMN,
            ColumnData::Int(signals.into_iter().map(|s| Some(s as i64)).collect()),
        ),
    ])
    .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
    Ok(Artifact::Signals(frame))
}

/// Pick the comparison column: the parameter when given, otherwise the last
/// (most recently appended) column of the frame, which is the indicator
/// column by construction.
fn resolve_column(
    params: &Map<String, Value>,
    key: &str,
    frame: &DataFrame,
) -> Result<String, NodeError> {
    if let Some(column) = param_str(params, key) {
        return Ok(column.to_string());
    }
    frame
        .column_names()
        .last()
        .filter(|&&name| name != TIMESTAMP_COLUMN)
        .map(|name| name.to_string())
        .ok_or_else(|| {
            NodeError::new(
                ErrorCode::NodeRuntimeError,
                format!("cannot infer {key}: input frame has no value columns"),
            )
        })
}

/// Stateful crossover detection over aligned series.
fn crossover_signals(
    fast: &[Option<f64>],
    slow: &[Option<f64>],
    threshold: f64,
    confirmation: usize,
) -> Vec<i8> {
    let mut signals = vec![0i8; fast.len()];
    let mut stance = 0i8;
    let mut above_streak = 0usize;
    let mut below_streak = 0usize;

    for i in 0..fast.len() {
        let (Some(f), Some(s)) = (fast[i], slow[i]) else {
            above_streak = 0;
            below_streak = 0;
            continue;
        };
        let diff = f - s;
        if diff > threshold {
            above_streak += 1;
            below_streak = 0;
        } else if diff < -threshold {
            below_streak += 1;
            above_streak = 0;
        } else {
            above_streak = 0;
            below_streak = 0;
        }

        if above_streak >= confirmation && stance != 1 {
            signals[i] = 1;
            stance = 1;
        } else if below_streak >= confirmation && stance != -1 {
            signals[i] = -1;
            stance = -1;
        }
    }
    signals
}
