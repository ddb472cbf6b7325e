//! Indicator node
//!
//! Computes the named indicator over the chosen column and appends the
//! result columns, preserving every input column and row order.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{float_column, input_frame, NodeOutput};
use crate::artifact::Artifact;
use crate::catalog::{indicator_from_params, param_i64, param_str};
use crate::dataframe::ColumnData;
use crate::error::{ErrorCode, NodeError};
use crate::indicators::{self, Indicator};
use crate::run::LogCollector;

/// Execute the indicator node.
pub fn run(
    params: &Map<String, Value>,
    inputs: &[Arc<Artifact>],
    logs: &mut LogCollector,
) -> NodeOutput {
    let indicator = indicator_from_params(params).ok_or_else(|| {
        NodeError::new(
            ErrorCode::NodeRuntimeError,
            "indicator parameter is missing or invalid",
        )
    })?;
    let period = param_i64(params, "period").ok_or_else(|| {
        NodeError::new(ErrorCode::NodeRuntimeError, "period parameter is missing")
    })? as usize;
    let column = param_str(params, "column").unwrap_or("close");

    let frame = input_frame(inputs, 0)?;
    let values = float_column(frame, column)?;

    let mut outputs: Vec<(String, Vec<Option<f64>>)> = Vec::new();
    match indicator {
        Indicator::Sma => {
            outputs.push((format!("sma_{period}"), indicators::sma(&values, period)));
        }
        Indicator::Ema => {
            outputs.push((format!("ema_{period}"), indicators::ema(&values, period)));
        }
        Indicator::Rsi => {
            outputs.push((format!("rsi_{period}"), indicators::rsi(&values, period)));
        }
        Indicator::Macd => {
            let fast = param_i64(params, "fast_period").unwrap_or(12) as usize;
            let slow = param_i64(params, "slow_period").unwrap_or(26) as usize;
            let signal = param_i64(params, "signal_period").ok_or_else(|| {
                NodeError::new(
                    ErrorCode::NodeRuntimeError,
                    "MACD requires a signal_period parameter",
                )
            })? as usize;
            let (line, signal_line, hist) = indicators::macd(&values, fast, slow, signal);
            outputs.push(("macd".to_string(), line));
            outputs.push(("macd_signal".to_string(), signal_line));
            outputs.push(("macd_hist".to_string(), hist));
        }
        Indicator::Bb => {
            let std_dev = crate::catalog::param_f64(params, "std_dev").unwrap_or(2.0);
            let (upper, middle, lower) = indicators::bollinger(&values, period, std_dev);
            outputs.push((format!("bb_upper_{period}"), upper));
            outputs.push((format!("bb_middle_{period}"), middle));
            outputs.push((format!("bb_lower_{period}"), lower));
        }
        Indicator::Stoch => {
            let high = float_column(frame, "high")?;
            let low = float_column(frame, "low")?;
            let close = float_column(frame, "close")?;
            let d_period = param_i64(params, "d_period").unwrap_or(3) as usize;
            let (k, d) = indicators::stochastic(&high, &low, &close, period, d_period);
            outputs.push((format!("stoch_k_{period}"), k));
            outputs.push((format!("stoch_d_{period}"), d));
        }
        Indicator::Atr => {
            let high = float_column(frame, "high")?;
            let low = float_column(frame, "low")?;
            let close = float_column(frame, "close")?;
            outputs.push((
                format!("atr_{period}"),
                indicators::atr(&high, &low, &close, period),
            ));
        }
    }

    let mut result = frame.clone();
    for (name, data) in outputs {
        let warmup = data.iter().take_while(|v| v.is_none()).count();
        logs.info(format!("computed '{name}' ({warmup} warmup rows)"));
        if result.has_column(&name) {
            continue;
        }
        result
            .add_column(name, ColumnData::Float(data))
            .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
    }
    Ok(Artifact::Dataframe(result))
}
