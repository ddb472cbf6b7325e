//! Builtin node implementations
//!
//! Each node is a function from resolved parameters and input artifacts to an
//! output artifact, reporting progress through the same structured log
//! channel sandboxed nodes use.

pub mod backtest;
pub mod crossover;
pub mod data_loader;
pub mod feature_generator;
pub mod indicator;
pub mod labeling;

use std::sync::Arc;

use crate::artifact::Artifact;
use crate::dataframe::DataFrame;
use crate::error::{ErrorCode, NodeError};

/// Outcome of one builtin node invocation.
pub type NodeOutput = Result<Artifact, NodeError>;

/// Fetch the tabular input at `index`, or a runtime error naming it.
pub(crate) fn input_frame(inputs: &[Arc<Artifact>], index: usize) -> Result<&DataFrame, NodeError> {
    let artifact = inputs.get(index).ok_or_else(|| {
        NodeError::new(
            ErrorCode::NodeRuntimeError,
            format!("missing input artifact #{index}"),
        )
    })?;
    artifact.as_dataframe().ok_or_else(|| {
        NodeError::new(
            ErrorCode::NodeRuntimeError,
            format!(
                "input #{index} is {}, expected a dataframe",
                artifact.kind()
            ),
        )
    })
}

/// Non-null float column accessor with a runtime error naming the column.
pub(crate) fn float_column(
    frame: &DataFrame,
    name: &str,
) -> Result<Vec<Option<f64>>, NodeError> {
    frame.float_values(name).ok_or_else(|| {
        NodeError::new(
            ErrorCode::NodeRuntimeError,
            format!("input frame has no numeric column '{name}'"),
        )
    })
}
