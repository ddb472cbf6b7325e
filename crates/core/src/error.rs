//! Error types for the EdgeQL engine
//!
//! Every user-visible failure carries a stable [`ErrorCode`]; validation
//! findings aggregate into a report, execution failures travel inside node
//! results, and the crate-level [`Error`] covers everything that aborts an
//! operation outright.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::ValidationReport;

/// Stable error codes carried in validation reports and node results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Source and structure
    SyntaxError,
    SchemaViolation,
    EmptyPipeline,
    InvalidNodeId,
    DuplicateNodeId,
    // Type resolution
    UnknownNodeType,
    // Parameters
    MissingRequiredParameter,
    InvalidParameterType,
    ParameterOutOfRange,
    InvalidParameterValue,
    // Dependencies
    MissingDependency,
    CircularDependency,
    InvalidDependencyCount,
    // IO compatibility
    IncompatibleInputType,
    // Advisory
    BestPracticeViolation,
    // Execution
    NodeRuntimeError,
    Timeout,
    ResourceExhaustion,
    ProtocolViolation,
    InfrastructureError,
    Cancelled,
}

impl ErrorCode {
    /// The stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SyntaxError => "SYNTAX_ERROR",
            ErrorCode::SchemaViolation => "SCHEMA_VIOLATION",
            ErrorCode::EmptyPipeline => "EMPTY_PIPELINE",
            ErrorCode::InvalidNodeId => "INVALID_NODE_ID",
            ErrorCode::DuplicateNodeId => "DUPLICATE_NODE_ID",
            ErrorCode::UnknownNodeType => "UNKNOWN_NODE_TYPE",
            ErrorCode::MissingRequiredParameter => "MISSING_REQUIRED_PARAMETER",
            ErrorCode::InvalidParameterType => "INVALID_PARAMETER_TYPE",
            ErrorCode::ParameterOutOfRange => "PARAMETER_OUT_OF_RANGE",
            ErrorCode::InvalidParameterValue => "INVALID_PARAMETER_VALUE",
            ErrorCode::MissingDependency => "MISSING_DEPENDENCY",
            ErrorCode::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorCode::InvalidDependencyCount => "INVALID_DEPENDENCY_COUNT",
            ErrorCode::IncompatibleInputType => "INCOMPATIBLE_INPUT_TYPE",
            ErrorCode::BestPracticeViolation => "BEST_PRACTICE_VIOLATION",
            ErrorCode::NodeRuntimeError => "NODE_RUNTIME_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::InfrastructureError => "INFRASTRUCTURE_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }

    /// True for codes that can only occur during execution.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            ErrorCode::NodeRuntimeError
                | ErrorCode::Timeout
                | ErrorCode::ResourceExhaustion
                | ErrorCode::ProtocolViolation
                | ErrorCode::InfrastructureError
                | ErrorCode::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node-level failure: stable code plus human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    /// Stable classification code
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

impl NodeError {
    /// Create a node error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Crate-level errors for the EdgeQL engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Compilation refused: the report carries every finding
    #[error("pipeline validation failed: {0}")]
    Validation(ValidationReport),

    /// Dataset could not be resolved or read
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Custom-node manifest or discovery problem
    #[error("node registry error: {0}")]
    Registry(String),

    /// Execution-level fault outside any single node
    #[error("execution error: {0}")]
    Execution(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Sandbox substrate failure
    #[error("sandbox error: {0}")]
    Sandbox(#[from] edgeql_sandbox::SandboxError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the EdgeQL engine.
pub type Result<T> = std::result::Result<T, Error>;
