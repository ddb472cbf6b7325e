//! EdgeQL Core
//!
//! The backtesting pipeline engine: a declarative JSON pipeline source is
//! parsed, validated against the node catalog, compiled into a topologically
//! ordered IR, and executed by a bounded worker pool that dispatches each
//! node to an in-process builtin runner or an ephemeral sandboxed container.
//!
//! ## Subsystems
//!
//! - **Compiler**: [`parser`] → [`validator`] → [`compiler`] produce a
//!   [`ir::PipelineIr`] or a [`validator::ValidationReport`]
//! - **Catalog**: [`catalog`] unifies the fixed builtin set with custom
//!   nodes discovered from [`manifest`] files on disk
//! - **Execution**: [`executor`] schedules the DAG over [`runners`], routing
//!   [`artifact::Artifact`]s between nodes and aggregating a [`run::Run`]
//! - **Data**: [`dataframe`], [`dataset`], [`indicators`], and the builtin
//!   node implementations under [`nodes`]

pub mod artifact;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod dataframe;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod indicators;
pub mod ir;
pub mod manifest;
pub mod nodes;
pub mod parser;
pub mod run;
pub mod runners;
pub mod schema;
pub mod storage;
pub mod validator;

// Re-exports
pub use artifact::{
    Artifact, BacktestMetrics, BacktestResults, EquityPoint, Trade, TradeSide,
};
pub use catalog::{BuiltinType, DiscoveryReport, NodeCatalog, NodeType, RuntimeKind};
pub use compiler::Compiler;
pub use config::{EngineConfig, ReaperSettings, SandboxSettings};
pub use dataframe::{
    Column, ColumnData, DataFrame, OHLCV_COLUMNS, SIGNAL_COLUMN, TIMESTAMP_COLUMN,
};
pub use dataset::{
    read_dataset, DatasetDescriptor, DatasetFormat, DatasetProvider, FsDatasetProvider,
};
pub use error::{Error, ErrorCode, NodeError, Result};
pub use executor::{Executor, ExecutorConfig};
pub use indicators::Indicator;
pub use ir::{CompiledNode, IrMetadata, PipelineIr, ENGINE_VERSION};
pub use manifest::{DiscoveredNode, DiscoveryIssue, NodeManifest};
pub use parser::{parse_pipeline, NodeDecl, ParseOutcome, Span};
pub use run::{
    LogCollector, LogEntry, LogLevel, NodeResult, ResourceUsage, Run, RunStatus,
};
pub use runners::{
    BuiltinRunner, ExecutionContext, NodeRunner, RunnerRegistry, SandboxNodeRunner,
};
pub use schema::{ArtifactKind, DataSchema, DependencyArity, ParamKind, ParamSchema, PortContract};
pub use storage::{MemoryStorage, StorageBackend};
pub use validator::{validate_pipeline, Severity, ValidationIssue, ValidationReport};

// Sandbox substrate re-exports for embedders
pub use edgeql_sandbox as sandbox;
