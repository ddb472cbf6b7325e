//! EdgeQL Sandbox
//!
//! Runs one custom-node invocation per ephemeral container with strict
//! resource limits, and cleans up deterministically on every exit path.
//! This crate is the substrate under the engine's sandbox runner:
//!
//! - **Provisioning**: per-invocation working directory, input descriptor,
//!   hardened container flags (no network, read-only root, non-root user,
//!   CPU/memory/tmpfs caps)
//! - **Wire protocol**: `input.json` in, `output.json` + log file out
//! - **Lifecycle**: wall-clock timeout, cooperative cancellation with a
//!   grace period, failure classification, resource accounting
//! - **Hygiene**: idempotent container removal, workdir deletion, and a
//!   periodic reaper for orphans left behind by crashes

use thiserror::Error;

pub mod container;
pub mod image;
pub mod limits;
pub mod protocol;
pub mod reaper;
pub mod runner;

pub use container::{
    ContainerDriver, ContainerRegistry, ContainerSpec, ContainerState, StatsSample,
    DATASETS_MOUNT, NODE_MOUNT, WORKSPACE_MOUNT,
};
pub use image::{ImageCatalog, NodeRuntime};
pub use limits::ResourceLimits;
pub use protocol::{
    read_output_descriptor, write_input_descriptor, FileRef, InputDescriptor, InvocationContext,
    OutputDescriptor, PortPayload, WireLogEntry, INLINE_THRESHOLD_BYTES, INPUT_FILE, LOG_FILE,
    OUTPUT_FILE,
};
pub use reaper::{Reaper, ReaperConfig, SweepStats};
pub use runner::{
    FailureKind, Invocation, InvocationOutcome, InvocationReport, SandboxRunner,
    SandboxRunnerConfig,
};

/// Errors raised by the sandbox substrate itself.
///
/// Node-level failures (timeouts, nonzero exits, protocol violations) are not
/// errors at this layer: they come back as [`runner::InvocationOutcome::Failed`]
/// so that cleanup and reporting stay uniform.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No usable container driver binary on this host
    #[error("container driver unavailable: {0}")]
    DriverUnavailable(String),

    /// A driver subcommand could not be spawned or produced garbage
    #[error("container driver command failed: {0}")]
    CommandFailed(String),

    /// The invocation description is unusable (bad entry point, bad mounts)
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    /// Host-side IO failure (workdir, descriptor files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire payload could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
