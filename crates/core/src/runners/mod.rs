//! Runner registry and the runner seam
//!
//! A runner executes compiled nodes of the runtime kinds it declares. The
//! registry holds runners in priority order; the first one whose
//! `can_handle` matches wins, and builtins register ahead of the sandbox so
//! reserved type names never leave the process.

pub mod builtin;
pub mod sandbox;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::artifact::Artifact;
use crate::catalog::RuntimeKind;
use crate::dataset::DatasetProvider;
use crate::ir::CompiledNode;
use crate::run::NodeResult;

pub use builtin::BuiltinRunner;
pub use sandbox::SandboxNodeRunner;

/// Per-run context handed to every runner invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Run id
    pub run_id: String,
    /// Pipeline id
    pub pipeline_id: String,
    /// Dataset provider for loaders and container mounts
    pub datasets: Arc<dyn DatasetProvider>,
    /// Cancelled when the run is cancelled or fails fast
    pub cancel: CancellationToken,
}

/// Executes nodes of particular runtime kinds.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// True when this runner executes the given runtime kind.
    fn can_handle(&self, runtime: &RuntimeKind) -> bool;

    /// Execute one node. Failures come back inside the result, never as a
    /// panic; the `cancel` token on the context must be honored.
    async fn execute(
        &self,
        node: &CompiledNode,
        inputs: &[Arc<Artifact>],
        ctx: &ExecutionContext,
    ) -> NodeResult;

    /// Cancel any in-flight work belonging to a run. Idempotent.
    async fn cancel(&self, run_id: &str);
}

/// Ordered runner registry; first `can_handle` wins.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: Vec<Arc<dyn NodeRunner>>,
}

impl RunnerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a runner at the lowest remaining priority.
    pub fn register(&mut self, runner: Arc<dyn NodeRunner>) {
        self.runners.push(runner);
    }

    /// Find the runner for a runtime kind.
    pub fn runner_for(&self, runtime: &RuntimeKind) -> Option<Arc<dyn NodeRunner>> {
        self.runners
            .iter()
            .find(|runner| runner.can_handle(runtime))
            .cloned()
    }

    /// Fan a cancellation out to every runner.
    pub async fn cancel_all(&self, run_id: &str) {
        for runner in &self.runners {
            runner.cancel(run_id).await;
        }
    }

    /// Number of registered runners.
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// True when no runner is registered.
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
