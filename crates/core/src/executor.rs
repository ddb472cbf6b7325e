//! Pipeline executor
//!
//! Schedules a compiled IR over a bounded worker pool: nodes become ready
//! when every dependency has published its artifact, inputs are collected in
//! declared order, and each node runs under its own timeout with the run's
//! cancellation token. The first failure fails the run fast: peers are
//! cancelled, the pool drains within a bounded window, and the partial
//! results (including logs) are returned.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::compiler::Compiler;
use crate::catalog::NodeCatalog;
use crate::dataset::DatasetProvider;
use crate::error::{ErrorCode, NodeError, Result};
use crate::ir::PipelineIr;
use crate::run::{LogCollector, NodeResult, Run, RunStatus};
use crate::runners::{ExecutionContext, NodeRunner, RunnerRegistry};
use crate::storage::{StorageBackend, RUNS};

/// Executor tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Maximum concurrently executing nodes
    pub workers: usize,
    /// Wall clock applied to nodes without their own override
    pub default_node_timeout: Duration,
    /// Bound on the drain after fail-fast or cancellation
    pub drain_timeout: Duration,
}

impl ExecutorConfig {
    /// Default worker count: `min(cpu count, 4)`.
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            default_node_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Bookkeeping for a live run.
struct RunHandle {
    token: CancellationToken,
    user_cancelled: Arc<AtomicBool>,
}

/// Executes compiled pipelines.
pub struct Executor {
    catalog: Arc<NodeCatalog>,
    registry: Arc<RunnerRegistry>,
    datasets: Arc<dyn DatasetProvider>,
    storage: Option<Arc<dyn StorageBackend>>,
    config: ExecutorConfig,
    active: Mutex<HashMap<String, RunHandle>>,
}

impl Executor {
    /// Executor over a catalog, runner registry, and dataset provider.
    pub fn new(
        catalog: Arc<NodeCatalog>,
        registry: Arc<RunnerRegistry>,
        datasets: Arc<dyn DatasetProvider>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            datasets,
            storage: None,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Hand terminated runs off to a storage backend.
    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Compile and execute a pipeline source.
    pub async fn execute(&self, pipeline_id: &str, source: &str) -> Result<Run> {
        let ir = Compiler::new(&self.catalog).compile(source)?;
        self.execute_ir(pipeline_id, &ir).await
    }

    /// Execute an already-compiled IR.
    pub async fn execute_ir(&self, pipeline_id: &str, ir: &PipelineIr) -> Result<Run> {
        let run_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let user_cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(
                run_id.clone(),
                RunHandle {
                    token: token.clone(),
                    user_cancelled: user_cancelled.clone(),
                },
            );
        }

        let run = self
            .run_to_completion(pipeline_id, ir, &run_id, token, user_cancelled)
            .await;

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&run_id);
        drop(active);

        if let Some(storage) = &self.storage {
            match serde_json::to_value(&run) {
                Ok(value) => {
                    if let Err(err) = storage.put(RUNS, &run.run_id, &value) {
                        warn!(run_id = %run.run_id, %err, "failed to persist run");
                    }
                }
                Err(err) => warn!(run_id = %run.run_id, %err, "failed to serialize run"),
            }
        }
        Ok(run)
    }

    /// Ids of currently executing runs.
    pub fn active_runs(&self) -> Vec<String> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.keys().cloned().collect()
    }

    /// Cancel a live run. Returns true when the run was active; calling on
    /// terminal or unknown runs is a no-op.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let handle = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.get(run_id).map(|handle| {
                handle.user_cancelled.store(true, Ordering::SeqCst);
                handle.token.clone()
            })
        };
        match handle {
            Some(token) => {
                info!(run_id, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_to_completion(
        &self,
        pipeline_id: &str,
        ir: &PipelineIr,
        run_id: &str,
        token: CancellationToken,
        user_cancelled: Arc<AtomicBool>,
    ) -> Run {
        let mut run = Run::new(run_id, pipeline_id);
        run.mark_running();
        let mut engine_logs = LogCollector::new("executor");
        engine_logs.info(format!(
            "run started over {} node(s), {} worker(s)",
            ir.nodes.len(),
            self.config.workers
        ));
        info!(run_id, pipeline_id, nodes = ir.nodes.len(), "run started");

        let index_of: HashMap<&str, usize> = ir
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        let mut indegree: Vec<usize> = ir.nodes.iter().map(|n| n.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ir.nodes.len()];
        for (i, node) in ir.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                dependents[index_of[dep.as_str()]].push(i);
            }
        }
        // Remaining unexecuted consumers per node, for artifact GC.
        let mut consumers_left: Vec<usize> = dependents.iter().map(Vec::len).collect();

        // IR order is topological, so the initial ready set is in source
        // order already.
        let mut ready: VecDeque<usize> = (0..ir.nodes.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut artifacts: HashMap<String, Arc<Artifact>> = HashMap::new();
        let mut join_set: JoinSet<(usize, NodeResult)> = JoinSet::new();
        let mut failure: Option<NodeError> = None;

        loop {
            // Dispatch while there is capacity and the run is healthy.
            while failure.is_none()
                && !token.is_cancelled()
                && join_set.len() < self.config.workers
            {
                let Some(node_index) = ready.pop_front() else {
                    break;
                };
                self.spawn_node(ir, node_index, run_id, pipeline_id, &token, &artifacts, &mut join_set);
            }

            if join_set.is_empty() {
                break;
            }

            // When draining after a failure or cancel, bound the wait;
            // in-flight tasks race the cancellation token and return fast.
            let draining = failure.is_some() || token.is_cancelled();
            let joined = if draining {
                match tokio::time::timeout(self.config.drain_timeout, join_set.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(run_id, "drain timeout exceeded, aborting stragglers");
                        engine_logs.warn("drain timeout exceeded, force-killing remaining nodes");
                        join_set.abort_all();
                        break;
                    }
                }
            } else {
                join_set.join_next().await
            };

            let Some(joined) = joined else { break };
            let (node_index, result) = match joined {
                Ok(completed) => completed,
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(NodeError::new(
                            ErrorCode::InfrastructureError,
                            format!("worker task failed: {err}"),
                        ));
                        token.cancel();
                    }
                    continue;
                }
            };

            let node = &ir.nodes[node_index];
            debug!(
                run_id,
                node_id = %node.id,
                success = result.success,
                elapsed_ms = result.execution_time_ms,
                "node finished"
            );

            if result.success {
                let Some(artifact) = result.artifact.clone() else {
                    // A successful result always carries an artifact.
                    if failure.is_none() {
                        failure = Some(NodeError::new(
                            ErrorCode::InfrastructureError,
                            format!("node '{}' succeeded without an artifact", node.id),
                        ));
                        token.cancel();
                    }
                    run.record_result(result);
                    continue;
                };
                artifacts.insert(node.id.clone(), Arc::new(artifact));
                run.record_result(result);

                // Unlock dependents in source order.
                let mut unlocked = Vec::new();
                for &dependent in &dependents[node_index] {
                    indegree[dependent] -= 1;
                    if indegree[dependent] == 0 {
                        unlocked.push(dependent);
                    }
                }
                unlocked.sort_unstable();
                ready.extend(unlocked);

                // GC upstream artifacts with no unexecuted consumers left;
                // sinks are never collected (they become final outputs).
                for dep in &node.depends_on {
                    let dep_index = index_of[dep.as_str()];
                    consumers_left[dep_index] -= 1;
                    if consumers_left[dep_index] == 0 && !dependents[dep_index].is_empty() {
                        artifacts.remove(dep.as_str());
                    }
                }
            } else {
                let error = result.error.clone();
                let cancelled = error
                    .as_ref()
                    .map(|e| e.code == ErrorCode::Cancelled)
                    .unwrap_or(false);
                run.record_result(result);
                if !cancelled && failure.is_none() {
                    engine_logs.error(format!(
                        "node '{}' failed: {}",
                        node.id,
                        error
                            .as_ref()
                            .map(|e| e.message.as_str())
                            .unwrap_or("unknown error")
                    ));
                    failure = error.or_else(|| {
                        Some(NodeError::new(
                            ErrorCode::NodeRuntimeError,
                            "node failed without an error record",
                        ))
                    });
                    // Fail fast: no new nodes start, peers are cancelled.
                    token.cancel();
                }
            }
        }

        // Ensure no live containers remain on any abnormal exit path.
        if failure.is_some() || token.is_cancelled() {
            self.registry.cancel_all(run_id).await;
        }

        let status = if user_cancelled.load(Ordering::SeqCst) {
            RunStatus::Cancelled
        } else if let Some(error) = failure.take() {
            run.error = Some(error);
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        if status == RunStatus::Completed {
            for sink in ir.sink_ids() {
                if let Some(artifact) = artifacts.get(sink) {
                    run.final_outputs
                        .insert(sink.to_string(), artifact.as_ref().clone());
                }
            }
        }

        engine_logs.info(format!("run finished with status '{status}'"));
        run.logs = engine_logs.into_entries();
        run.finish(status);
        info!(run_id, %status, results = run.node_results.len(), "run finished");
        run
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_node(
        &self,
        ir: &PipelineIr,
        node_index: usize,
        run_id: &str,
        pipeline_id: &str,
        token: &CancellationToken,
        artifacts: &HashMap<String, Arc<Artifact>>,
        join_set: &mut JoinSet<(usize, NodeResult)>,
    ) {
        let node = ir.nodes[node_index].clone();
        let inputs: Vec<Arc<Artifact>> = node
            .depends_on
            .iter()
            .filter_map(|dep| artifacts.get(dep).cloned())
            .collect();
        if inputs.len() != node.depends_on.len() {
            // Scheduling invariant broken; surface as an infrastructure
            // failure rather than running the node on partial inputs.
            let node_id = node.id.clone();
            join_set.spawn(async move {
                (
                    node_index,
                    NodeResult::failure(
                        &node_id,
                        NodeError::new(
                            ErrorCode::InfrastructureError,
                            "dependency artifact missing from the artifact map",
                        ),
                        0,
                        Vec::new(),
                    ),
                )
            });
            return;
        }

        let Some(runner) = self.registry.runner_for(&node.runtime) else {
            let node_id = node.id.clone();
            let runtime = node.runtime;
            join_set.spawn(async move {
                (
                    node_index,
                    NodeResult::failure(
                        &node_id,
                        NodeError::new(
                            ErrorCode::InfrastructureError,
                            format!("no runner registered for runtime '{runtime}'"),
                        ),
                        0,
                        Vec::new(),
                    ),
                )
            });
            return;
        };

        let ctx = ExecutionContext {
            run_id: run_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            datasets: self.datasets.clone(),
            cancel: token.clone(),
        };
        let timeout = node
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_node_timeout);
        // The sandbox enforces the precise wall clock itself and cleans up
        // its container; the executor-level bound is a backstop and gets a
        // margin so the substrate's own classification lands first.
        let timeout = if node.runtime.is_custom() {
            timeout + Duration::from_secs(5)
        } else {
            timeout
        };

        debug!(run_id, node_id = %node.id, timeout_ms = timeout.as_millis() as u64, "node dispatched");
        join_set.spawn(async move {
            let started = Instant::now();
            let result = run_with_limits(runner, &node, &inputs, &ctx, timeout, started).await;
            (node_index, result)
        });
    }
}

/// Race the runner against the per-node timeout and the run's cancellation.
///
/// A timeout is a failure, not a cancellation; the distinction survives into
/// the node result code.
async fn run_with_limits(
    runner: Arc<dyn NodeRunner>,
    node: &crate::ir::CompiledNode,
    inputs: &[Arc<Artifact>],
    ctx: &ExecutionContext,
    timeout: Duration,
    started: Instant,
) -> NodeResult {
    tokio::select! {
        result = runner.execute(node, inputs, ctx) => result,
        _ = tokio::time::sleep(timeout) => {
            runner.cancel(&ctx.run_id).await;
            NodeResult::failure(
                &node.id,
                NodeError::new(
                    ErrorCode::Timeout,
                    format!("node exceeded wall-clock limit of {}ms", timeout.as_millis()),
                ),
                started.elapsed().as_millis() as u64,
                Vec::new(),
            )
        }
        _ = ctx.cancel.cancelled() => {
            NodeResult::failure(
                &node.id,
                NodeError::new(ErrorCode::Cancelled, "run cancelled"),
                started.elapsed().as_millis() as u64,
                Vec::new(),
            )
        }
    }
}
