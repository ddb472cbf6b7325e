//! Sandboxed runner for custom nodes
//!
//! Bridges compiled nodes and typed artifacts onto the container substrate:
//! marshals inputs into the wire protocol (file-backed above the inline
//! threshold), resolves resource limits from manifest overrides, classifies
//! the invocation outcome, and typechecks the produced artifact against the
//! node's resolved output schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use edgeql_sandbox::{
    FailureKind, FileRef, InputDescriptor, Invocation, InvocationOutcome, InvocationReport,
    PortPayload, ResourceLimits, SandboxRunner, WireLogEntry, DATASETS_MOUNT, INLINE_THRESHOLD_BYTES,
    WORKSPACE_MOUNT,
};
use tracing::warn;

use crate::artifact::Artifact;
use crate::catalog::{NodeCatalog, RuntimeKind};
use crate::error::{ErrorCode, NodeError};
use crate::ir::CompiledNode;
use crate::run::{LogEntry, LogLevel, NodeResult, ResourceUsage};
use crate::runners::{ExecutionContext, NodeRunner};

/// Executes custom nodes in ephemeral containers.
pub struct SandboxNodeRunner {
    sandbox: Arc<SandboxRunner>,
    catalog: Arc<NodeCatalog>,
    default_limits: ResourceLimits,
}

impl SandboxNodeRunner {
    /// Runner over a sandbox substrate and the catalog (for manifest
    /// resource overrides).
    pub fn new(
        sandbox: Arc<SandboxRunner>,
        catalog: Arc<NodeCatalog>,
        default_limits: ResourceLimits,
    ) -> Self {
        Self {
            sandbox,
            catalog,
            default_limits,
        }
    }

    /// Resolve limits: defaults, then manifest metadata, then the compiled
    /// node's timeout override.
    fn limits_for(&self, node: &CompiledNode) -> ResourceLimits {
        let metadata = self
            .catalog
            .lookup(&node.node_type)
            .and_then(|t| t.manifest_metadata().cloned());
        let (memory_mib, cpu) = metadata
            .map(|m| (m.memory_mib, m.cpu))
            .unwrap_or((None, None));
        self.default_limits
            .clone()
            .with_overrides(node.timeout_ms, memory_mib, cpu)
    }

    fn marshal_inputs(
        &self,
        node: &CompiledNode,
        inputs: &[Arc<Artifact>],
    ) -> Result<(BTreeMap<String, PortPayload>, Vec<(String, Vec<u8>)>), NodeError> {
        let mut ports = BTreeMap::new();
        let mut extra_files = Vec::new();
        for (i, artifact) in inputs.iter().enumerate() {
            let port = node
                .input_ports
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("input{i}"));
            let value = serde_json::to_value(artifact.as_ref()).map_err(|err| {
                NodeError::new(
                    ErrorCode::InfrastructureError,
                    format!("cannot serialize input '{port}': {err}"),
                )
            })?;
            let serialized = value.to_string();
            if serialized.len() > INLINE_THRESHOLD_BYTES {
                let rel_path = format!("inputs/{port}.json");
                ports.insert(
                    port,
                    PortPayload::File(FileRef {
                        path: format!("{WORKSPACE_MOUNT}/{rel_path}"),
                    }),
                );
                extra_files.push((rel_path, serialized.into_bytes()));
            } else {
                ports.insert(port, PortPayload::Inline(value));
            }
        }
        Ok((ports, extra_files))
    }

    fn dataset_mounts(&self, ctx: &ExecutionContext) -> BTreeMap<String, String> {
        match ctx.datasets.list() {
            Ok(descriptors) => descriptors
                .into_iter()
                .filter_map(|d| {
                    let file_name = d.path.file_name()?.to_str()?.to_string();
                    Some((d.name, format!("{DATASETS_MOUNT}/{file_name}")))
                })
                .collect(),
            Err(err) => {
                warn!(%err, "could not enumerate datasets for sandbox context");
                BTreeMap::new()
            }
        }
    }
}

#[async_trait]
impl NodeRunner for SandboxNodeRunner {
    fn can_handle(&self, runtime: &RuntimeKind) -> bool {
        runtime.is_custom()
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        inputs: &[Arc<Artifact>],
        ctx: &ExecutionContext,
    ) -> NodeResult {
        let Some(runtime) = node.runtime.sandbox_runtime() else {
            return infra_failure(node, "node runtime is not sandboxable");
        };
        let (Some(entry_point), Some(node_root)) = (&node.entry_point, &node.node_root) else {
            return infra_failure(node, "custom node has no entry point recorded");
        };

        let (ports, extra_files) = match self.marshal_inputs(node, inputs) {
            Ok(marshalled) => marshalled,
            Err(error) => return NodeResult::failure(&node.id, error, 0, Vec::new()),
        };
        let limits = self.limits_for(node);
        let invocation = Invocation {
            run_id: ctx.run_id.clone(),
            node_id: node.id.clone(),
            runtime,
            node_root: node_root.clone(),
            entry_point: entry_point.clone(),
            input: InputDescriptor {
                node_type: node.node_type.clone(),
                params: node.params.clone(),
                inputs: ports,
                context: edgeql_sandbox::InvocationContext {
                    run_id: ctx.run_id.clone(),
                    pipeline_id: ctx.pipeline_id.clone(),
                    datasets: self.dataset_mounts(ctx),
                },
            },
            extra_files,
            limits,
        };

        let report = match self.sandbox.invoke(invocation, ctx.cancel.clone()).await {
            Ok(report) => report,
            Err(err) => return infra_failure(node, &err.to_string()),
        };
        node_result_from_report(node, report)
    }

    async fn cancel(&self, run_id: &str) {
        self.sandbox
            .cancel_run(run_id, self.default_limits.grace_period)
            .await;
    }
}

fn infra_failure(node: &CompiledNode, message: &str) -> NodeResult {
    NodeResult::failure(
        &node.id,
        NodeError::new(ErrorCode::InfrastructureError, message),
        0,
        Vec::new(),
    )
}

/// Map a sandbox failure kind onto the stable error code space.
fn error_code_for(kind: FailureKind) -> ErrorCode {
    match kind {
        FailureKind::Runtime => ErrorCode::NodeRuntimeError,
        FailureKind::Timeout => ErrorCode::Timeout,
        FailureKind::ResourceExhaustion => ErrorCode::ResourceExhaustion,
        FailureKind::Protocol => ErrorCode::ProtocolViolation,
        FailureKind::Infrastructure => ErrorCode::InfrastructureError,
        FailureKind::Cancelled => ErrorCode::Cancelled,
    }
}

fn logs_from_wire(node_id: &str, wire: Vec<WireLogEntry>) -> Vec<LogEntry> {
    wire.into_iter()
        .map(|entry| LogEntry {
            offset: entry.offset,
            timestamp: entry.ts,
            level: LogLevel::from_str_lossy(&entry.level),
            source: node_id.to_string(),
            message: entry.message,
        })
        .collect()
}

fn node_result_from_report(node: &CompiledNode, report: InvocationReport) -> NodeResult {
    let execution_time_ms = report.duration.as_millis() as u64;
    let logs = logs_from_wire(&node.id, report.logs);
    let usage = report.stats.map(|stats| ResourceUsage {
        peak_memory_bytes: stats.memory_bytes,
        cpu_percent: stats.cpu_percent,
    });

    let result = match report.outcome {
        InvocationOutcome::Completed(descriptor) => {
            match Artifact::from_wire(&descriptor.kind, descriptor.data, descriptor.metadata) {
                Ok(artifact) => match artifact.conforms_to(&node.output_schema) {
                    Ok(()) => NodeResult::success(&node.id, artifact, execution_time_ms, logs),
                    Err(message) => NodeResult::failure(
                        &node.id,
                        NodeError::new(
                            ErrorCode::ProtocolViolation,
                            format!("output does not match declared schema: {message}"),
                        ),
                        execution_time_ms,
                        logs,
                    ),
                },
                Err(message) => NodeResult::failure(
                    &node.id,
                    NodeError::new(ErrorCode::ProtocolViolation, message),
                    execution_time_ms,
                    logs,
                ),
            }
        }
        InvocationOutcome::Failed { kind, message } => NodeResult::failure(
            &node.id,
            NodeError::new(error_code_for(kind), message),
            execution_time_ms,
            logs,
        ),
    };
    match usage {
        Some(usage) => result.with_resource_usage(usage),
        None => result,
    }
}
