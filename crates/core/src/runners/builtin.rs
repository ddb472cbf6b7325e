//! In-process runner for the builtin node set

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::artifact::Artifact;
use crate::catalog::{BuiltinType, RuntimeKind};
use crate::error::{ErrorCode, NodeError};
use crate::ir::CompiledNode;
use crate::nodes;
use crate::run::{LogCollector, NodeResult};
use crate::runners::{ExecutionContext, NodeRunner};

/// Executes builtin nodes in-process.
///
/// Builtins report logs through the same structured channel as sandboxed
/// nodes; they do not suspend on external IO except dataset reads.
#[derive(Debug, Default)]
pub struct BuiltinRunner;

impl BuiltinRunner {
    /// Create the runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeRunner for BuiltinRunner {
    fn can_handle(&self, runtime: &RuntimeKind) -> bool {
        *runtime == RuntimeKind::Builtin
    }

    async fn execute(
        &self,
        node: &CompiledNode,
        inputs: &[Arc<Artifact>],
        ctx: &ExecutionContext,
    ) -> NodeResult {
        let started = Instant::now();
        let mut logs = LogCollector::new(&node.id);
        debug!(
            run_id = %ctx.run_id,
            node_id = %node.id,
            node_type = %node.node_type,
            "executing builtin node"
        );

        let output = match BuiltinType::from_type_name(&node.node_type) {
            Some(BuiltinType::DataLoader) => {
                nodes::data_loader::run(&node.params, ctx.datasets.as_ref(), &mut logs)
            }
            Some(BuiltinType::Indicator) => nodes::indicator::run(&node.params, inputs, &mut logs),
            Some(BuiltinType::CrossoverSignal) => {
                nodes::crossover::run(&node.params, inputs, &mut logs)
            }
            Some(BuiltinType::Backtest) => nodes::backtest::run(&node.params, inputs, &mut logs),
            Some(BuiltinType::FeatureGenerator) => {
                nodes::feature_generator::run(&node.params, inputs, &mut logs)
            }
            Some(BuiltinType::Labeling) => nodes::labeling::run(&node.params, inputs, &mut logs),
            None => Err(NodeError::new(
                ErrorCode::InfrastructureError,
                format!("'{}' is not a builtin type", node.node_type),
            )),
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match output {
            Ok(artifact) => {
                if let Err(message) = artifact.conforms_to(&node.output_schema) {
                    return NodeResult::failure(
                        &node.id,
                        NodeError::new(
                            ErrorCode::ProtocolViolation,
                            format!("artifact does not match resolved schema: {message}"),
                        ),
                        execution_time_ms,
                        logs.into_entries(),
                    );
                }
                NodeResult::success(&node.id, artifact, execution_time_ms, logs.into_entries())
            }
            Err(error) => {
                logs.error(error.message.clone());
                NodeResult::failure(&node.id, error, execution_time_ms, logs.into_entries())
            }
        }
    }

    async fn cancel(&self, _run_id: &str) {
        // Builtin nodes are short-lived; the executor's token gates
        // scheduling, so there is nothing to tear down here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::FsDatasetProvider;
    use crate::schema::DataSchema;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn context(dir: &std::path::Path) -> ExecutionContext {
        ExecutionContext {
            run_id: "run-1".to_string(),
            pipeline_id: "pipe-1".to_string(),
            datasets: Arc::new(FsDatasetProvider::new(dir)),
            cancel: CancellationToken::new(),
        }
    }

    fn loader_node() -> CompiledNode {
        CompiledNode {
            id: "loader".to_string(),
            node_type: "DataLoaderNode".to_string(),
            runtime: RuntimeKind::Builtin,
            params: json!({"symbol": "SPY", "timeframe": "1d", "dataset": "sample.csv"})
                .as_object()
                .unwrap()
                .clone(),
            depends_on: Vec::new(),
            input_ports: Vec::new(),
            output_schema: DataSchema::dataframe(crate::dataframe::OHLCV_COLUMNS),
            entry_point: None,
            node_root: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_can_handle_builtin_only() {
        let runner = BuiltinRunner::new();
        assert!(runner.can_handle(&RuntimeKind::Builtin));
        assert!(!runner.can_handle(&RuntimeKind::CustomJs));
        assert!(!runner.can_handle(&RuntimeKind::CustomPython));
    }

    #[tokio::test]
    async fn test_execute_data_loader_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sample.csv"),
            "timestamp,open,high,low,close,volume\n2024-01-01,1,2,0.5,1.5,100\n",
        )
        .unwrap();
        let runner = BuiltinRunner::new();
        let result = runner
            .execute(&loader_node(), &[], &context(dir.path()))
            .await;
        assert!(result.success, "failed: {:?}", result.error);
        assert!(result.artifact.is_some());
        assert!(!result.logs.is_empty());
        assert_eq!(result.node_id, "loader");
    }

    #[tokio::test]
    async fn test_execute_failure_captures_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = BuiltinRunner::new();
        // Dataset missing on disk
        let result = runner
            .execute(&loader_node(), &[], &context(dir.path()))
            .await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::InfrastructureError);
        assert!(result
            .logs
            .iter()
            .any(|e| e.level == crate::run::LogLevel::Error));
    }

    #[tokio::test]
    async fn test_execute_schema_conformance_checked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sample.csv"),
            "timestamp,open,high,low,close,volume\n2024-01-01,1,2,0.5,1.5,100\n",
        )
        .unwrap();
        let mut node = loader_node();
        // Declare a column the loader will not produce
        node.output_schema = DataSchema::dataframe(["timestamp", "vwap"]);
        let runner = BuiltinRunner::new();
        let result = runner.execute(&node, &[], &context(dir.path())).await;
        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().code,
            ErrorCode::ProtocolViolation
        );
    }

    #[tokio::test]
    async fn test_execute_unknown_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = loader_node();
        node.node_type = "MysteryNode".to_string();
        let runner = BuiltinRunner::new();
        let result = runner.execute(&node, &[], &context(dir.path())).await;
        assert_eq!(
            result.error.unwrap().code,
            ErrorCode::InfrastructureError
        );
    }
}
