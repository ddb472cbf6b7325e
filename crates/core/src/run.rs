//! Run model: statuses, node results, and structured logs
//!
//! A run is owned exclusively by the executor while it is live; once it
//! reaches a terminal status it is handed off to storage and never mutated
//! again.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::error::NodeError;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet scheduled
    Pending,
    /// Nodes are executing
    Running,
    /// Every node finished successfully
    Completed,
    /// At least one node failed; peers were cancelled
    Failed,
    /// Terminated by user cancellation
    Cancelled,
}

impl RunStatus {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// True for completed, failed, and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a wire level string, defaulting unknown levels to `Info`.
    pub fn from_str_lossy(level: &str) -> LogLevel {
        match level.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One structured log entry; offsets are strictly ordered within a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position within the source's log stream
    pub offset: u64,
    /// Wall-clock time of the entry
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Producer: a node id or `executor`
    pub source: String,
    /// Message text
    pub message: String,
}

/// Accumulates ordered log entries for one source.
#[derive(Debug, Clone)]
pub struct LogCollector {
    source: String,
    entries: Vec<LogEntry>,
}

impl LogCollector {
    /// Collector for the given source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entries: Vec::new(),
        }
    }

    /// Append an entry; offset and timestamp are assigned here.
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        self.entries.push(LogEntry {
            offset: self.entries.len() as u64,
            timestamp: Utc::now(),
            level,
            source: self.source.clone(),
            message: message.into(),
        });
    }

    /// Convenience for `Info` entries.
    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    /// Convenience for `Warn` entries.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    /// Convenience for `Error` entries.
    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    /// Consume the collector.
    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

/// One resource-usage sample attached to a node result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak observed memory in bytes
    pub peak_memory_bytes: u64,
    /// CPU usage percentage at sample time
    pub cpu_percent: f64,
}

/// Outcome of one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Node id
    pub node_id: String,
    /// True when the node produced its artifact
    pub success: bool,
    /// Wall-clock execution time in milliseconds
    pub execution_time_ms: u64,
    /// Produced artifact on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// Failure classification on error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    /// Ordered log entries from the node
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Resource accounting, when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl NodeResult {
    /// A successful result.
    pub fn success(
        node_id: impl Into<String>,
        artifact: Artifact,
        execution_time_ms: u64,
        logs: Vec<LogEntry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            success: true,
            execution_time_ms,
            artifact: Some(artifact),
            error: None,
            logs,
            resource_usage: None,
        }
    }

    /// A failed result.
    pub fn failure(
        node_id: impl Into<String>,
        error: NodeError,
        execution_time_ms: u64,
        logs: Vec<LogEntry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            success: false,
            execution_time_ms,
            artifact: None,
            error: Some(error),
            logs,
            resource_usage: None,
        }
    }

    /// Attach a resource-usage sample.
    pub fn with_resource_usage(mut self, usage: ResourceUsage) -> Self {
        self.resource_usage = Some(usage);
        self
    }
}

/// One execution of a compiled pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id (UUID)
    pub run_id: String,
    /// Pipeline the run was compiled from
    pub pipeline_id: String,
    /// Lifecycle state
    pub status: RunStatus,
    /// When execution started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Engine-level log entries
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Per-node results keyed by node id; present iff the node executed
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeResult>,
    /// Artifacts of nodes with no downstream consumers
    #[serde(default)]
    pub final_outputs: BTreeMap<String, Artifact>,
    /// The failure that terminated the run, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

impl Run {
    /// A fresh pending run.
    pub fn new(run_id: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
            node_results: BTreeMap::new(),
            final_outputs: BTreeMap::new(),
            error: None,
        }
    }

    /// Mark the run as executing.
    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move the run to a terminal status.
    pub fn finish(&mut self, status: RunStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Record one node's result.
    pub fn record_result(&mut self, result: NodeResult) {
        self.node_results.insert(result.node_id.clone(), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_status_terminal() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(RunStatus::Running.as_str(), "running");
    }

    #[test]
    fn test_log_level_lossy() {
        assert_eq!(LogLevel::from_str_lossy("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::from_str_lossy("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str_lossy("verbose"), LogLevel::Info);
    }

    #[test]
    fn test_collector_offsets_are_ordered() {
        let mut collector = LogCollector::new("node_a");
        collector.info("first");
        collector.warn("second");
        collector.error("third");
        let entries = collector.into_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[2].offset, 2);
        assert!(entries.windows(2).all(|w| w[0].offset < w[1].offset));
        assert!(entries.iter().all(|e| e.source == "node_a"));
        assert_eq!(entries[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_node_result_constructors() {
        let ok = NodeResult::success(
            "n1",
            Artifact::Opaque(serde_json::json!(1)),
            42,
            Vec::new(),
        );
        assert!(ok.success);
        assert!(ok.artifact.is_some());
        assert!(ok.error.is_none());

        let failed = NodeResult::failure(
            "n2",
            NodeError::new(ErrorCode::Timeout, "too slow"),
            60_000,
            Vec::new(),
        );
        assert!(!failed.success);
        assert!(failed.artifact.is_none());
        assert_eq!(failed.error.as_ref().unwrap().code, ErrorCode::Timeout);
    }

    #[test]
    fn test_node_result_resource_usage() {
        let result = NodeResult::success(
            "n1",
            Artifact::Opaque(serde_json::Value::Null),
            1,
            Vec::new(),
        )
        .with_resource_usage(ResourceUsage {
            peak_memory_bytes: 1024,
            cpu_percent: 12.5,
        });
        assert_eq!(result.resource_usage.unwrap().peak_memory_bytes, 1024);
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new("r1", "p1");
        assert_eq!(run.status, RunStatus::Pending);
        run.mark_running();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        run.finish(RunStatus::Completed);
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_run_serde_roundtrip() {
        let mut run = Run::new("r1", "p1");
        run.record_result(NodeResult::success(
            "a",
            Artifact::Opaque(serde_json::json!({"v": 1})),
            5,
            Vec::new(),
        ));
        run.finish(RunStatus::Completed);
        let json = serde_json::to_string(&run).unwrap();
        let parsed: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, run);
    }
}
