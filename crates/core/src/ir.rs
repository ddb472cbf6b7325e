//! Compiled pipeline representation
//!
//! The IR is the executor's only input: compiled nodes in a valid
//! topological order plus metadata with a content hash. It round-trips
//! losslessly through serde, so a stored IR executes identically to a
//! freshly compiled one.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::RuntimeKind;
use crate::schema::DataSchema;

/// Engine version stamped into compiled IRs.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One node after compilation: resolved parameters, schema, and runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledNode {
    /// Unique node id
    pub id: String,
    /// Declared type name
    pub node_type: String,
    /// Runtime kind selecting the runner
    pub runtime: RuntimeKind,
    /// Parameters with defaults applied
    pub params: Map<String, Value>,
    /// Upstream node ids, in declared order
    pub depends_on: Vec<String>,
    /// Input port names aligned with `depends_on`
    pub input_ports: Vec<String>,
    /// Resolved output schema
    pub output_schema: DataSchema,
    /// Entry-point file for custom nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<PathBuf>,
    /// Source directory for custom nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_root: Option<PathBuf>,
    /// Per-node wall-clock override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Compilation metadata attached to an IR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrMetadata {
    /// When compilation finished
    pub compiled_at: DateTime<Utc>,
    /// Engine version that produced the IR
    pub version: String,
    /// Number of compiled nodes
    pub node_count: usize,
    /// SHA-256 over the canonicalized node list; identical sources hash
    /// identically regardless of when they were compiled
    pub content_hash: String,
}

/// A compiled, validated pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineIr {
    /// Compiled nodes in execution (topological) order
    pub nodes: Vec<CompiledNode>,
    /// Compilation metadata
    pub metadata: IrMetadata,
}

impl PipelineIr {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node ids in execution order.
    pub fn execution_order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    /// Ids of nodes no other node consumes; their artifacts become the run's
    /// final outputs.
    pub fn sink_ids(&self) -> Vec<&str> {
        let consumed: std::collections::HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.depends_on.iter().map(String::as_str))
            .collect();
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !consumed.contains(id))
            .collect()
    }

    /// Downstream adjacency: node id → ids that depend on it.
    pub fn dependents(&self) -> HashMap<&str, Vec<&str>> {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends_on {
                map.entry(dep.as_str()).or_default().push(node.id.as_str());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataSchema;
    use pretty_assertions::assert_eq;

    fn node(id: &str, deps: &[&str]) -> CompiledNode {
        CompiledNode {
            id: id.to_string(),
            node_type: "DataLoaderNode".to_string(),
            runtime: RuntimeKind::Builtin,
            params: Map::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            input_ports: deps.iter().enumerate().map(|(i, _)| format!("input{i}")).collect(),
            output_schema: DataSchema::dataframe(["timestamp"]),
            entry_point: None,
            node_root: None,
            timeout_ms: None,
        }
    }

    fn ir(nodes: Vec<CompiledNode>) -> PipelineIr {
        let node_count = nodes.len();
        PipelineIr {
            nodes,
            metadata: IrMetadata {
                compiled_at: Utc::now(),
                version: ENGINE_VERSION.to_string(),
                node_count,
                content_hash: "test".to_string(),
            },
        }
    }

    #[test]
    fn test_lookup_and_order() {
        let ir = ir(vec![node("a", &[]), node("b", &["a"])]);
        assert_eq!(ir.execution_order(), vec!["a", "b"]);
        assert!(ir.node("a").is_some());
        assert!(ir.node("z").is_none());
    }

    #[test]
    fn test_sink_ids() {
        let ir = ir(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b"]),
        ]);
        let sinks = ir.sink_ids();
        assert_eq!(sinks, vec!["c", "d"]);
    }

    #[test]
    fn test_dependents() {
        let ir = ir(vec![node("a", &[]), node("b", &["a"]), node("c", &["a"])]);
        let dependents = ir.dependents();
        assert_eq!(dependents["a"], vec!["b", "c"]);
        assert!(!dependents.contains_key("b"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = ir(vec![node("a", &[]), node("b", &["a"])]);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: PipelineIr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }
}
