//! Pipeline compiler
//!
//! Parses and validates the source, computes the execution order with Kahn's
//! algorithm (source order breaks ties, so compilation is deterministic), and
//! rewrites each declaration into a compiled node with defaults applied and
//! output schema resolved. Compilation never partially emits: any blocking
//! finding returns the full report instead of an IR.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::catalog::NodeCatalog;
use crate::error::{Error, Result};
use crate::ir::{CompiledNode, IrMetadata, PipelineIr, ENGINE_VERSION};
use crate::parser::{parse_pipeline, NodeDecl};
use crate::schema::DataSchema;
use crate::validator::validate_pipeline;

/// Compiles pipeline sources against a catalog.
pub struct Compiler<'a> {
    catalog: &'a NodeCatalog,
}

impl<'a> Compiler<'a> {
    /// Compiler over the given catalog.
    pub fn new(catalog: &'a NodeCatalog) -> Self {
        Self { catalog }
    }

    /// Compile source text to an IR, or return the full validation report.
    pub fn compile(&self, source: &str) -> Result<PipelineIr> {
        let outcome = parse_pipeline(source);
        let report = validate_pipeline(self.catalog, &outcome.decls, outcome.issues);
        if report.has_errors() {
            return Err(Error::Validation(report));
        }

        let order = topological_order(&outcome.decls);
        let mut schemas: HashMap<&str, DataSchema> = HashMap::new();
        let mut nodes = Vec::with_capacity(outcome.decls.len());

        for &index in &order {
            let decl = &outcome.decls[index];
            let node_type = self
                .catalog
                .lookup(&decl.node_type)
                .ok_or_else(|| Error::Execution(format!(
                    "type '{}' vanished from the catalog during compilation",
                    decl.node_type
                )))?;

            let params = node_type.param_schema().apply_defaults(&decl.params);
            let inputs: Vec<&DataSchema> = decl
                .depends_on
                .iter()
                .map(|dep| &schemas[dep.as_str()])
                .collect();
            let output_schema = node_type
                .output_schema(&params, &inputs)
                .map_err(Error::Execution)?;
            schemas.insert(decl.id.as_str(), output_schema.clone());

            let timeout_ms = node_type
                .manifest_metadata()
                .and_then(|metadata| metadata.timeout_ms);

            nodes.push(CompiledNode {
                id: decl.id.clone(),
                node_type: decl.node_type.clone(),
                runtime: node_type.runtime(),
                input_ports: node_type.input_port_names(&params, decl.depends_on.len()),
                params,
                depends_on: decl.depends_on.clone(),
                output_schema,
                entry_point: node_type.entry_point().map(Into::into),
                node_root: node_type.node_root().map(Into::into),
                timeout_ms,
            });
        }

        let content_hash = content_hash(&nodes)?;
        debug!(
            nodes = nodes.len(),
            hash = %content_hash,
            "pipeline compiled"
        );
        Ok(PipelineIr {
            metadata: IrMetadata {
                compiled_at: Utc::now(),
                version: ENGINE_VERSION.to_string(),
                node_count: nodes.len(),
                content_hash,
            },
            nodes,
        })
    }
}

/// Kahn's algorithm with source-order tie-breaks.
///
/// The validator has already rejected cycles and missing dependencies, so
/// every node is emitted exactly once.
fn topological_order(decls: &[NodeDecl]) -> Vec<usize> {
    let index_of: HashMap<&str, usize> = decls
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.as_str(), i))
        .collect();

    let mut indegree: Vec<usize> = decls.iter().map(|d| d.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); decls.len()];
    for (i, decl) in decls.iter().enumerate() {
        for dep in &decl.depends_on {
            dependents[index_of[dep.as_str()]].push(i);
        }
    }

    // Ready nodes are drained smallest-source-index first.
    let mut ready: VecDeque<usize> = (0..decls.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(decls.len());
    while let Some(node) = ready.pop_front() {
        order.push(node);
        let mut unlocked: Vec<usize> = Vec::new();
        for &dependent in &dependents[node] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                unlocked.push(dependent);
            }
        }
        unlocked.sort_unstable();
        // Merge newly ready nodes keeping the queue sorted by source index.
        for dependent in unlocked {
            let position = ready
                .iter()
                .position(|&queued| queued > dependent)
                .unwrap_or(ready.len());
            ready.insert(position, dependent);
        }
    }
    order
}

/// SHA-256 over the canonical JSON form of the compiled nodes.
///
/// Canonical form sorts object keys recursively, so hashing is independent of
/// map iteration order and of when compilation ran.
fn content_hash(nodes: &[CompiledNode]) -> Result<String> {
    let value = serde_json::to_value(nodes)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{digest:x}"))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RuntimeKind;
    use crate::error::ErrorCode;
    use crate::schema::ArtifactKind;
    use pretty_assertions::assert_eq;

    const CROSSOVER_PIPELINE: &str = r#"[
        {"id": "data_loader", "type": "DataLoaderNode",
         "params": {"symbol": "SPY", "timeframe": "1d", "dataset": "sample_ohlcv.csv"}},
        {"id": "fast_ma", "type": "IndicatorNode", "depends_on": ["data_loader"],
         "params": {"indicator": "SMA", "period": 10}},
        {"id": "slow_ma", "type": "IndicatorNode", "depends_on": ["data_loader"],
         "params": {"indicator": "SMA", "period": 20}},
        {"id": "signals", "type": "CrossoverSignalNode", "depends_on": ["fast_ma", "slow_ma"],
         "params": {"fast_column": "sma_10", "slow_column": "sma_20"}},
        {"id": "backtest", "type": "BacktestNode", "depends_on": ["signals", "data_loader"],
         "params": {"initial_capital": 10000, "commission": 0.001}}
    ]"#;

    fn compile(source: &str) -> Result<PipelineIr> {
        let catalog = NodeCatalog::new();
        Compiler::new(&catalog).compile(source)
    }

    #[test]
    fn test_compile_crossover_pipeline() {
        let ir = compile(CROSSOVER_PIPELINE).unwrap();
        assert_eq!(
            ir.execution_order(),
            vec!["data_loader", "fast_ma", "slow_ma", "signals", "backtest"]
        );
        assert_eq!(ir.metadata.node_count, 5);
        assert_eq!(ir.metadata.version, ENGINE_VERSION);
        assert!(!ir.metadata.content_hash.is_empty());
    }

    #[test]
    fn test_compile_applies_defaults() {
        let ir = compile(CROSSOVER_PIPELINE).unwrap();
        let fast = ir.node("fast_ma").unwrap();
        assert_eq!(fast.params["column"], "close");
        let backtest = ir.node("backtest").unwrap();
        assert_eq!(backtest.params["position_size"], 1.0);
        assert_eq!(backtest.params["slippage"], 0.0);
        // Explicit values win over defaults
        assert_eq!(backtest.params["commission"], 0.001);
    }

    #[test]
    fn test_compile_resolves_schemas_and_runtime() {
        let ir = compile(CROSSOVER_PIPELINE).unwrap();
        let fast = ir.node("fast_ma").unwrap();
        assert_eq!(fast.runtime, RuntimeKind::Builtin);
        assert!(fast.output_schema.has_column("sma_10"));
        let signals = ir.node("signals").unwrap();
        assert_eq!(signals.output_schema.kind, ArtifactKind::Signals);
        let backtest = ir.node("backtest").unwrap();
        assert_eq!(
            backtest.output_schema.kind,
            ArtifactKind::BacktestResults
        );
    }

    #[test]
    fn test_compile_assigns_input_ports() {
        let ir = compile(CROSSOVER_PIPELINE).unwrap();
        let signals = ir.node("signals").unwrap();
        assert_eq!(signals.input_ports, vec!["fast", "slow"]);
        assert_eq!(signals.depends_on, vec!["fast_ma", "slow_ma"]);
    }

    #[test]
    fn test_compile_validation_failure_returns_report() {
        let err = compile(r#"[{"id": "t", "type": "TRAINN"}]"#).unwrap_err();
        match err {
            Error::Validation(report) => {
                assert!(report.has_code(ErrorCode::UnknownNodeType));
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_compile_never_partially_emits_on_cycle() {
        let err = compile(
            r#"[
                {"id": "a", "type": "IndicatorNode", "depends_on": ["b"],
                 "params": {"indicator": "SMA", "period": 5}},
                {"id": "b", "type": "IndicatorNode", "depends_on": ["a"],
                 "params": {"indicator": "SMA", "period": 5}}
            ]"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_content_hash_deterministic() {
        let first = compile(CROSSOVER_PIPELINE).unwrap();
        let second = compile(CROSSOVER_PIPELINE).unwrap();
        assert_eq!(first.metadata.content_hash, second.metadata.content_hash);
    }

    #[test]
    fn test_content_hash_sensitive_to_source() {
        let first = compile(CROSSOVER_PIPELINE).unwrap();
        let changed = CROSSOVER_PIPELINE.replace("\"period\": 10", "\"period\": 11");
        let second = compile(&changed).unwrap();
        assert_ne!(first.metadata.content_hash, second.metadata.content_hash);
    }

    #[test]
    fn test_topological_tiebreak_is_source_order() {
        // Independent loaders must execute in declaration order
        let source = r#"[
            {"id": "z_loader", "type": "DataLoaderNode",
             "params": {"symbol": "Z", "timeframe": "1d", "dataset": "z.csv"}},
            {"id": "a_loader", "type": "DataLoaderNode",
             "params": {"symbol": "A", "timeframe": "1d", "dataset": "a.csv"}}
        ]"#;
        let ir = compile(source).unwrap();
        assert_eq!(ir.execution_order(), vec!["z_loader", "a_loader"]);
    }

    #[test]
    fn test_diamond_order_respects_dependencies() {
        let source = r#"[
            {"id": "bt", "type": "BacktestNode", "depends_on": ["sig", "loader"],
             "params": {"initial_capital": 1000.0}},
            {"id": "sig", "type": "CrossoverSignalNode", "depends_on": ["fast", "slow"]},
            {"id": "slow", "type": "IndicatorNode", "depends_on": ["loader"],
             "params": {"indicator": "EMA", "period": 20}},
            {"id": "fast", "type": "IndicatorNode", "depends_on": ["loader"],
             "params": {"indicator": "EMA", "period": 5}},
            {"id": "loader", "type": "DataLoaderNode",
             "params": {"symbol": "S", "timeframe": "1h", "dataset": "s.csv"}}
        ]"#;
        let ir = compile(source).unwrap();
        let order = ir.execution_order();
        let position = |id: &str| order.iter().position(|&n| n == id).unwrap();
        assert!(position("loader") < position("fast"));
        assert!(position("loader") < position("slow"));
        // Tie between slow (index 2) and fast (index 3) breaks by source order
        assert!(position("slow") < position("fast"));
        assert!(position("fast") < position("sig"));
        assert!(position("sig") < position("bt"));
    }

    #[test]
    fn test_ir_roundtrip_preserves_hash() {
        let ir = compile(CROSSOVER_PIPELINE).unwrap();
        let json = serde_json::to_string(&ir).unwrap();
        let parsed: PipelineIr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ir);
        let rehashed = content_hash(&parsed.nodes).unwrap();
        assert_eq!(rehashed, ir.metadata.content_hash);
    }

    #[test]
    fn test_write_canonical_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "y": [1, "x"]}});
        let mut out = String::new();
        write_canonical(&value, &mut out);
        assert_eq!(out, r#"{"a":{"y":[1,"x"],"z":true},"b":1}"#);
    }
}
