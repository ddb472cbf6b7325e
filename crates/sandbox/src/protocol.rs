//! Wire protocol between the host and the container harness
//!
//! Per invocation the host writes `input.json` into the shared working
//! directory; the harness writes `output.json` and a line-delimited log file
//! before exiting. Payload kinds stay stringly typed on the wire; the engine
//! typechecks them against the node's declared output schema after exit.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// Input descriptor filename inside the working directory.
pub const INPUT_FILE: &str = "input.json";

/// Output descriptor filename inside the working directory.
pub const OUTPUT_FILE: &str = "output.json";

/// Structured log filename inside the working directory.
pub const LOG_FILE: &str = "node.log";

/// Inputs serialized above this size are written as files instead of inlined.
pub const INLINE_THRESHOLD_BYTES: usize = 1024 * 1024;

/// Reference to an artifact file inside the container mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    /// Path as seen from inside the container (under `/workspace`)
    pub path: String,
}

/// One input port payload: a file reference for large artifacts, inline JSON
/// for small ones.
///
/// The `{"path": ...}` object shape is reserved for file references; inline
/// payloads that are objects must not consist of a single `path` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortPayload {
    /// Artifact stored as a file inside the working directory
    File(FileRef),
    /// Artifact inlined into the descriptor
    Inline(Value),
}

impl PortPayload {
    /// True if the payload is a file reference.
    pub fn is_file(&self) -> bool {
        matches!(self, PortPayload::File(_))
    }
}

/// Execution context shipped to the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// Run this invocation belongs to
    #[serde(rename = "runId")]
    pub run_id: String,
    /// Pipeline the run was compiled from
    #[serde(rename = "pipelineId")]
    pub pipeline_id: String,
    /// Dataset name → container-side path (under `/datasets`)
    #[serde(default)]
    pub datasets: BTreeMap<String, String>,
}

/// The full `input.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    /// Node type name
    #[serde(rename = "nodeType")]
    pub node_type: String,
    /// Resolved parameters (defaults applied)
    pub params: Map<String, Value>,
    /// Input ports keyed by port name, in the node's declared order
    pub inputs: BTreeMap<String, PortPayload>,
    /// Execution context
    pub context: InvocationContext,
}

/// One structured log line, as the harness writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLogEntry {
    /// Strictly increasing offset within the invocation
    pub offset: u64,
    /// Wall-clock timestamp of the entry
    pub ts: DateTime<Utc>,
    /// Level as a lowercase string (`trace`..`error`); unknown levels are
    /// treated as `info` by the engine
    pub level: String,
    /// Message text
    pub message: String,
}

/// The full `output.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// Artifact kind tag: `dataframe`, `signals`, `backtest_results`, `opaque`
    #[serde(rename = "type")]
    pub kind: String,
    /// Artifact payload
    pub data: Value,
    /// Free-form artifact metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Structured log entries emitted inline
    #[serde(default)]
    pub logs: Vec<WireLogEntry>,
}

/// Write the input descriptor into a working directory.
pub fn write_input_descriptor(workdir: &Path, input: &InputDescriptor) -> Result<()> {
    let body = serde_json::to_vec_pretty(input)?;
    std::fs::write(workdir.join(INPUT_FILE), body)?;
    Ok(())
}

/// Read the output descriptor from a working directory.
///
/// Returns `Ok(None)` when the file does not exist; a present but malformed
/// file is reported as the underlying parse error so the caller can classify
/// it as a protocol violation.
pub fn read_output_descriptor(workdir: &Path) -> Result<Option<OutputDescriptor>> {
    let path = workdir.join(OUTPUT_FILE);
    let body = match std::fs::read(&path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let descriptor = serde_json::from_slice(&body)?;
    Ok(Some(descriptor))
}

/// Read the line-delimited structured log file from a working directory.
///
/// Unparsable lines are skipped rather than failing the whole invocation;
/// the harness owns the file format and stderr is captured separately.
pub fn read_log_file(workdir: &Path) -> Vec<WireLogEntry> {
    let path = workdir.join(LOG_FILE);
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(_) => return Vec::new(),
    };
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_input() -> InputDescriptor {
        let mut params = Map::new();
        params.insert("period".to_string(), Value::from(14));
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "prices".to_string(),
            PortPayload::File(FileRef {
                path: "/workspace/inputs/prices.json".to_string(),
            }),
        );
        inputs.insert(
            "config".to_string(),
            PortPayload::Inline(serde_json::json!({"threshold": 0.5})),
        );
        InputDescriptor {
            node_type: "MomentumNode".to_string(),
            params,
            inputs,
            context: InvocationContext {
                run_id: "run-1".to_string(),
                pipeline_id: "pipe-1".to_string(),
                datasets: BTreeMap::from([(
                    "sample_ohlcv".to_string(),
                    "/datasets/sample_ohlcv.csv".to_string(),
                )]),
            },
        }
    }

    #[test]
    fn test_input_descriptor_roundtrip() {
        let input = sample_input();
        let json = serde_json::to_string(&input).unwrap();
        let parsed: InputDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, input);
    }

    #[test]
    fn test_input_descriptor_field_names() {
        let json = serde_json::to_value(sample_input()).unwrap();
        assert!(json.get("nodeType").is_some());
        assert!(json["context"].get("runId").is_some());
        assert!(json["context"].get("pipelineId").is_some());
    }

    #[test]
    fn test_port_payload_file_shape() {
        let payload: PortPayload =
            serde_json::from_str(r#"{"path": "/workspace/inputs/a.json"}"#).unwrap();
        assert!(payload.is_file());
    }

    #[test]
    fn test_port_payload_inline_scalar() {
        let payload: PortPayload = serde_json::from_str("42").unwrap();
        assert_eq!(payload, PortPayload::Inline(Value::from(42)));
    }

    #[test]
    fn test_port_payload_inline_object() {
        let payload: PortPayload = serde_json::from_str(r#"{"rows": [1, 2]}"#).unwrap();
        assert!(!payload.is_file());
    }

    #[test]
    fn test_output_descriptor_kind_tag() {
        let json = r#"{"type": "backtest_results", "data": {"metrics": {}}}"#;
        let output: OutputDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(output.kind, "backtest_results");
        assert!(output.logs.is_empty());
        assert!(output.metadata.is_none());
    }

    #[test]
    fn test_write_and_read_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        write_input_descriptor(dir.path(), &sample_input()).unwrap();
        assert!(dir.path().join(INPUT_FILE).exists());

        let output = OutputDescriptor {
            kind: "opaque".to_string(),
            data: serde_json::json!({"answer": 42}),
            metadata: None,
            logs: vec![WireLogEntry {
                offset: 0,
                ts: Utc::now(),
                level: "info".to_string(),
                message: "done".to_string(),
            }],
        };
        std::fs::write(
            dir.path().join(OUTPUT_FILE),
            serde_json::to_vec(&output).unwrap(),
        )
        .unwrap();

        let read_back = read_output_descriptor(dir.path()).unwrap().unwrap();
        assert_eq!(read_back.kind, "opaque");
        assert_eq!(read_back.logs.len(), 1);
    }

    #[test]
    fn test_read_output_descriptor_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_output_descriptor(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_read_output_descriptor_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(OUTPUT_FILE), b"{not json").unwrap();
        assert!(read_output_descriptor(dir.path()).is_err());
    }

    #[test]
    fn test_read_log_file_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::json!({
            "offset": 0, "ts": "2024-01-01T00:00:00Z", "level": "info", "message": "hello"
        });
        let body = format!("{good}\nnot json\n\n");
        std::fs::write(dir.path().join(LOG_FILE), body).unwrap();
        let entries = read_log_file(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "hello");
    }

    #[test]
    fn test_read_log_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_log_file(dir.path()).is_empty());
    }

    #[test]
    fn test_inline_threshold_is_one_mib() {
        assert_eq!(INLINE_THRESHOLD_BYTES, 1_048_576);
    }
}
