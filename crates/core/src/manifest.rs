//! Custom-node manifests and filesystem discovery
//!
//! A custom node is a directory carrying either a `node.json` manifest or a
//! `package.json` with an `edgeql.nodeDefinition` block. Discovery walks the
//! custom-node root one level deep, parses manifests, and refuses any entry
//! whose entry-point file does not exist.

use std::path::{Path, PathBuf};

use edgeql_sandbox::NodeRuntime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::{ArtifactKind, ParamField, ParamKind, ParamSchema};

/// Dedicated manifest filename.
pub const NODE_MANIFEST_FILE: &str = "node.json";

/// Package descriptor filename carrying an embedded manifest.
pub const PACKAGE_MANIFEST_FILE: &str = "package.json";

/// Top-level package key the embedded manifest lives under.
pub const PACKAGE_MANIFEST_KEY: &str = "edgeql";

/// Key of the embedded manifest block inside [`PACKAGE_MANIFEST_KEY`].
pub const PACKAGE_DEFINITION_KEY: &str = "nodeDefinition";

/// One declared input port of a custom node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPort {
    /// Port name
    pub name: String,
    /// Artifact kinds accepted; defaults to tabular inputs
    #[serde(default = "default_port_accepts")]
    pub accepts: Vec<ArtifactKind>,
    /// Columns required on tabular inputs
    #[serde(default)]
    pub required_columns: Vec<String>,
}

fn default_port_accepts() -> Vec<ArtifactKind> {
    vec![ArtifactKind::Dataframe, ArtifactKind::Signals]
}

/// Declared output of a custom node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestOutput {
    /// Artifact kind the node produces
    pub kind: ArtifactKind,
    /// Declared columns for tabular kinds
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Optional manifest metadata: category plus resource overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    /// Free-form category label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Wall-clock override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Memory cap override in MiB
    #[serde(default, rename = "memoryMiB", skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u64>,
    /// CPU cap override in fractional cores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
}

/// A custom-node manifest, as found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeManifest {
    /// Type name used in pipeline declarations
    pub id: String,
    /// Display name
    pub name: String,
    /// Language family
    pub runtime: NodeRuntime,
    /// Entry-point file, relative to the manifest directory
    pub entry_point: String,
    /// Declared input ports
    #[serde(default)]
    pub input_schema: Vec<ManifestPort>,
    /// Declared output
    pub output_schema: ManifestOutput,
    /// Names of required parameters
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Names of optional parameters
    #[serde(default)]
    pub optional_params: Vec<String>,
    /// Per-field parameter constraints keyed by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_schema: Option<Map<String, Value>>,
    /// Category and resource overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ManifestMetadata>,
}

impl NodeManifest {
    /// Build the typed parameter schema from the declared names and the
    /// optional per-field constraint map.
    ///
    /// Fields absent from `paramSchema` accept any JSON value of any shape,
    /// so they are typed as loosely as the manifest allows.
    pub fn to_param_schema(&self) -> ParamSchema {
        let mut schema = ParamSchema::new();
        for name in &self.required_params {
            schema.fields.push(ParamField {
                name: name.clone(),
                kind: self.field_kind(name),
                required: true,
                default: self.field_default(name),
            });
        }
        for name in &self.optional_params {
            if self.required_params.contains(name) {
                continue;
            }
            schema.fields.push(ParamField {
                name: name.clone(),
                kind: self.field_kind(name),
                required: false,
                default: self.field_default(name),
            });
        }
        schema
    }

    fn field_spec(&self, name: &str) -> Option<&Map<String, Value>> {
        self.param_schema.as_ref()?.get(name)?.as_object()
    }

    fn field_default(&self, name: &str) -> Option<Value> {
        self.field_spec(name)?.get("default").cloned()
    }

    fn field_kind(&self, name: &str) -> ParamKind {
        let Some(spec) = self.field_spec(name) else {
            return ParamKind::Any;
        };
        let kind = spec.get("type").and_then(Value::as_str).unwrap_or("string");
        match kind {
            "number" => ParamKind::Number {
                min: spec.get("min").and_then(Value::as_f64),
                max: spec.get("max").and_then(Value::as_f64),
                exclusive_min: spec
                    .get("exclusiveMin")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "integer" => ParamKind::Integer {
                min: spec.get("min").and_then(Value::as_i64),
                max: spec.get("max").and_then(Value::as_i64),
            },
            "boolean" => ParamKind::Boolean,
            "date" => ParamKind::Date,
            "array" => ParamKind::Array,
            "object" => ParamKind::Object,
            _ => ParamKind::String {
                allowed: spec.get("enum").and_then(|v| {
                    v.as_array().map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                }),
            },
        }
    }
}

/// A manifest bound to its directory and verified entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredNode {
    /// Parsed manifest
    pub manifest: NodeManifest,
    /// Directory the manifest was found in
    pub root: PathBuf,
    /// Absolute entry-point path (verified to exist)
    pub entry_point: PathBuf,
}

/// Why a directory was skipped during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryIssue {
    /// Directory that failed registration
    pub dir: PathBuf,
    /// What went wrong
    pub message: String,
}

/// Load the manifest from one directory, trying `node.json` first and the
/// `package.json` embedding second. `Ok(None)` when the directory carries
/// neither.
pub fn load_manifest(dir: &Path) -> Result<Option<NodeManifest>, String> {
    let node_json = dir.join(NODE_MANIFEST_FILE);
    if node_json.is_file() {
        let body = std::fs::read_to_string(&node_json)
            .map_err(|err| format!("{}: {err}", node_json.display()))?;
        let manifest: NodeManifest = serde_json::from_str(&body)
            .map_err(|err| format!("{}: {err}", node_json.display()))?;
        return Ok(Some(manifest));
    }

    let package_json = dir.join(PACKAGE_MANIFEST_FILE);
    if package_json.is_file() {
        let body = std::fs::read_to_string(&package_json)
            .map_err(|err| format!("{}: {err}", package_json.display()))?;
        let package: Value = serde_json::from_str(&body)
            .map_err(|err| format!("{}: {err}", package_json.display()))?;
        if let Some(block) = package
            .get(PACKAGE_MANIFEST_KEY)
            .and_then(|v| v.get(PACKAGE_DEFINITION_KEY))
        {
            let manifest: NodeManifest =
                serde_json::from_value(block.clone()).map_err(|err| {
                    format!(
                        "{}: invalid {PACKAGE_MANIFEST_KEY}.{PACKAGE_DEFINITION_KEY}: {err}",
                        package_json.display()
                    )
                })?;
            return Ok(Some(manifest));
        }
    }
    Ok(None)
}

/// Walk the custom-node root and collect every registrable node.
///
/// Registration refuses manifests whose entry point does not exist; those
/// come back as issues instead of nodes.
pub fn discover_nodes(root: &Path) -> (Vec<DiscoveredNode>, Vec<DiscoveryIssue>) {
    let mut nodes = Vec::new();
    let mut issues = Vec::new();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            issues.push(DiscoveryIssue {
                dir: root.to_path_buf(),
                message: format!("cannot read custom-node root: {err}"),
            });
            return (nodes, issues);
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        match load_manifest(&dir) {
            Ok(Some(manifest)) => {
                let entry_point = dir.join(&manifest.entry_point);
                if !entry_point.is_file() {
                    issues.push(DiscoveryIssue {
                        dir: dir.clone(),
                        message: format!(
                            "entry point '{}' does not exist",
                            manifest.entry_point
                        ),
                    });
                    continue;
                }
                nodes.push(DiscoveredNode {
                    manifest,
                    root: dir,
                    entry_point,
                });
            }
            Ok(None) => {}
            Err(message) => issues.push(DiscoveryIssue { dir, message }),
        }
    }
    (nodes, issues)
}
