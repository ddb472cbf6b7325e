//! Node catalog: builtin definitions plus the custom-node registry
//!
//! The catalog is the single lookup surface validation and compilation work
//! against: given a type name it yields the runtime kind, parameter schema,
//! dependency arity, input contracts, and output-schema function. The builtin
//! set is fixed at process start; custom nodes are discovered from a
//! filesystem root and can be rediscovered explicitly. Builtin names shadow
//! custom nodes of the same name.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use edgeql_sandbox::NodeRuntime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dataframe::{OHLCV_COLUMNS, SIGNAL_COLUMN, TIMESTAMP_COLUMN};
use crate::error::ErrorCode;
use crate::indicators::Indicator;
use crate::manifest::{discover_nodes, DiscoveredNode, DiscoveryIssue, ManifestMetadata};
use crate::schema::{DataSchema, DependencyArity, ParamKind, ParamSchema, PortContract};

/// Runtime kind of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Runs in-process
    Builtin,
    /// Custom JavaScript node in a sandboxed container
    CustomJs,
    /// Custom Python node in a sandboxed container
    CustomPython,
    /// Custom WebAssembly node in a sandboxed container
    CustomWasm,
}

impl RuntimeKind {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Builtin => "builtin",
            RuntimeKind::CustomJs => "custom-js",
            RuntimeKind::CustomPython => "custom-python",
            RuntimeKind::CustomWasm => "custom-wasm",
        }
    }

    /// True for sandboxed kinds.
    pub fn is_custom(&self) -> bool {
        !matches!(self, RuntimeKind::Builtin)
    }

    /// The sandbox runtime for custom kinds.
    pub fn sandbox_runtime(&self) -> Option<NodeRuntime> {
        match self {
            RuntimeKind::Builtin => None,
            RuntimeKind::CustomJs => Some(NodeRuntime::Javascript),
            RuntimeKind::CustomPython => Some(NodeRuntime::Python),
            RuntimeKind::CustomWasm => Some(NodeRuntime::Wasm),
        }
    }
}

impl From<NodeRuntime> for RuntimeKind {
    fn from(runtime: NodeRuntime) -> Self {
        match runtime {
            NodeRuntime::Javascript => RuntimeKind::CustomJs,
            NodeRuntime::Python => RuntimeKind::CustomPython,
            NodeRuntime::Wasm => RuntimeKind::CustomWasm,
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The fixed builtin node set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinType {
    /// Loads OHLCV data from a named dataset
    DataLoader,
    /// Computes a windowed indicator column
    Indicator,
    /// Emits crossover signals from two indicator frames
    CrossoverSignal,
    /// Simulates trading over prices and signals
    Backtest,
    /// Appends derived feature columns
    FeatureGenerator,
    /// Appends forward-return labels
    Labeling,
}

impl BuiltinType {
    /// All builtin types.
    pub fn all() -> [BuiltinType; 6] {
        [
            BuiltinType::DataLoader,
            BuiltinType::Indicator,
            BuiltinType::CrossoverSignal,
            BuiltinType::Backtest,
            BuiltinType::FeatureGenerator,
            BuiltinType::Labeling,
        ]
    }

    /// Type name used in pipeline declarations.
    pub fn type_name(&self) -> &'static str {
        match self {
            BuiltinType::DataLoader => "DataLoaderNode",
            BuiltinType::Indicator => "IndicatorNode",
            BuiltinType::CrossoverSignal => "CrossoverSignalNode",
            BuiltinType::Backtest => "BacktestNode",
            BuiltinType::FeatureGenerator => "FeatureGeneratorNode",
            BuiltinType::Labeling => "LabelingNode",
        }
    }

    /// Reverse lookup by type name.
    pub fn from_type_name(name: &str) -> Option<BuiltinType> {
        BuiltinType::all()
            .into_iter()
            .find(|b| b.type_name() == name)
    }

    fn param_schema(&self) -> ParamSchema {
        match self {
            BuiltinType::DataLoader => ParamSchema::new()
                .required("symbol", ParamKind::String { allowed: None })
                .required(
                    "timeframe",
                    ParamKind::String {
                        allowed: Some(
                            ["1m", "5m", "15m", "30m", "1h", "4h", "1d", "1w"]
                                .into_iter()
                                .map(str::to_string)
                                .collect(),
                        ),
                    },
                )
                .required("dataset", ParamKind::String { allowed: None })
                .optional("start_date", ParamKind::Date)
                .optional("end_date", ParamKind::Date),
            BuiltinType::Indicator => ParamSchema::new()
                .required(
                    "indicator",
                    ParamKind::String {
                        allowed: Some(
                            Indicator::all()
                                .into_iter()
                                .map(|i| i.as_str().to_string())
                                .collect(),
                        ),
                    },
                )
                .required(
                    "period",
                    ParamKind::Integer {
                        min: Some(1),
                        max: Some(500),
                    },
                )
                .optional_with_default(
                    "column",
                    ParamKind::String { allowed: None },
                    Value::from("close"),
                )
                .optional(
                    "signal_period",
                    ParamKind::Integer {
                        min: Some(1),
                        max: Some(500),
                    },
                )
                .optional_with_default(
                    "fast_period",
                    ParamKind::Integer {
                        min: Some(1),
                        max: Some(500),
                    },
                    Value::from(12),
                )
                .optional_with_default(
                    "slow_period",
                    ParamKind::Integer {
                        min: Some(1),
                        max: Some(500),
                    },
                    Value::from(26),
                )
                .optional_with_default(
                    "std_dev",
                    ParamKind::Number {
                        min: Some(0.1),
                        max: Some(10.0),
                        exclusive_min: false,
                    },
                    Value::from(2.0),
                )
                .optional_with_default(
                    "d_period",
                    ParamKind::Integer {
                        min: Some(1),
                        max: Some(500),
                    },
                    Value::from(3),
                ),
            BuiltinType::CrossoverSignal => ParamSchema::new()
                .optional("fast_column", ParamKind::String { allowed: None })
                .optional("slow_column", ParamKind::String { allowed: None })
                .optional_with_default(
                    "threshold",
                    ParamKind::Number {
                        min: Some(0.0),
                        max: None,
                        exclusive_min: false,
                    },
                    Value::from(0.0),
                )
                .optional_with_default(
                    "confirmation_periods",
                    ParamKind::Integer {
                        min: Some(1),
                        max: Some(100),
                    },
                    Value::from(1),
                ),
            BuiltinType::Backtest => ParamSchema::new()
                .required(
                    "initial_capital",
                    ParamKind::Number {
                        min: Some(0.0),
                        max: None,
                        exclusive_min: true,
                    },
                )
                .optional_with_default(
                    "commission",
                    ParamKind::Number {
                        min: Some(0.0),
                        max: Some(0.1),
                        exclusive_min: false,
                    },
                    Value::from(0.001),
                )
                .optional_with_default(
                    "slippage",
                    ParamKind::Number {
                        min: Some(0.0),
                        max: Some(0.1),
                        exclusive_min: false,
                    },
                    Value::from(0.0),
                )
                .optional_with_default(
                    "position_size",
                    ParamKind::Number {
                        min: Some(0.0),
                        max: Some(1.0),
                        exclusive_min: true,
                    },
                    Value::from(1.0),
                ),
            BuiltinType::FeatureGenerator => ParamSchema::new()
                .optional_with_default(
                    "features",
                    ParamKind::Array,
                    serde_json::json!(["returns"]),
                )
                .optional_with_default(
                    "window",
                    ParamKind::Integer {
                        min: Some(2),
                        max: Some(500),
                    },
                    Value::from(20),
                ),
            BuiltinType::Labeling => ParamSchema::new()
                .required(
                    "horizon",
                    ParamKind::Integer {
                        min: Some(1),
                        max: Some(500),
                    },
                )
                .optional_with_default(
                    "threshold",
                    ParamKind::Number {
                        min: Some(0.0),
                        max: None,
                        exclusive_min: false,
                    },
                    Value::from(0.0),
                ),
        }
    }

    fn dependency_arity(&self) -> DependencyArity {
        match self {
            BuiltinType::DataLoader => DependencyArity::Exactly(0),
            BuiltinType::Indicator => DependencyArity::Exactly(1),
            BuiltinType::CrossoverSignal => DependencyArity::AtLeast(2),
            BuiltinType::Backtest => DependencyArity::Between(1, 2),
            BuiltinType::FeatureGenerator => DependencyArity::Exactly(1),
            BuiltinType::Labeling => DependencyArity::Exactly(1),
        }
    }
}

/// A resolved node type from the catalog.
#[derive(Debug, Clone)]
pub enum NodeType {
    /// One of the fixed builtins
    Builtin(BuiltinType),
    /// A discovered custom node
    Custom(Arc<DiscoveredNode>),
}

impl NodeType {
    /// Declared type name.
    pub fn type_name(&self) -> &str {
        match self {
            NodeType::Builtin(builtin) => builtin.type_name(),
            NodeType::Custom(node) => &node.manifest.id,
        }
    }

    /// Runtime kind of this node type.
    pub fn runtime(&self) -> RuntimeKind {
        match self {
            NodeType::Builtin(_) => RuntimeKind::Builtin,
            NodeType::Custom(node) => node.manifest.runtime.into(),
        }
    }

    /// Parameter schema.
    pub fn param_schema(&self) -> ParamSchema {
        match self {
            NodeType::Builtin(builtin) => builtin.param_schema(),
            NodeType::Custom(node) => node.manifest.to_param_schema(),
        }
    }

    /// Dependency arity rule.
    pub fn dependency_arity(&self) -> DependencyArity {
        match self {
            NodeType::Builtin(builtin) => builtin.dependency_arity(),
            NodeType::Custom(node) => DependencyArity::Exactly(node.manifest.input_schema.len()),
        }
    }

    /// Entry-point file for custom nodes.
    pub fn entry_point(&self) -> Option<&Path> {
        match self {
            NodeType::Builtin(_) => None,
            NodeType::Custom(node) => Some(&node.entry_point),
        }
    }

    /// Source directory for custom nodes.
    pub fn node_root(&self) -> Option<&Path> {
        match self {
            NodeType::Builtin(_) => None,
            NodeType::Custom(node) => Some(&node.root),
        }
    }

    /// Manifest metadata (resource overrides) for custom nodes.
    pub fn manifest_metadata(&self) -> Option<&ManifestMetadata> {
        match self {
            NodeType::Builtin(_) => None,
            NodeType::Custom(node) => node.manifest.metadata.as_ref(),
        }
    }

    /// Input-port contracts for a node with the given parameters and
    /// dependency count.
    ///
    /// The backtest node's two modes are resolved by dependency count: one
    /// combined price+signal input, or a signals port and a prices port
    /// (matched order-insensitively by the validator).
    pub fn input_contracts(&self, params: &Map<String, Value>, dep_count: usize) -> Vec<PortContract> {
        match self {
            NodeType::Builtin(BuiltinType::DataLoader) => Vec::new(),
            NodeType::Builtin(BuiltinType::Indicator) => {
                let mut required = vec![TIMESTAMP_COLUMN.to_string()];
                match indicator_from_params(params) {
                    Some(indicator) if indicator.needs_high_low() => {
                        required.extend(["high".to_string(), "low".to_string(), "close".to_string()]);
                    }
                    _ => required.push(
                        param_str(params, "column").unwrap_or("close").to_string(),
                    ),
                }
                vec![PortContract::tabular("input", required)]
            }
            NodeType::Builtin(BuiltinType::CrossoverSignal) => {
                let mut contracts = Vec::with_capacity(dep_count.max(2));
                let mut fast = vec![TIMESTAMP_COLUMN.to_string()];
                if let Some(column) = param_str(params, "fast_column") {
                    fast.push(column.to_string());
                }
                let mut slow = vec![TIMESTAMP_COLUMN.to_string()];
                if let Some(column) = param_str(params, "slow_column") {
                    slow.push(column.to_string());
                }
                contracts.push(PortContract::tabular("fast", fast));
                contracts.push(PortContract::tabular("slow", slow));
                for extra in 2..dep_count {
                    contracts.push(PortContract::tabular(
                        format!("input{extra}"),
                        [TIMESTAMP_COLUMN],
                    ));
                }
                contracts
            }
            NodeType::Builtin(BuiltinType::Backtest) => {
                if dep_count == 1 {
                    let mut required: Vec<String> =
                        OHLCV_COLUMNS[..5].iter().map(|c| c.to_string()).collect();
                    required.push(SIGNAL_COLUMN.to_string());
                    vec![PortContract::tabular("input", required)]
                } else {
                    vec![
                        PortContract::tabular("signals", [TIMESTAMP_COLUMN, SIGNAL_COLUMN]),
                        PortContract::tabular("prices", OHLCV_COLUMNS[..5].to_vec()),
                    ]
                }
            }
            NodeType::Builtin(BuiltinType::FeatureGenerator) => {
                let mut required = vec![TIMESTAMP_COLUMN.to_string(), "close".to_string()];
                if features_from_params(params)
                    .iter()
                    .any(|f| f == "hl_range")
                {
                    required.extend(["high".to_string(), "low".to_string()]);
                }
                vec![PortContract::tabular("input", required)]
            }
            NodeType::Builtin(BuiltinType::Labeling) => {
                vec![PortContract::tabular("input", [TIMESTAMP_COLUMN, "close"])]
            }
            NodeType::Custom(node) => node
                .manifest
                .input_schema
                .iter()
                .map(|port| PortContract {
                    name: port.name.clone(),
                    accepts: port.accepts.clone(),
                    required_columns: port.required_columns.clone(),
                })
                .collect(),
        }
    }

    /// Port names for the given dependency count, padding with `input{i}`
    /// when a node takes more dependencies than it declares ports.
    pub fn input_port_names(&self, params: &Map<String, Value>, dep_count: usize) -> Vec<String> {
        let contracts = self.input_contracts(params, dep_count);
        (0..dep_count)
            .map(|i| {
                contracts
                    .get(i)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| format!("input{i}"))
            })
            .collect()
    }

    /// Resolved output schema for the given parameters and input schemas.
    pub fn output_schema(
        &self,
        params: &Map<String, Value>,
        inputs: &[&DataSchema],
    ) -> Result<DataSchema, String> {
        match self {
            NodeType::Builtin(BuiltinType::DataLoader) => {
                Ok(DataSchema::dataframe(OHLCV_COLUMNS))
            }
            NodeType::Builtin(BuiltinType::Indicator) => {
                let indicator = indicator_from_params(params)
                    .ok_or_else(|| "indicator parameter is missing or invalid".to_string())?;
                let period = param_i64(params, "period")
                    .ok_or_else(|| "period parameter is missing or invalid".to_string())?;
                let input = inputs
                    .first()
                    .ok_or_else(|| "indicator node has no input schema".to_string())?;
                let mut columns = input.columns.clone();
                for column in indicator.output_columns(period) {
                    if !columns.contains(&column) {
                        columns.push(column);
                    }
                }
                Ok(DataSchema::dataframe(columns))
            }
            NodeType::Builtin(BuiltinType::CrossoverSignal) => {
                Ok(DataSchema::signals([TIMESTAMP_COLUMN, SIGNAL_COLUMN]))
            }
            NodeType::Builtin(BuiltinType::Backtest) => Ok(DataSchema::backtest_results()),
            NodeType::Builtin(BuiltinType::FeatureGenerator) => {
                let input = inputs
                    .first()
                    .ok_or_else(|| "feature generator has no input schema".to_string())?;
                let window = param_i64(params, "window").unwrap_or(20);
                let mut columns = input.columns.clone();
                for feature in features_from_params(params) {
                    let column = match feature.as_str() {
                        "volatility" => format!("volatility_{window}"),
                        other => other.to_string(),
                    };
                    if !columns.contains(&column) {
                        columns.push(column);
                    }
                }
                Ok(DataSchema::dataframe(columns))
            }
            NodeType::Builtin(BuiltinType::Labeling) => {
                let input = inputs
                    .first()
                    .ok_or_else(|| "labeling node has no input schema".to_string())?;
                let mut columns = input.columns.clone();
                if !columns.contains(&"label".to_string()) {
                    columns.push("label".to_string());
                }
                Ok(DataSchema::dataframe(columns))
            }
            NodeType::Custom(node) => Ok(DataSchema {
                kind: node.manifest.output_schema.kind,
                columns: node.manifest.output_schema.columns.clone(),
            }),
        }
    }

    /// Cross-field parameter rules: `(code, field, message)` per violation.
    pub fn cross_field_issues(
        &self,
        params: &Map<String, Value>,
    ) -> Vec<(ErrorCode, Option<String>, String)> {
        let mut issues = Vec::new();
        match self {
            NodeType::Builtin(BuiltinType::DataLoader) => {
                if let (Some(start), Some(end)) = (
                    param_str(params, "start_date"),
                    param_str(params, "end_date"),
                ) {
                    if start >= end {
                        issues.push((
                            ErrorCode::InvalidParameterValue,
                            Some("start_date".to_string()),
                            format!("start_date '{start}' must be before end_date '{end}'"),
                        ));
                    }
                }
                if let Some(dataset) = param_str(params, "dataset") {
                    let extension = Path::new(dataset)
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("");
                    if !matches!(extension, "csv" | "parquet" | "json") {
                        issues.push((
                            ErrorCode::InvalidParameterValue,
                            Some("dataset".to_string()),
                            format!(
                                "dataset '{dataset}' must have a csv, parquet, or json extension"
                            ),
                        ));
                    }
                }
            }
            NodeType::Builtin(BuiltinType::Indicator) => {
                let indicator = indicator_from_params(params);
                if indicator == Some(Indicator::Macd)
                    && param_i64(params, "signal_period").is_none()
                {
                    issues.push((
                        ErrorCode::MissingRequiredParameter,
                        Some("signal_period".to_string()),
                        "MACD requires a signal_period parameter".to_string(),
                    ));
                }
                if let (Some(fast), Some(slow)) = (
                    param_i64(params, "fast_period"),
                    param_i64(params, "slow_period"),
                ) {
                    if fast >= slow {
                        issues.push((
                            ErrorCode::ParameterOutOfRange,
                            Some("fast_period".to_string()),
                            format!("fast_period {fast} must be less than slow_period {slow}"),
                        ));
                    }
                }
            }
            _ => {}
        }
        issues
    }
}

/// String-valued parameter accessor.
pub fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Integer-valued parameter accessor.
pub fn param_i64(params: &Map<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

/// Float-valued parameter accessor (integers cast).
pub fn param_f64(params: &Map<String, Value>, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

/// Parse the `indicator` parameter.
pub fn indicator_from_params(params: &Map<String, Value>) -> Option<Indicator> {
    param_str(params, "indicator")?.parse().ok()
}

/// The `features` array parameter as strings.
pub fn features_from_params(params: &Map<String, Value>) -> Vec<String> {
    params
        .get("features")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| vec!["returns".to_string()])
}

/// Discovery summary from a catalog rescan.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Number of custom nodes registered
    pub registered: usize,
    /// Directories skipped, with reasons
    pub issues: Vec<DiscoveryIssue>,
}

/// The unified node-type registry.
pub struct NodeCatalog {
    custom_root: Option<PathBuf>,
    custom: RwLock<HashMap<String, Arc<DiscoveredNode>>>,
}

impl Default for NodeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCatalog {
    /// Catalog with builtins only.
    pub fn new() -> Self {
        Self {
            custom_root: None,
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Catalog with a custom-node root, discovered immediately.
    pub fn with_custom_root(root: impl Into<PathBuf>) -> (Self, DiscoveryReport) {
        let catalog = Self {
            custom_root: Some(root.into()),
            custom: RwLock::new(HashMap::new()),
        };
        let report = catalog.discover();
        (catalog, report)
    }

    /// Rescan the custom-node root, replacing the custom registry.
    pub fn discover(&self) -> DiscoveryReport {
        let Some(root) = &self.custom_root else {
            return DiscoveryReport::default();
        };
        let (nodes, mut issues) = discover_nodes(root);
        let mut registry = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let id = node.manifest.id.clone();
            if BuiltinType::from_type_name(&id).is_some() {
                warn!(node = %id, "custom node shadows a builtin type and is ignored");
                issues.push(DiscoveryIssue {
                    dir: node.root.clone(),
                    message: format!("'{id}' collides with a builtin type name"),
                });
                continue;
            }
            if registry.insert(id.clone(), Arc::new(node)).is_some() {
                issues.push(DiscoveryIssue {
                    dir: root.clone(),
                    message: format!("duplicate custom node id '{id}'"),
                });
            }
        }
        let registered = registry.len();
        *self.custom.write().unwrap_or_else(|e| e.into_inner()) = registry;
        debug!(registered, issues = issues.len(), "custom node discovery finished");
        DiscoveryReport { registered, issues }
    }

    /// Resolve a type name; builtins take priority over custom nodes.
    pub fn lookup(&self, type_name: &str) -> Option<NodeType> {
        if let Some(builtin) = BuiltinType::from_type_name(type_name) {
            return Some(NodeType::Builtin(builtin));
        }
        self.custom
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(type_name)
            .cloned()
            .map(NodeType::Custom)
    }

    /// Every known type name, builtins first, each group sorted.
    pub fn known_type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = BuiltinType::all()
            .into_iter()
            .map(|b| b.type_name().to_string())
            .collect();
        names.sort();
        let mut custom: Vec<String> = self
            .custom
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        custom.sort();
        names.extend(custom);
        names
    }

    /// Snapshot of all registered custom nodes.
    pub fn custom_nodes(&self) -> Vec<Arc<DiscoveredNode>> {
        let mut nodes: Vec<Arc<DiscoveredNode>> = self
            .custom
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        nodes
    }
}
