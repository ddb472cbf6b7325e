//! Artifact kinds, data schemas, and parameter schemas
//!
//! These types are the currency of validation: the catalog describes every
//! node type with them, the validator checks declarations against them, and
//! the executor checks produced artifacts against the resolved output schema.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// The four artifact kinds that flow along pipeline edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Timestamp-keyed table with named columns
    Dataframe,
    /// Dataframe specialized with a `signal` column
    Signals,
    /// Backtest metrics, trade log, and equity curve
    BacktestResults,
    /// Arbitrary serializable payload from custom nodes
    Opaque,
}

impl ArtifactKind {
    /// Wire tag of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Dataframe => "dataframe",
            ArtifactKind::Signals => "signals",
            ArtifactKind::BacktestResults => "backtest_results",
            ArtifactKind::Opaque => "opaque",
        }
    }

    /// True for the two table-shaped kinds.
    pub fn is_tabular(&self) -> bool {
        matches!(self, ArtifactKind::Dataframe | ArtifactKind::Signals)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataframe" => Ok(ArtifactKind::Dataframe),
            "signals" => Ok(ArtifactKind::Signals),
            "backtest_results" => Ok(ArtifactKind::BacktestResults),
            "opaque" => Ok(ArtifactKind::Opaque),
            _ => Err(format!(
                "unknown artifact kind '{s}', expected one of dataframe, signals, backtest_results, opaque"
            )),
        }
    }
}

/// Kind plus ordered column names; empty columns for non-tabular kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSchema {
    /// Artifact kind produced or accepted
    pub kind: ArtifactKind,
    /// Column names, in order, for tabular kinds
    #[serde(default)]
    pub columns: Vec<String>,
}

impl DataSchema {
    /// Schema of a dataframe with the given columns.
    pub fn dataframe<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: ArtifactKind::Dataframe,
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Schema of a signals frame with the given columns.
    pub fn signals<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: ArtifactKind::Signals,
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Schema of backtest results.
    pub fn backtest_results() -> Self {
        Self {
            kind: ArtifactKind::BacktestResults,
            columns: Vec::new(),
        }
    }

    /// Schema of an opaque artifact.
    pub fn opaque() -> Self {
        Self {
            kind: ArtifactKind::Opaque,
            columns: Vec::new(),
        }
    }

    /// True if the schema carries the named column.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Columns from `required` that this schema is missing.
    pub fn missing_columns<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| !self.has_column(name))
            .map(String::as_str)
            .collect()
    }
}

/// What one input port accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortContract {
    /// Port name, used in the sandbox wire protocol
    pub name: String,
    /// Artifact kinds this port accepts
    pub accepts: Vec<ArtifactKind>,
    /// Columns that must be present on tabular inputs
    #[serde(default)]
    pub required_columns: Vec<String>,
}

impl PortContract {
    /// A port accepting tabular input with required columns.
    pub fn tabular<I, S>(name: impl Into<String>, required_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            accepts: vec![ArtifactKind::Dataframe, ArtifactKind::Signals],
            required_columns: required_columns.into_iter().map(Into::into).collect(),
        }
    }

    /// A port accepting any artifact kind.
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts: vec![
                ArtifactKind::Dataframe,
                ArtifactKind::Signals,
                ArtifactKind::BacktestResults,
                ArtifactKind::Opaque,
            ],
            required_columns: Vec::new(),
        }
    }

    /// Check a producing schema against this port.
    pub fn check(&self, upstream: &DataSchema) -> Result<(), String> {
        if !self.accepts.contains(&upstream.kind) {
            let accepted = self
                .accepts
                .iter()
                .map(ArtifactKind::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(format!(
                "port '{}' accepts [{accepted}] but upstream produces {}",
                self.name, upstream.kind
            ));
        }
        if upstream.kind.is_tabular() {
            let missing = upstream.missing_columns(&self.required_columns);
            if !missing.is_empty() {
                return Err(format!(
                    "port '{}' requires columns [{}] missing from upstream output",
                    self.name,
                    missing.join(", ")
                ));
            }
        }
        Ok(())
    }
}

/// How many dependencies a node type takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyArity {
    /// Exactly `n` upstream nodes
    Exactly(usize),
    /// At least `n` upstream nodes
    AtLeast(usize),
    /// Between `min` and `max` upstream nodes, inclusive
    Between(usize, usize),
}

impl DependencyArity {
    /// Check a dependency count against the rule.
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            DependencyArity::Exactly(n) => count == *n,
            DependencyArity::AtLeast(n) => count >= *n,
            DependencyArity::Between(min, max) => count >= *min && count <= *max,
        }
    }

    /// Human description for error messages.
    pub fn describe(&self) -> String {
        match self {
            DependencyArity::Exactly(0) => "no dependencies".to_string(),
            DependencyArity::Exactly(1) => "exactly 1 dependency".to_string(),
            DependencyArity::Exactly(n) => format!("exactly {n} dependencies"),
            DependencyArity::AtLeast(n) => format!("at least {n} dependencies"),
            DependencyArity::Between(min, max) => {
                format!("between {min} and {max} dependencies")
            }
        }
    }
}

/// Earliest date accepted for date-valued parameters.
pub const MIN_PARAM_DATE: &str = "2000-01-01";

/// The type and constraints of one parameter field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ParamKind {
    /// UTF-8 string, optionally restricted to an allowed set
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed: Option<Vec<String>>,
    },
    /// Floating-point number with optional bounds
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        /// When true the minimum bound is exclusive
        #[serde(default)]
        exclusive_min: bool,
    },
    /// Integer with optional bounds
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    /// Boolean flag
    Boolean,
    /// `YYYY-MM-DD` date within `[2000-01-01, now + 1 year]`
    Date,
    /// JSON array
    Array,
    /// JSON object
    Object,
    /// Any JSON value; used for manifest params without a declared type
    Any,
}

/// A single violated parameter constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamViolation {
    /// Classification of the violation
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

impl ParamViolation {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl ParamKind {
    /// Check a JSON value against this kind.
    pub fn check(&self, value: &Value) -> Result<(), ParamViolation> {
        match self {
            ParamKind::String { allowed } => {
                let text = value.as_str().ok_or_else(|| {
                    ParamViolation::new(ErrorCode::InvalidParameterType, "expected a string")
                })?;
                if let Some(allowed) = allowed {
                    if !allowed.iter().any(|a| a == text) {
                        return Err(ParamViolation::new(
                            ErrorCode::InvalidParameterValue,
                            format!("'{text}' is not one of [{}]", allowed.join(", ")),
                        ));
                    }
                }
                Ok(())
            }
            ParamKind::Number {
                min,
                max,
                exclusive_min,
            } => {
                let number = value.as_f64().ok_or_else(|| {
                    ParamViolation::new(ErrorCode::InvalidParameterType, "expected a number")
                })?;
                if let Some(min) = min {
                    let out = if *exclusive_min {
                        number <= *min
                    } else {
                        number < *min
                    };
                    if out {
                        let bound = if *exclusive_min { "> " } else { ">= " };
                        return Err(ParamViolation::new(
                            ErrorCode::ParameterOutOfRange,
                            format!("{number} must be {bound}{min}"),
                        ));
                    }
                }
                if let Some(max) = max {
                    if number > *max {
                        return Err(ParamViolation::new(
                            ErrorCode::ParameterOutOfRange,
                            format!("{number} must be <= {max}"),
                        ));
                    }
                }
                Ok(())
            }
            ParamKind::Integer { min, max } => {
                let number = value.as_i64().ok_or_else(|| {
                    ParamViolation::new(ErrorCode::InvalidParameterType, "expected an integer")
                })?;
                if let Some(min) = min {
                    if number < *min {
                        return Err(ParamViolation::new(
                            ErrorCode::ParameterOutOfRange,
                            format!("{number} must be >= {min}"),
                        ));
                    }
                }
                if let Some(max) = max {
                    if number > *max {
                        return Err(ParamViolation::new(
                            ErrorCode::ParameterOutOfRange,
                            format!("{number} must be <= {max}"),
                        ));
                    }
                }
                Ok(())
            }
            ParamKind::Boolean => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(ParamViolation::new(
                        ErrorCode::InvalidParameterType,
                        "expected a boolean",
                    ))
                }
            }
            ParamKind::Date => {
                let text = value.as_str().ok_or_else(|| {
                    ParamViolation::new(
                        ErrorCode::InvalidParameterType,
                        "expected a 'YYYY-MM-DD' date string",
                    )
                })?;
                let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| {
                    ParamViolation::new(
                        ErrorCode::InvalidParameterValue,
                        format!("'{text}' is not a valid 'YYYY-MM-DD' date"),
                    )
                })?;
                let min = NaiveDate::parse_from_str(MIN_PARAM_DATE, "%Y-%m-%d")
                    .expect("MIN_PARAM_DATE is valid");
                let today = Utc::now().date_naive();
                let max = today
                    .with_year(today.year() + 1)
                    .unwrap_or(today);
                if date < min || date > max {
                    return Err(ParamViolation::new(
                        ErrorCode::ParameterOutOfRange,
                        format!("'{text}' must be between {MIN_PARAM_DATE} and one year from now"),
                    ));
                }
                Ok(())
            }
            ParamKind::Array => {
                if value.is_array() {
                    Ok(())
                } else {
                    Err(ParamViolation::new(
                        ErrorCode::InvalidParameterType,
                        "expected an array",
                    ))
                }
            }
            ParamKind::Object => {
                if value.is_object() {
                    Ok(())
                } else {
                    Err(ParamViolation::new(
                        ErrorCode::InvalidParameterType,
                        "expected an object",
                    ))
                }
            }
            ParamKind::Any => Ok(()),
        }
    }
}

/// One declared parameter of a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamField {
    /// Parameter name
    pub name: String,
    /// Type and constraints
    pub kind: ParamKind,
    /// True if the parameter must be supplied
    pub required: bool,
    /// Default applied at compile time when the parameter is omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// The full parameter schema of a node type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    /// Declared fields, in declaration order
    pub fields: Vec<ParamField>,
}

impl ParamSchema {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field.
    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            kind,
            required: true,
            default: None,
        });
        self
    }

    /// Add an optional field without a default.
    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            kind,
            required: false,
            default: None,
        });
        self
    }

    /// Add an optional field with a default.
    pub fn optional_with_default(
        mut self,
        name: impl Into<String>,
        kind: ParamKind,
        default: Value,
    ) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            kind,
            required: false,
            default: Some(default),
        });
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&ParamField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names of all required fields.
    pub fn required_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Copy of `params` with declared defaults filled in for omitted fields.
    pub fn apply_defaults(
        &self,
        params: &serde_json::Map<String, Value>,
    ) -> serde_json::Map<String, Value> {
        let mut resolved = params.clone();
        for field in &self.fields {
            if let Some(default) = &field.default {
                resolved
                    .entry(field.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        resolved
    }
}
