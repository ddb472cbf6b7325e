//! Pipeline source parser
//!
//! A pipeline source is a JSON document: an ordered array of node objects,
//! each with at least `id` and `type`, plus optional `depends_on` and
//! `params`. The parser is strict about the root shape, forgiving about
//! unknown keys (retained for later reporting), and recovers to the next
//! declaration after a malformed element so one bad node does not swallow
//! the rest of the report.

use serde_json::{Map, Value};

use crate::error::ErrorCode;
use crate::validator::{Severity, ValidationIssue};

/// A location in the pipeline source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Span {
    /// 1-based line number
    pub line: usize,
    /// 1-based column number
    pub column: usize,
}

/// One untyped node declaration from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDecl {
    /// Declared node id
    pub id: String,
    /// Declared node type name
    pub node_type: String,
    /// Upstream node ids, in declared order
    pub depends_on: Vec<String>,
    /// Raw parameter map
    pub params: Map<String, Value>,
    /// Keys on the declaration that the engine does not recognize
    pub unknown_keys: Vec<String>,
    /// Position in the source array (drives topological tie-breaks)
    pub index: usize,
}

/// Result of parsing: recovered declarations plus per-element findings.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    /// Declarations that parsed well enough to validate further
    pub decls: Vec<NodeDecl>,
    /// Syntax and shape findings
    pub issues: Vec<ValidationIssue>,
}

impl ParseOutcome {
    /// True when any finding is an error.
    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == Severity::Error)
    }
}

/// Keys the engine understands on a node declaration.
const KNOWN_KEYS: [&str; 4] = ["id", "type", "depends_on", "params"];

/// Parse a pipeline source document.
pub fn parse_pipeline(source: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();

    let document: Value = match serde_json::from_str(source) {
        Ok(document) => document,
        Err(err) => {
            outcome.issues.push(
                ValidationIssue::error(
                    ErrorCode::SyntaxError,
                    format!("pipeline source is not valid JSON: {err}"),
                )
                .with_span(Span {
                    line: err.line(),
                    column: err.column(),
                }),
            );
            return outcome;
        }
    };

    let elements = match document {
        Value::Array(elements) => elements,
        other => {
            outcome.issues.push(ValidationIssue::error(
                ErrorCode::SchemaViolation,
                format!(
                    "pipeline source must be an array of node objects, found {}",
                    json_type_name(&other)
                ),
            ));
            return outcome;
        }
    };

    for (index, element) in elements.into_iter().enumerate() {
        match parse_declaration(index, element) {
            Ok(decl) => outcome.decls.push(decl),
            Err(issue) => outcome.issues.push(issue),
        }
    }
    outcome
}

/// Parse one array element into a declaration, or report why it cannot be.
fn parse_declaration(index: usize, element: Value) -> Result<NodeDecl, ValidationIssue> {
    let object = match element {
        Value::Object(object) => object,
        other => {
            return Err(ValidationIssue::error(
                ErrorCode::SchemaViolation,
                format!(
                    "declaration #{index} must be an object, found {}",
                    json_type_name(&other)
                ),
            ));
        }
    };

    let id = match object.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        Some(_) => {
            return Err(ValidationIssue::error(
                ErrorCode::SchemaViolation,
                format!("declaration #{index} has an empty 'id'"),
            ))
        }
        None => {
            return Err(ValidationIssue::error(
                ErrorCode::SchemaViolation,
                format!("declaration #{index} is missing a string 'id'"),
            ))
        }
    };

    let node_type = match object.get("type").and_then(Value::as_str) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => {
            return Err(ValidationIssue::error(
                ErrorCode::SchemaViolation,
                format!("declaration '{id}' is missing a string 'type'"),
            )
            .with_node(&id))
        }
    };

    let depends_on = match object.get("depends_on") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut deps = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(dep) => deps.push(dep.to_string()),
                    None => {
                        return Err(ValidationIssue::error(
                            ErrorCode::SchemaViolation,
                            format!("'depends_on' of node '{id}' must contain only strings"),
                        )
                        .with_node(&id)
                        .with_field("depends_on"))
                    }
                }
            }
            deps
        }
        Some(_) => {
            return Err(ValidationIssue::error(
                ErrorCode::SchemaViolation,
                format!("'depends_on' of node '{id}' must be an array of node ids"),
            )
            .with_node(&id)
            .with_field("depends_on"))
        }
    };

    let params = match object.get("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(params)) => params.clone(),
        Some(_) => {
            return Err(ValidationIssue::error(
                ErrorCode::SchemaViolation,
                format!("'params' of node '{id}' must be an object"),
            )
            .with_node(&id)
            .with_field("params"))
        }
    };

    let unknown_keys = object
        .keys()
        .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();

    Ok(NodeDecl {
        id,
        node_type,
        depends_on,
        params,
        unknown_keys,
        index,
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
