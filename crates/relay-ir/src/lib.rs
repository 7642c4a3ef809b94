//! Graph specification model: the JSON document the compiler consumes.
//!
//! ```json
//! {
//!   "version": "1",
//!   "inputs": {"topic": {"type": "str"}},
//!   "nodes": [
//!     {"id": "search", "type": "web-search", "params": {"query": "${inputs.topic}"}},
//!     {"id": "summarize", "type": "summarize", "params": {"docs": "${search.results}"}}
//!   ],
//!   "edges": [{"from": "search", "to": "summarize", "action": "default"}]
//! }
//! ```

mod validate;

pub use validate::{validate_shape, validate_shape_or_raise, Diagnostic, Severity};

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use relay_types::{CompilationError, CompilePhase, Params, DEFAULT_ACTION};

/// Major graph format version understood by this crate.
pub const SUPPORTED_MAJOR_VERSION: &str = "1";

/// Default name a batch item is bound to in templates.
pub const DEFAULT_BATCH_ALIAS: &str = "item";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(alias = "ir_version", deserialize_with = "version_string")]
    pub version: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_node: Option<String>,
    /// Declared workflow inputs, visible to templates as `${inputs.<name>}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default = "default_action")]
    pub action: String,
}

/// Marks a node as list-repeatable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    /// Template resolving to the list to fan out over.
    pub items: String,
    #[serde(rename = "as", default = "default_alias")]
    pub alias: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
}

/// What a batch does when one of its items fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop scheduling new items at the first failure and emit `error`.
    #[default]
    FailFast,
    /// Run every item, then emit `default` with per-item errors reported.
    CollectAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn empty_object() -> Value {
    Value::Object(Params::new())
}

fn default_action() -> String {
    DEFAULT_ACTION.to_string()
}

fn default_alias() -> String {
    DEFAULT_BATCH_ALIAS.to_string()
}

fn default_true() -> bool {
    true
}

/// Accepts `"1"`, `"1.0"` or a bare JSON number for the version field.
fn version_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "version must be a string or number, got {other}"
        ))),
    }
}

impl GraphSpec {
    /// Parse a graph from JSON text. Syntax and schema errors are reported as
    /// `invalid_spec` compilation errors.
    pub fn from_json(text: &str) -> Result<Self, CompilationError> {
        serde_json::from_str(text).map_err(|e| {
            CompilationError::new(CompilePhase::InvalidSpec, format!("graph is not valid JSON: {e}"))
        })
    }

    pub fn from_value(value: Value) -> Result<Self, CompilationError> {
        serde_json::from_value(value).map_err(|e| {
            CompilationError::new(CompilePhase::InvalidSpec, format!("graph does not match the schema: {e}"))
        })
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Position of `id` in declaration order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// The node execution starts at: `start_node`, else the first declared node.
    pub fn entry_node(&self) -> Option<&str> {
        self.start_node
            .as_deref()
            .or_else(|| self.nodes.first().map(|n| n.id.as_str()))
    }

    /// Fill defaults and check that every required input is present.
    ///
    /// Returns the name of the first missing required input on failure.
    pub fn apply_input_defaults(&self, provided: Params) -> Result<Params, String> {
        let mut out = provided;
        for (name, spec) in &self.inputs {
            if out.contains_key(name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    out.insert(name.clone(), default.clone());
                }
                None if spec.required => return Err(name.clone()),
                None => {}
            }
        }
        Ok(out)
    }
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            params: empty_object(),
            batch: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_batch(mut self, batch: BatchSpec) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Static params as a map; an absent or non-object value yields an empty map.
    pub fn param_map(&self) -> Params {
        match &self.params {
            Value::Object(map) => map.clone(),
            _ => Params::new(),
        }
    }
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: action.into(),
        }
    }
}

impl BatchSpec {
    pub fn over(items: impl Into<String>) -> Self {
        Self {
            items: items.into(),
            alias: default_alias(),
            parallel: false,
            max_concurrency: None,
            failure_policy: None,
        }
    }
}
