//! Execution state: a two-level map keyed by node id, plus the reserved
//! `inputs` namespace for workflow-level inputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Params, RelayError, Result};

/// Scope name under which workflow inputs are visible to templates.
pub const INPUTS_NAMESPACE: &str = "inputs";

/// Outputs of one step, bound to the node that produced them.
///
/// The owner is fixed at construction; [`ExecutionState::commit`] only ever
/// writes into `state[owner]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedWrites {
    owner: String,
    values: Params,
}

impl NamespacedWrites {
    pub fn new(owner: impl Into<String>, values: Params) -> Self {
        Self {
            owner: owner.into(),
            values,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn values(&self) -> &Params {
        &self.values
    }

    pub fn into_values(self) -> Params {
        self.values
    }
}

/// State of a single run. Created fresh per execution and never shared
/// across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    inputs: Value,
    namespaces: BTreeMap<String, Value>,
}

impl ExecutionState {
    pub fn new(inputs: Params) -> Self {
        Self {
            inputs: Value::Object(inputs),
            namespaces: BTreeMap::new(),
        }
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    /// The subtree owned by `node_id`, if it has written anything yet.
    pub fn namespace(&self, node_id: &str) -> Option<&Value> {
        self.namespaces.get(node_id)
    }

    /// Root value for a template scope: a node id or [`INPUTS_NAMESPACE`].
    pub fn scope(&self, name: &str) -> Option<&Value> {
        if name == INPUTS_NAMESPACE {
            Some(&self.inputs)
        } else {
            self.namespaces.get(name)
        }
    }

    /// Merge `writes` into the owner's subtree. Keys already present are
    /// overwritten; other keys in the subtree are kept.
    pub fn commit(&mut self, writes: NamespacedWrites) -> Result<()> {
        if writes.owner == INPUTS_NAMESPACE || writes.owner.is_empty() {
            return Err(RelayError::NamespaceViolation {
                owner: writes.owner,
            });
        }
        let slot = self
            .namespaces
            .entry(writes.owner)
            .or_insert_with(|| Value::Object(Params::new()));
        if let Value::Object(map) = slot {
            map.extend(writes.values);
        }
        Ok(())
    }

    /// Node ids that have written output, in sorted order.
    pub fn written_nodes(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Whole state as one JSON object (`inputs` plus every namespace).
    pub fn to_value(&self) -> Value {
        let mut root = Params::new();
        root.insert(INPUTS_NAMESPACE.to_string(), self.inputs.clone());
        for (id, subtree) in &self.namespaces {
            root.insert(id.clone(), subtree.clone());
        }
        Value::Object(root)
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new(Params::new())
    }
}
