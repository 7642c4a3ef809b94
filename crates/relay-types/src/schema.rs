//! Declared interface entries with recursive nested structure.

use serde::{Deserialize, Serialize};

/// One `key: type  # description` entry of a component interface. Nested
/// entries describe object fields, or the fields of each element for
/// `list[dict]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceField {
    pub key: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structure: Vec<InterfaceField>,
}

/// Coarse shape of a declared type, as far as path validation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeShape {
    /// `any` or an unknown type name; never validated statically.
    Open,
    Object,
    List,
    Scalar,
}

impl InterfaceField {
    pub fn new(key: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            type_name: type_name.into(),
            description: String::new(),
            structure: Vec::new(),
        }
    }

    pub fn with_structure(mut self, structure: Vec<InterfaceField>) -> Self {
        self.structure = structure;
        self
    }

    pub fn shape(&self) -> TypeShape {
        type_shape(&self.type_name)
    }

    /// Element type of a list type: `list[dict]` → `dict`, bare `list` → `any`.
    pub fn element_type(&self) -> &str {
        element_type(&self.type_name)
    }

    pub fn child(&self, key: &str) -> Option<&InterfaceField> {
        self.structure.iter().find(|f| f.key == key)
    }
}

/// Element type named inside the brackets of a type name, `any` if none.
pub fn element_type(type_name: &str) -> &str {
    let t = type_name.trim();
    t.find('[')
        .and_then(|open| t.strip_suffix(']').map(|inner| &inner[open + 1..]))
        .map(str::trim)
        .filter(|inner| !inner.is_empty())
        .unwrap_or("any")
}

/// Classify a type name from the interface grammar.
pub fn type_shape(type_name: &str) -> TypeShape {
    let t = type_name.trim().to_ascii_lowercase();
    let base = t.split('[').next().unwrap_or("").trim();
    match base {
        "dict" | "object" | "map" => TypeShape::Object,
        "list" | "array" => TypeShape::List,
        "str" | "string" | "int" | "integer" | "float" | "number" | "bool" | "boolean" | "bytes" => {
            TypeShape::Scalar
        }
        _ => TypeShape::Open,
    }
}
