//! Static template analysis used by the compiler.
//!
//! Nothing here reads run-time state: references are collected from raw
//! parameter values and checked against the declared interface of the node
//! they point at.

use serde_json::Value;

use relay_types::{element_type, type_shape, InterfaceField, TemplateError, TypeShape};

use crate::parser::{parse_template, Piece, Segment, TemplateRef};

/// Every live template reference in `value`, in document order. Object keys
/// are not scanned.
pub fn extract_refs(value: &Value) -> Result<Vec<TemplateRef>, TemplateError> {
    let mut out = Vec::new();
    collect(value, &mut out)?;
    Ok(out)
}

fn collect(value: &Value, out: &mut Vec<TemplateRef>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => {
            for piece in parse_template(s)? {
                if let Piece::Ref(r) = piece {
                    out.push(r);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect(v, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Outcome of checking a reference path against a declared interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCheck {
    /// The path exists in the declared schema.
    Valid,
    /// The schema is open or untyped at some point; checked at run time.
    Deferred(String),
    /// The path cannot exist given the declared schema.
    Invalid(String),
}

/// Check `segments` (the path after the node id) against a node's declared
/// writes.
pub fn check_path(segments: &[Segment], writes: &[InterfaceField]) -> PathCheck {
    let Some((first, rest)) = segments.split_first() else {
        return PathCheck::Valid;
    };
    if writes.is_empty() {
        return PathCheck::Deferred("component declares no outputs".to_string());
    }
    let key = match first {
        Segment::Key(k) => k,
        Segment::Index(i) => {
            return PathCheck::Invalid(format!("cannot index [{i}] into a node's outputs"));
        }
    };
    let Some(field) = writes.iter().find(|f| &f.key == key) else {
        let declared: Vec<&str> = writes.iter().map(|f| f.key.as_str()).collect();
        return PathCheck::Invalid(format!(
            "output '{key}' is not declared (declared: {})",
            declared.join(", ")
        ));
    };

    let mut type_name = field.type_name.as_str();
    let mut structure = field.structure.as_slice();
    let mut walked = key.clone();

    for seg in rest {
        match (type_shape(type_name), seg) {
            (TypeShape::Open, _) => {
                return PathCheck::Deferred(format!("'{walked}' is declared as '{type_name}'"));
            }
            (TypeShape::Object, Segment::Key(k)) => {
                if structure.is_empty() {
                    return PathCheck::Deferred(format!("'{walked}' has no declared structure"));
                }
                let Some(child) = structure.iter().find(|f| &f.key == k) else {
                    return PathCheck::Invalid(format!("'{walked}' has no declared field '{k}'"));
                };
                type_name = child.type_name.as_str();
                structure = child.structure.as_slice();
                walked.push('.');
                walked.push_str(k);
            }
            (TypeShape::List, Segment::Index(i)) => {
                let element = element_type(type_name);
                // Nested entries under a bare `list` describe each element.
                type_name = if element == "any" && !structure.is_empty() {
                    "dict"
                } else {
                    element
                };
                walked.push_str(&format!("[{i}]"));
            }
            (TypeShape::Object, Segment::Index(i)) => {
                return PathCheck::Invalid(format!("cannot index [{i}] into '{walked}' ({type_name})"));
            }
            (TypeShape::List, Segment::Key(k)) => {
                return PathCheck::Invalid(format!(
                    "cannot read field '{k}' of '{walked}' ({type_name}); use an index"
                ));
            }
            (TypeShape::Scalar, _) => {
                return PathCheck::Invalid(format!(
                    "'{walked}' is a scalar ({type_name}) and has no fields"
                ));
            }
        }
    }
    PathCheck::Valid
}
