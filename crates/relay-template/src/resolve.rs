use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::{ExecutionState, Params, TemplateError};

use crate::parser::{parse_template, Piece, Segment, TemplateRef, VarPath};

/// Default ceiling for a structured value substituted by a simple template.
pub const DEFAULT_MAX_STRUCTURED_BYTES: usize = 10 * 1024 * 1024;

/// What happens to a reference whose path does not resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateMode {
    /// Raise [`TemplateError::Unresolved`] for any unresolved reference.
    #[default]
    Strict,
    /// Leave the literal `${...}` text in place.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub mode: TemplateMode,
    pub max_structured_bytes: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            mode: TemplateMode::Strict,
            max_structured_bytes: DEFAULT_MAX_STRUCTURED_BYTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Anything that can answer "what is the root value of scope `name`".
pub trait Scopes {
    fn scope(&self, name: &str) -> Option<&Value>;
}

impl Scopes for ExecutionState {
    fn scope(&self, name: &str) -> Option<&Value> {
        ExecutionState::scope(self, name)
    }
}

impl Scopes for Params {
    fn scope(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Extra bindings (e.g. a batch item alias) layered over a base scope set.
/// Bindings shadow base scopes of the same name.
pub struct WithBindings<'a> {
    pub bindings: &'a Params,
    pub base: &'a dyn Scopes,
}

impl Scopes for WithBindings<'_> {
    fn scope(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name).or_else(|| self.base.scope(name))
    }
}

// ---------------------------------------------------------------------------
// Lookup and stringification
// ---------------------------------------------------------------------------

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Walk `path` through `scopes`. On failure returns a human-readable reason.
pub fn lookup<'v>(scopes: &'v dyn Scopes, path: &VarPath) -> Result<&'v Value, String> {
    let mut current = scopes
        .scope(&path.scope)
        .ok_or_else(|| format!("'{}' has no value in the current state", path.scope))?;
    let mut walked = path.scope.clone();

    for seg in &path.segments {
        current = match (seg, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key).ok_or_else(|| {
                let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
                keys.truncate(10);
                format!(
                    "'{walked}' has no field '{key}' (available: {})",
                    if keys.is_empty() { "none".to_string() } else { keys.join(", ") }
                )
            })?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i).ok_or_else(|| {
                format!("index {i} is out of bounds for '{walked}' (length {})", items.len())
            })?,
            (Segment::Key(key), other) => {
                return Err(format!(
                    "cannot read field '{key}' of '{walked}': it is {}",
                    json_type_name(other)
                ))
            }
            (Segment::Index(i), other) => {
                return Err(format!(
                    "cannot index [{i}] into '{walked}': it is {}",
                    json_type_name(other)
                ))
            }
        };
        match seg {
            Segment::Key(k) => {
                walked.push('.');
                walked.push_str(k);
            }
            Segment::Index(i) => walked.push_str(&format!("[{i}]")),
        }
    }
    Ok(current)
}

/// Canonical JSON: compact, with object keys sorted at every level, so the
/// same value always stringifies to the same text.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// String form used when a value is interpolated into surrounding text.
fn interpolation_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Object(_) | Value::Array(_) => canonical_json(value),
    }
}

// ---------------------------------------------------------------------------
// TemplateResolver
// ---------------------------------------------------------------------------

/// Dynamic (run-time) template resolution.
#[derive(Debug, Clone, Default)]
pub struct TemplateResolver {
    config: TemplateConfig,
}

impl TemplateResolver {
    pub fn new(config: TemplateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    /// Resolve every string leaf of `value`. Object keys are never templated.
    pub fn resolve_value(&self, value: &Value, scopes: &dyn Scopes) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.resolve_str(s, scopes),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, scopes))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Params::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, scopes)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve one string. A simple template returns the referenced value
    /// unchanged; anything else returns a string.
    pub fn resolve_str(&self, input: &str, scopes: &dyn Scopes) -> Result<Value, TemplateError> {
        let pieces = parse_template(input)?;
        match pieces.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Piece::Text(text)] => Ok(Value::String(text.clone())),
            [Piece::Ref(reference)] => self.resolve_simple(reference, scopes),
            _ => self.interpolate_pieces(&pieces, scopes).map(Value::String),
        }
    }

    /// Interpolate `input` into a string regardless of its shape.
    pub fn interpolate(&self, input: &str, scopes: &dyn Scopes) -> Result<String, TemplateError> {
        let pieces = parse_template(input)?;
        self.interpolate_pieces(&pieces, scopes)
    }

    fn resolve_simple(&self, reference: &TemplateRef, scopes: &dyn Scopes) -> Result<Value, TemplateError> {
        match lookup(scopes, &reference.path) {
            Ok(value) => {
                if matches!(value, Value::Object(_) | Value::Array(_)) {
                    let size = serde_json::to_vec(value).map(|b| b.len()).unwrap_or(usize::MAX);
                    if size > self.config.max_structured_bytes {
                        return Err(TemplateError::ValueTooLarge {
                            template: reference.raw.clone(),
                            size,
                            limit: self.config.max_structured_bytes,
                        });
                    }
                }
                tracing::debug!(template = %reference.raw, kind = json_type_name(value), "Resolved simple template");
                Ok(value.clone())
            }
            Err(reason) => self.unresolved(reference, reason).map(Value::String),
        }
    }

    fn interpolate_pieces(&self, pieces: &[Piece], scopes: &dyn Scopes) -> Result<String, TemplateError> {
        let mut out = String::new();
        for piece in pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Ref(reference) => match lookup(scopes, &reference.path) {
                    Ok(value) => out.push_str(&interpolation_text(value)),
                    Err(reason) => out.push_str(&self.unresolved(reference, reason)?),
                },
            }
        }
        Ok(out)
    }

    fn unresolved(&self, reference: &TemplateRef, reason: String) -> Result<String, TemplateError> {
        match self.config.mode {
            TemplateMode::Strict => Err(TemplateError::Unresolved {
                template: reference.raw.clone(),
                reason,
            }),
            TemplateMode::Lenient => {
                tracing::warn!(template = %reference.raw, %reason, "Leaving unresolved template in place");
                Ok(reference.raw.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scopes(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn strict() -> TemplateResolver {
        TemplateResolver::default()
    }

    fn lenient() -> TemplateResolver {
        TemplateResolver::new(TemplateConfig {
            mode: TemplateMode::Lenient,
            ..TemplateConfig::default()
        })
    }

    #[test]
    fn simple_template_preserves_structure() {
        let state = scopes(json!({"a": {"b": {"k": [1, 2, 3]}}}));
        let value = strict().resolve_str("${a.b}", &state).unwrap();
        assert_eq!(value, json!({"k": [1, 2, 3]}));
    }

    #[test]
    fn simple_template_preserves_scalars() {
        let state = scopes(json!({"n": {"count": 3, "ok": true, "ratio": 0.5, "none": null}}));
        let r = strict();
        assert_eq!(r.resolve_str("${n.count}", &state).unwrap(), json!(3));
        assert_eq!(r.resolve_str("${n.ok}", &state).unwrap(), json!(true));
        assert_eq!(r.resolve_str("${n.ratio}", &state).unwrap(), json!(0.5));
        assert_eq!(r.resolve_str("${n.none}", &state).unwrap(), Value::Null);
    }

    #[test]
    fn complex_template_serializes_structured_values() {
        let state = scopes(json!({"a": {"b": {"k": [1, 2, 3]}}}));
        let value = strict().resolve_str("x=${a.b}", &state).unwrap();
        assert_eq!(value, json!("x={\"k\":[1,2,3]}"));
        // Deterministic across calls.
        assert_eq!(strict().resolve_str("x=${a.b}", &state).unwrap(), value);
    }

    #[test]
    fn canonical_json_sorts_keys_at_every_level() {
        let value = json!({"z": 1, "a": {"y": [true, null], "b": "s"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"b":"s","y":[true,null]},"z":1}"#);
    }

    #[test]
    fn complex_template_scalar_forms() {
        let state = scopes(json!({"n": {"count": 3, "ok": false, "name": "ada", "none": null}}));
        let value = strict()
            .resolve_str("${n.name}:${n.count}:${n.ok}:[${n.none}]", &state)
            .unwrap();
        assert_eq!(value, json!("ada:3:false:[]"));
    }

    #[test]
    fn adjacent_templates_concatenate() {
        let state = scopes(json!({"a": {"v": "foo"}, "b": {"v": 42}}));
        assert_eq!(strict().resolve_str("${a.v}${b.v}", &state).unwrap(), json!("foo42"));
    }

    #[test]
    fn escaped_template_is_literal_even_when_path_exists() {
        let state = scopes(json!({"a": {"b": 1}}));
        assert_eq!(strict().resolve_str("$${a.b}", &state).unwrap(), json!("${a.b}"));
        let empty = Params::new();
        assert_eq!(strict().resolve_str("$${a.b}", &empty).unwrap(), json!("${a.b}"));
    }

    #[test]
    fn array_index_segments() {
        let state = scopes(json!({"list": {"items": [{"name": "x"}, {"name": "y"}]}}));
        assert_eq!(
            strict().resolve_str("${list.items[1].name}", &state).unwrap(),
            json!("y")
        );
    }

    #[test]
    fn strict_mode_raises_on_unresolved_simple_and_complex() {
        let state = scopes(json!({"a": {"b": 1}}));
        let err = strict().resolve_str("${a.missing}", &state).unwrap_err();
        match err {
            TemplateError::Unresolved { template, reason } => {
                assert_eq!(template, "${a.missing}");
                assert!(reason.contains("no field 'missing'"), "{reason}");
                assert!(reason.contains("available: b"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(strict().resolve_str("see ${ghost.x}", &state).is_err());
    }

    #[test]
    fn lenient_mode_leaves_literal_text() {
        let state = scopes(json!({"a": {"b": 1}}));
        assert_eq!(lenient().resolve_str("${a.missing}", &state).unwrap(), json!("${a.missing}"));
        assert_eq!(
            lenient().resolve_str("b=${a.b}, c=${a.c}", &state).unwrap(),
            json!("b=1, c=${a.c}")
        );
    }

    #[test]
    fn index_out_of_bounds_reason() {
        let state = scopes(json!({"a": {"xs": [1]}}));
        let err = strict().resolve_str("${a.xs[4]}", &state).unwrap_err();
        assert!(err.to_string().contains("out of bounds"), "{err}");
    }

    #[test]
    fn field_access_on_scalar_is_unresolved() {
        let state = scopes(json!({"a": {"name": "x"}}));
        let err = strict().resolve_str("${a.name.first}", &state).unwrap_err();
        assert!(err.to_string().contains("it is string"), "{err}");
    }

    #[test]
    fn recursion_mixes_native_and_interpolated_leaves() {
        let state = scopes(json!({"src": {"meta": {"id": 7}, "title": "T"}}));
        let param = json!({
            "meta": "${src.meta}",
            "label": "title: ${src.title}",
            "nested": ["${src.meta.id}", 5, {"deep": "${src.title}"}],
            "${src.title}": "keys are not templated"
        });
        let resolved = strict().resolve_value(&param, &state).unwrap();
        assert_eq!(
            resolved,
            json!({
                "meta": {"id": 7},
                "label": "title: T",
                "nested": [7, 5, {"deep": "T"}],
                "${src.title}": "keys are not templated"
            })
        );
    }

    #[test]
    fn size_guard_rejects_large_structured_values() {
        let state = scopes(json!({"big": {"blob": ["aaaaaaaaaa", "bbbbbbbbbb", "cccccccccc"]}}));
        let resolver = TemplateResolver::new(TemplateConfig {
            max_structured_bytes: 16,
            ..TemplateConfig::default()
        });
        let err = resolver.resolve_str("${big.blob}", &state).unwrap_err();
        assert!(matches!(err, TemplateError::ValueTooLarge { limit: 16, .. }));
        // Scalars are not subject to the guard.
        assert_eq!(
            resolver.resolve_str("${big.blob[0]}", &state).unwrap(),
            json!("aaaaaaaaaa")
        );
    }

    #[test]
    fn bindings_shadow_base_scopes() {
        let base = scopes(json!({"item": "base", "other": {"v": 1}}));
        let bindings = scopes(json!({"item": {"name": "bound"}}));
        let layered = WithBindings {
            bindings: &bindings,
            base: &base,
        };
        assert_eq!(strict().resolve_str("${item.name}", &layered).unwrap(), json!("bound"));
        assert_eq!(strict().resolve_str("${other.v}", &layered).unwrap(), json!(1));
    }

    #[test]
    fn resolves_against_execution_state() {
        use relay_types::NamespacedWrites;
        let mut state = ExecutionState::new(scopes(json!({"topic": "rust"})));
        state
            .commit(NamespacedWrites::new("draft", scopes(json!({"text": "hello"}))))
            .unwrap();
        assert_eq!(
            strict().resolve_str("${inputs.topic}: ${draft.text}", &state).unwrap(),
            json!("rust: hello")
        );
    }
}
