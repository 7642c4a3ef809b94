//! Template grammar, static analysis, and dynamic resolution.
//!
//! Templates are `${scope.path[0].field}` references embedded in string
//! parameter values. `scope` is a node id or the reserved `inputs`
//! namespace; `$${...}` is an escaped literal.
//!
//! A string that is exactly one template (a *simple* template) resolves to the
//! referenced value with its JSON type intact. Any other string containing
//! templates (a *complex* template) is interpolated into a string.
//!
//! # Example
//! ```
//! use relay_template::{TemplateResolver, TemplateConfig};
//! use serde_json::json;
//!
//! let mut scopes = serde_json::Map::new();
//! scopes.insert("fetch".into(), json!({"items": ["x", "y"]}));
//!
//! let resolver = TemplateResolver::new(TemplateConfig::default());
//! let items = resolver.resolve_str("${fetch.items}", &scopes).unwrap();
//! assert_eq!(items, json!(["x", "y"]));
//! let text = resolver.resolve_str("n=${fetch.items[1]}", &scopes).unwrap();
//! assert_eq!(text, json!("n=y"));
//! ```

pub mod analysis;
mod parser;
mod resolve;

pub use analysis::{check_path, extract_refs, PathCheck};
pub use parser::{has_templates, is_identifier, parse_template, Piece, Segment, TemplateRef, VarPath};
pub use resolve::{
    canonical_json, json_type_name, lookup, Scopes, TemplateConfig, TemplateMode, TemplateResolver,
    WithBindings, DEFAULT_MAX_STRUCTURED_BYTES,
};
