//! Shape rules: checks that need nothing but the graph document itself.
//!
//! Call [`validate_shape`] for every diagnostic, or [`validate_shape_or_raise`]
//! to turn the first `Error` into an `invalid_spec` compilation error.

use std::collections::{HashMap, HashSet, VecDeque};

use relay_template::{is_identifier, parse_template, Piece};
use relay_types::{CompilationError, CompilePhase, INPUTS_NAMESPACE};

use crate::{GraphSpec, SUPPORTED_MAJOR_VERSION};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

trait ShapeRule {
    fn name(&self) -> &str;
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic>;
}

impl Diagnostic {
    fn error(rule: &str, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            node_id: None,
            fix: None,
        }
    }

    fn at(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct VersionRule;
impl ShapeRule for VersionRule {
    fn name(&self) -> &str { "version" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let major = spec.version.trim().split('.').next().unwrap_or("");
        if major == SUPPORTED_MAJOR_VERSION {
            return vec![];
        }
        vec![Diagnostic::error(
            self.name(),
            format!("Unsupported graph version '{}'", spec.version),
        )
        .fix(format!("Set \"version\" to \"{SUPPORTED_MAJOR_VERSION}\""))]
    }
}

struct NonEmptyRule;
impl ShapeRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        if spec.nodes.is_empty() {
            vec![Diagnostic::error(self.name(), "Graph declares no nodes".into())
                .fix("Add at least one node")]
        } else {
            vec![]
        }
    }
}

struct NodeIdRule;
impl ShapeRule for NodeIdRule {
    fn name(&self) -> &str { "node_id" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut seen = HashSet::new();
        for node in &spec.nodes {
            if node.id == INPUTS_NAMESPACE {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Node id '{INPUTS_NAMESPACE}' is reserved for workflow inputs"),
                    )
                    .at(&node.id)
                    .fix("Rename the node"),
                );
            } else if !is_identifier(&node.id) {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Node id '{}' is not a valid identifier", node.id),
                    )
                    .at(&node.id)
                    .fix("Use letters, digits, '_' and single '-' separators, starting with a letter or '_'"),
                );
            }
            if !seen.insert(node.id.as_str()) {
                diags.push(
                    Diagnostic::error(self.name(), format!("Duplicate node id '{}'", node.id))
                        .at(&node.id)
                        .fix("Give every node a unique id"),
                );
            }
        }
        diags
    }
}

struct NodeTypeRule;
impl ShapeRule for NodeTypeRule {
    fn name(&self) -> &str { "node_type" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        spec.nodes
            .iter()
            .filter(|n| n.component_type.trim().is_empty())
            .map(|n| {
                Diagnostic::error(self.name(), format!("Node '{}' has an empty type", n.id))
                    .at(&n.id)
            })
            .collect()
    }
}

struct ParamsObjectRule;
impl ShapeRule for ParamsObjectRule {
    fn name(&self) -> &str { "params_object" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        spec.nodes
            .iter()
            .filter(|n| !n.params.is_object())
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!("Node '{}' params must be a JSON object", n.id),
                )
                .at(&n.id)
            })
            .collect()
    }
}

struct BatchRule;
impl ShapeRule for BatchRule {
    fn name(&self) -> &str { "batch" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let ids: HashSet<&str> = spec.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut diags = Vec::new();
        for node in &spec.nodes {
            let Some(batch) = &node.batch else { continue };
            let simple = matches!(parse_template(&batch.items).as_deref(), Ok([Piece::Ref(_)]));
            if !simple {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!(
                            "Batch items of node '{}' must be a single template, got '{}'",
                            node.id, batch.items
                        ),
                    )
                    .at(&node.id)
                    .fix("Use a reference such as \"${producer.items}\""),
                );
            }
            if !is_identifier(&batch.alias) {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Batch alias '{}' of node '{}' is not a valid identifier", batch.alias, node.id),
                    )
                    .at(&node.id),
                );
            } else if batch.alias == INPUTS_NAMESPACE || ids.contains(batch.alias.as_str()) {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!(
                            "Batch alias '{}' of node '{}' shadows a node id or the inputs namespace",
                            batch.alias, node.id
                        ),
                    )
                    .at(&node.id)
                    .fix("Choose an alias that is not a node id"),
                );
            }
            if batch.max_concurrency == Some(0) {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Batch max_concurrency of node '{}' must be at least 1", node.id),
                    )
                    .at(&node.id),
                );
            }
        }
        diags
    }
}

struct InputNameRule;
impl ShapeRule for InputNameRule {
    fn name(&self) -> &str { "input_name" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        spec.inputs
            .keys()
            .filter(|name| !is_identifier(name))
            .map(|name| {
                Diagnostic::error(
                    self.name(),
                    format!("Workflow input '{name}' is not a valid identifier"),
                )
            })
            .collect()
    }
}

/// Nodes that no edge path reaches from the entry node. Advisory only.
struct ReachabilityRule;
impl ShapeRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic> {
        let Some(entry) = spec.entry_node() else {
            return vec![];
        };
        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &spec.edges {
            outgoing.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(entry);
        queue.push_back(entry);
        while let Some(current) = queue.pop_front() {
            for &next in outgoing.get(current).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        spec.nodes
            .iter()
            .filter(|n| !visited.contains(n.id.as_str()))
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Node '{}' is not reachable from the entry node '{entry}'", n.id),
                node_id: Some(n.id.clone()),
                fix: Some(format!("Add an edge leading to '{}' or remove it", n.id)),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run every shape rule and return the collected diagnostics.
pub fn validate_shape(spec: &GraphSpec) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn ShapeRule>> = vec![
        Box::new(VersionRule),
        Box::new(NonEmptyRule),
        Box::new(NodeIdRule),
        Box::new(NodeTypeRule),
        Box::new(ParamsObjectRule),
        Box::new(BatchRule),
        Box::new(InputNameRule),
        Box::new(ReachabilityRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(spec));
    }
    diagnostics
}

/// Run every shape rule; the first `Error` becomes an `invalid_spec`
/// compilation error. Warnings are logged and returned.
pub fn validate_shape_or_raise(spec: &GraphSpec) -> Result<Vec<Diagnostic>, CompilationError> {
    let diagnostics = validate_shape(spec);
    if let Some(first) = diagnostics.iter().find(|d| d.severity == Severity::Error) {
        let mut err = CompilationError::new(CompilePhase::InvalidSpec, first.message.clone());
        if let Some(id) = &first.node_id {
            let ty = spec.node(id).map(|n| n.component_type.clone()).unwrap_or_default();
            err = err.at_node(id.clone(), ty);
        }
        if let Some(fix) = &first.fix {
            err = err.with_suggestion(fix.clone());
        }
        return Err(err);
    }
    for d in &diagnostics {
        tracing::warn!(rule = %d.rule, node = ?d.node_id, "{}", d.message);
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> GraphSpec {
        GraphSpec::from_value(value).unwrap()
    }

    fn errors(spec: &GraphSpec) -> Vec<Diagnostic> {
        validate_shape(spec)
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .collect()
    }

    #[test]
    fn valid_graph_passes() {
        let g = spec(json!({
            "version": "1",
            "nodes": [
                {"id": "fetch", "type": "http-get", "params": {"url": "${inputs.url}"}},
                {"id": "parse-body", "type": "parse", "params": {"body": "${fetch.body}"}}
            ],
            "edges": [{"from": "fetch", "to": "parse-body"}]
        }));
        let diags = validate_shape(&g);
        assert!(diags.is_empty(), "{diags:?}");
        assert!(validate_shape_or_raise(&g).is_ok());
    }

    #[test]
    fn unsupported_version() {
        let g = spec(json!({"version": "2.0", "nodes": [{"id": "a", "type": "x"}]}));
        assert!(errors(&g).iter().any(|d| d.rule == "version"));
    }

    #[test]
    fn empty_graph_is_rejected() {
        let g = spec(json!({"version": "1", "nodes": []}));
        let err = validate_shape_or_raise(&g).unwrap_err();
        assert_eq!(err.phase, CompilePhase::InvalidSpec);
        assert!(err.detail.contains("no nodes"));
    }

    #[test]
    fn duplicate_and_reserved_ids() {
        let g = spec(json!({
            "version": "1",
            "nodes": [
                {"id": "a", "type": "x"},
                {"id": "a", "type": "x"},
                {"id": "inputs", "type": "x"},
                {"id": "9lives", "type": "x"}
            ]
        }));
        let errs = errors(&g);
        assert!(errs.iter().any(|d| d.message.contains("Duplicate node id 'a'")));
        assert!(errs.iter().any(|d| d.message.contains("reserved")));
        assert!(errs.iter().any(|d| d.message.contains("'9lives' is not a valid identifier")));
    }

    #[test]
    fn params_must_be_object() {
        let g = spec(json!({"version": "1", "nodes": [{"id": "a", "type": "x", "params": [1, 2]}]}));
        let err = validate_shape_or_raise(&g).unwrap_err();
        assert_eq!(err.node_id.as_deref(), Some("a"));
        assert_eq!(err.node_type.as_deref(), Some("x"));
    }

    #[test]
    fn batch_configuration_checks() {
        let g = spec(json!({
            "version": "1",
            "nodes": [
                {"id": "scan", "type": "x"},
                {"id": "one", "type": "x", "batch": {"items": "files: ${scan.files}"}},
                {"id": "two", "type": "x", "batch": {"items": "${scan.files}", "as": "scan"}},
                {"id": "three", "type": "x", "batch": {"items": "${scan.files}", "max_concurrency": 0}},
                {"id": "four", "type": "x", "batch": {"items": "${scan.files}", "as": "inputs"}}
            ],
            "edges": [
                {"from": "scan", "to": "one"}, {"from": "one", "to": "two"},
                {"from": "two", "to": "three"}, {"from": "three", "to": "four"}
            ]
        }));
        let errs = errors(&g);
        let at = |id: &str| errs.iter().filter(|d| d.node_id.as_deref() == Some(id)).count();
        assert_eq!(at("scan"), 0);
        assert_eq!(at("one"), 1);
        assert_eq!(at("two"), 1);
        assert_eq!(at("three"), 1);
        assert_eq!(at("four"), 1);
    }

    #[test]
    fn unreachable_node_is_a_warning() {
        let g = spec(json!({
            "version": "1",
            "nodes": [{"id": "a", "type": "x"}, {"id": "orphan", "type": "x"}]
        }));
        let diags = validate_shape_or_raise(&g).unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[0].node_id.as_deref(), Some("orphan"));
    }
}
