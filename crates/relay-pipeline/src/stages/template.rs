use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_template::{has_templates, TemplateResolver, WithBindings};
use relay_types::{Params, RelayError, Result};

use super::{LayerKind, Scope, Stage, StepResult};

/// Resolves the node's static params against the current state and hands
/// the merged map to the stage below.
pub struct TemplateStage {
    inner: Arc<dyn Stage>,
    params: Params,
    resolver: TemplateResolver,
}

impl TemplateStage {
    pub fn new(inner: Arc<dyn Stage>, params: Params, resolver: TemplateResolver) -> Self {
        Self {
            inner,
            params,
            resolver,
        }
    }

    /// Static params overwritten by their template-resolved values.
    fn merge(&self, scope: &Scope) -> Result<Params> {
        let scopes = WithBindings {
            bindings: &scope.bindings,
            base: scope.state.as_ref(),
        };
        let mut merged = self.params.clone();
        for (key, value) in &self.params {
            if !contains_template(value) {
                continue;
            }
            let resolved = self
                .resolver
                .resolve_value(value, &scopes)
                .map_err(|source| RelayError::Template {
                    node: scope.node_id.clone(),
                    source,
                })?;
            merged.insert(key.clone(), resolved);
        }
        Ok(merged)
    }
}

fn contains_template(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('$'),
        Value::Array(items) => items.iter().any(contains_template),
        Value::Object(map) => map.values().any(contains_template),
        _ => false,
    }
}

#[async_trait]
impl Stage for TemplateStage {
    fn layer(&self) -> LayerKind {
        LayerKind::Template
    }

    fn inner(&self) -> Option<&dyn Stage> {
        Some(self.inner.as_ref())
    }

    async fn run(&self, scope: &Scope) -> Result<StepResult> {
        let merged = self.merge(scope)?;
        tracing::debug!(
            node = %scope.node_id,
            templated = self.params.values().filter(|v| v.as_str().is_some_and(has_templates)).count(),
            "Parameters resolved"
        );
        let mut result = self.inner.run(&scope.with_params(merged.clone())).await?;
        result.resolved_params = merged;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Writes;
    use relay_template::{TemplateConfig, TemplateMode};
    use relay_types::{ExecutionState, NamespacedWrites, TemplateError, TraceRecorder};
    use serde_json::json;

    /// Echoes the params it receives back as writes.
    struct Echo;

    #[async_trait]
    impl Stage for Echo {
        fn layer(&self) -> LayerKind {
            LayerKind::Lifecycle
        }
        fn inner(&self) -> Option<&dyn Stage> {
            None
        }
        async fn run(&self, scope: &Scope) -> Result<StepResult> {
            let params = scope.params.clone().unwrap_or_default();
            Ok(StepResult {
                action: "default".into(),
                writes: Writes::Raw(params.clone()),
                resolved_params: Params::new(),
                attempts: 1,
                failure: None,
            })
        }
    }

    fn obj(v: Value) -> Params {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn state() -> Arc<ExecutionState> {
        let mut state = ExecutionState::new(obj(json!({"topic": "rust"})));
        state
            .commit(NamespacedWrites::new("fetch", obj(json!({"items": ["x", "y"], "n": 2}))))
            .unwrap();
        Arc::new(state)
    }

    fn stage(params: Value, mode: TemplateMode) -> TemplateStage {
        TemplateStage::new(
            Arc::new(Echo),
            obj(params),
            TemplateResolver::new(TemplateConfig {
                mode,
                ..TemplateConfig::default()
            }),
        )
    }

    #[tokio::test]
    async fn merges_literals_with_resolved_values() {
        let stage = stage(
            json!({
                "items": "${fetch.items}",
                "label": "${inputs.topic} x${fetch.n}",
                "limit": 5,
                "nested": {"first": "${fetch.items[0]}"}
            }),
            TemplateMode::Strict,
        );
        let scope = Scope::new("use", state(), TraceRecorder::new());
        let result = stage.run(&scope).await.unwrap();

        let expected = json!({
            "items": ["x", "y"],
            "label": "rust x2",
            "limit": 5,
            "nested": {"first": "x"}
        });
        assert_eq!(Value::Object(result.writes.values().clone()), expected);
        assert_eq!(Value::Object(result.resolved_params), expected);
    }

    #[tokio::test]
    async fn bindings_are_visible() {
        let stage = stage(json!({"path": "${image.path}"}), TemplateMode::Strict);
        let base = Scope::new("resize", state(), TraceRecorder::new());
        let scope = base.for_item("image", json!({"path": "/a.png"}), 0);
        let result = stage.run(&scope).await.unwrap();
        assert_eq!(result.resolved_params.get("path"), Some(&json!("/a.png")));
    }

    #[tokio::test]
    async fn strict_failure_names_the_node() {
        let stage = stage(json!({"x": "${fetch.missing}"}), TemplateMode::Strict);
        let scope = Scope::new("use", state(), TraceRecorder::new());
        match stage.run(&scope).await.unwrap_err() {
            RelayError::Template { node, source } => {
                assert_eq!(node, "use");
                assert!(matches!(source, TemplateError::Unresolved { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lenient_mode_passes_literal_through() {
        let stage = stage(json!({"x": "${fetch.missing}"}), TemplateMode::Lenient);
        let scope = Scope::new("use", state(), TraceRecorder::new());
        let result = stage.run(&scope).await.unwrap();
        assert_eq!(result.resolved_params.get("x"), Some(&json!("${fetch.missing}")));
    }
}
