use std::sync::Arc;

use async_trait::async_trait;

use relay_types::{NamespacedWrites, RelayError, Result};

use super::{LayerKind, Scope, Stage, StepResult, Writes};

/// Binds a step's raw outputs to the node that produced them.
pub struct NamespaceStage {
    inner: Arc<dyn Stage>,
}

impl NamespaceStage {
    pub fn new(inner: Arc<dyn Stage>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Stage for NamespaceStage {
    fn layer(&self) -> LayerKind {
        LayerKind::Namespace
    }

    fn inner(&self) -> Option<&dyn Stage> {
        Some(self.inner.as_ref())
    }

    async fn run(&self, scope: &Scope) -> Result<StepResult> {
        let mut result = self.inner.run(scope).await?;
        result.writes = match result.writes {
            Writes::Raw(values) => Writes::Namespaced(NamespacedWrites::new(scope.node_id.clone(), values)),
            Writes::Namespaced(w) if w.owner() == scope.node_id => Writes::Namespaced(w),
            Writes::Namespaced(w) => {
                return Err(RelayError::NamespaceViolation {
                    owner: w.owner().to_string(),
                })
            }
        };
        Ok(result)
    }
}
