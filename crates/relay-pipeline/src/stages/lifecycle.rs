use std::sync::Arc;

use async_trait::async_trait;

use relay_types::{LifecyclePhase, Params, RelayError, Result, ERROR_ACTION};

use super::{LayerKind, Scope, Stage, StepResult, Writes};
use crate::component::Component;
use crate::events::PipelineEvent;
use crate::retry::{execute_with_retry, RetryPolicy};

/// Innermost stage: drives `prep → exec (retried) → fallback → post`.
pub struct LifecycleStage {
    component: Arc<dyn Component>,
    component_type: String,
    retry: RetryPolicy,
}

impl LifecycleStage {
    pub fn new(component: Arc<dyn Component>, component_type: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            component,
            component_type: component_type.into(),
            retry,
        }
    }

    fn phase_error(&self, scope: &Scope, phase: LifecyclePhase, err: RelayError) -> RelayError {
        if err.is_fatal() {
            return err;
        }
        RelayError::Component {
            node: scope.node_id.clone(),
            component: self.component_type.clone(),
            phase,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Stage for LifecycleStage {
    fn layer(&self) -> LayerKind {
        LayerKind::Lifecycle
    }

    fn inner(&self) -> Option<&dyn Stage> {
        None
    }

    async fn run(&self, scope: &Scope) -> Result<StepResult> {
        let params: Params = scope.params.clone().unwrap_or_default();

        let prep = self
            .component
            .prep(&params)
            .await
            .map_err(|e| self.phase_error(scope, LifecyclePhase::Prep, e))?;

        let component = &self.component;
        let prep_ref = &prep;
        let attempted = execute_with_retry(
            move || component.exec(prep_ref),
            &self.retry,
            &scope.node_id,
            |attempt, delay, err| {
                if let Some(events) = &scope.events {
                    events.emit(PipelineEvent::StepRetrying {
                        node_id: scope.node_id.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: err.to_string(),
                    });
                }
            },
        )
        .await;
        let attempts = attempted.attempts;

        let exec = match attempted.result {
            Ok(value) => value,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                let exhausted = RelayError::ComponentFailure {
                    node: scope.node_id.clone(),
                    attempts,
                    message: err.to_string(),
                };
                tracing::warn!(node = %scope.node_id, attempts, error = %err, "Execute failed, trying fallback");
                match self.component.exec_fallback(&prep, err).await {
                    Ok(value) => value,
                    Err(fallback_err) if fallback_err.is_fatal() => return Err(fallback_err),
                    Err(fallback_err) => {
                        let message = fallback_err.to_string();
                        tracing::warn!(node = %scope.node_id, %exhausted, "Routing to error action");
                        let mut writes = Params::new();
                        writes.insert("error".into(), serde_json::Value::String(message.clone()));
                        return Ok(StepResult {
                            action: ERROR_ACTION.to_string(),
                            writes: Writes::Raw(writes),
                            resolved_params: params,
                            attempts,
                            failure: Some(message),
                        });
                    }
                }
            }
        };

        let completion = self
            .component
            .post(&params, &prep, exec)
            .await
            .map_err(|e| self.phase_error(scope, LifecyclePhase::Post, e))?;

        Ok(StepResult {
            action: completion.action,
            writes: Writes::Raw(completion.writes),
            resolved_params: params,
            attempts,
            failure: None,
        })
    }
}
