use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use relay_types::{Params, Result, TraceRecord};

use super::{LayerKind, Scope, Stage, StepResult};

/// Appends one [`TraceRecord`] per pass (per item inside a batch). Results
/// and errors pass through untouched.
pub struct InstrumentStage {
    inner: Arc<dyn Stage>,
    component_type: String,
}

impl InstrumentStage {
    pub fn new(inner: Arc<dyn Stage>, component_type: impl Into<String>) -> Self {
        Self {
            inner,
            component_type: component_type.into(),
        }
    }
}

#[async_trait]
impl Stage for InstrumentStage {
    fn layer(&self) -> LayerKind {
        LayerKind::Instrument
    }

    fn inner(&self) -> Option<&dyn Stage> {
        Some(self.inner.as_ref())
    }

    async fn run(&self, scope: &Scope) -> Result<StepResult> {
        let start_time = chrono::Utc::now();
        let started = Instant::now();
        let outcome = self.inner.run(scope).await;
        let end_time = chrono::Utc::now();

        let mut record = TraceRecord {
            node_id: scope.node_id.clone(),
            component_type: self.component_type.clone(),
            start_time,
            end_time,
            duration_ms: started.elapsed().as_millis() as u64,
            resolved_params: Params::new(),
            emitted_action: None,
            error: None,
            attempts: 0,
            batch_index: scope.batch_index,
        };
        match &outcome {
            Ok(result) => {
                record.resolved_params = result.resolved_params.clone();
                record.emitted_action = Some(result.action.clone());
                record.error = result.failure.clone();
                record.attempts = result.attempts;
            }
            Err(e) => {
                record.resolved_params = scope.params.clone().unwrap_or_default();
                record.error = Some(e.to_string());
            }
        }
        scope.trace.record(record).await;
        outcome
    }
}
