use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use relay_ir::FailurePolicy;
use relay_template::{json_type_name, TemplateResolver, WithBindings};
use relay_types::{
    NamespacedWrites, Params, RelayError, Result, TemplateError, DEFAULT_ACTION, ERROR_ACTION,
};

use super::{LayerKind, Scope, Stage, StepResult, Writes};
use crate::events::PipelineEvent;

/// Fans a node out over a list, one pass of the inner chain per item.
///
/// Items see the list element under `alias`. Outputs are merged back
/// positionally into `{results, count, errors}` under the node's namespace.
pub struct BatchStage {
    inner: Arc<dyn Stage>,
    items: String,
    alias: String,
    parallel: bool,
    max_concurrency: usize,
    failure_policy: FailurePolicy,
    resolver: TemplateResolver,
}

type ItemOutcome = Result<StepResult>;

fn is_failure(outcome: &ItemOutcome) -> bool {
    match outcome {
        Ok(r) => r.action == ERROR_ACTION,
        Err(_) => true,
    }
}

impl BatchStage {
    pub fn new(
        inner: Arc<dyn Stage>,
        items: impl Into<String>,
        alias: impl Into<String>,
        resolver: TemplateResolver,
    ) -> Self {
        Self {
            inner,
            items: items.into(),
            alias: alias.into(),
            parallel: false,
            max_concurrency: 1,
            failure_policy: FailurePolicy::FailFast,
            resolver,
        }
    }

    /// Run up to `max_concurrency` items at once.
    pub fn parallel(mut self, max_concurrency: usize) -> Self {
        self.parallel = true;
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    fn resolve_items(&self, scope: &Scope) -> Result<Vec<Value>> {
        let scopes = WithBindings {
            bindings: &scope.bindings,
            base: scope.state.as_ref(),
        };
        let template_error = |source| RelayError::Template {
            node: scope.node_id.clone(),
            source,
        };
        match self.resolver.resolve_str(&self.items, &scopes).map_err(template_error)? {
            Value::Array(items) => Ok(items),
            other => Err(template_error(TemplateError::NotAList {
                template: self.items.clone(),
                found: json_type_name(&other).to_string(),
            })),
        }
    }

    fn should_stop(&self, outcome: &ItemOutcome) -> bool {
        match outcome {
            Err(e) if e.is_fatal() => true,
            other => self.failure_policy == FailurePolicy::FailFast && is_failure(other),
        }
    }

    fn progress(&self, scope: &Scope, outcomes: &[Option<ItemOutcome>]) {
        let Some(events) = &scope.events else { return };
        let completed = outcomes.iter().filter(|o| o.is_some()).count();
        let failed = outcomes
            .iter()
            .filter(|o| o.as_ref().is_some_and(is_failure))
            .count();
        events.emit(PipelineEvent::BatchProgress {
            node_id: scope.node_id.clone(),
            completed,
            failed,
            total: outcomes.len(),
        });
    }

    async fn run_sequential(&self, scope: &Scope, items: Vec<Value>) -> Vec<Option<ItemOutcome>> {
        let mut outcomes: Vec<Option<ItemOutcome>> = (0..items.len()).map(|_| None).collect();
        for (index, item) in items.into_iter().enumerate() {
            let outcome = self.inner.run(&scope.for_item(&self.alias, item, index)).await;
            let stop = self.should_stop(&outcome);
            outcomes[index] = Some(outcome);
            self.progress(scope, &outcomes);
            if stop {
                tracing::warn!(node = %scope.node_id, index, "Batch item failed; not scheduling the rest");
                break;
            }
        }
        outcomes
    }

    async fn run_parallel(&self, scope: &Scope, items: Vec<Value>) -> Result<Vec<Option<ItemOutcome>>> {
        let mut outcomes: Vec<Option<ItemOutcome>> = (0..items.len()).map(|_| None).collect();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let cancelled = Arc::new(AtomicBool::new(false));
        let fail_fast = self.failure_policy == FailurePolicy::FailFast;
        let mut tasks = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| RelayError::Other(format!("batch pool closed: {e}")))?;
            if cancelled.load(Ordering::SeqCst) {
                break;
            }

            let inner = self.inner.clone();
            let item_scope = scope.for_item(&self.alias, item, index);
            let cancelled = cancelled.clone();
            tasks.spawn(async move {
                let outcome = inner.run(&item_scope).await;
                let fatal = matches!(&outcome, Err(e) if e.is_fatal());
                if fatal || (fail_fast && is_failure(&outcome)) {
                    cancelled.store(true, Ordering::SeqCst);
                }
                drop(permit);
                (index, outcome)
            });
        }

        if cancelled.load(Ordering::SeqCst) {
            tracing::warn!(node = %scope.node_id, "Batch item failed; not scheduling the rest");
        }
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) =
                joined.map_err(|e| RelayError::Other(format!("batch worker panicked: {e}")))?;
            outcomes[index] = Some(outcome);
            self.progress(scope, &outcomes);
        }
        Ok(outcomes)
    }

    /// Merge item outcomes in input order.
    fn assemble(&self, scope: &Scope, items: Vec<Value>, outcomes: Vec<Option<ItemOutcome>>) -> Result<StepResult> {
        let count = outcomes.len();
        let mut results = Vec::with_capacity(count);
        let mut errors = Vec::new();
        let mut attempts = 0;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                None => results.push(Value::Null),
                Some(Ok(step)) if step.action != ERROR_ACTION => {
                    attempts += step.attempts;
                    results.push(Value::Object(step.writes.values().clone()));
                }
                Some(Ok(step)) => {
                    attempts += step.attempts;
                    let message = step
                        .failure
                        .unwrap_or_else(|| format!("item {index} emitted '{ERROR_ACTION}'"));
                    errors.push(json!({"index": index, "error": message}));
                    results.push(Value::Null);
                }
                Some(Err(e)) if e.is_fatal() => return Err(e),
                Some(Err(e)) => {
                    errors.push(json!({"index": index, "error": e.to_string()}));
                    results.push(Value::Null);
                }
            }
        }

        let skipped = results.iter().filter(|r| r.is_null()).count() - errors.len();
        let failed = !errors.is_empty() && self.failure_policy == FailurePolicy::FailFast;
        let failure = failed
            .then(|| errors[0]["error"].as_str().unwrap_or_default().to_string());

        tracing::info!(
            node = %scope.node_id,
            count,
            errors = errors.len(),
            skipped,
            "Batch finished"
        );

        let mut writes = Params::new();
        writes.insert("results".into(), Value::Array(results));
        writes.insert("count".into(), json!(count));
        writes.insert("errors".into(), Value::Array(errors));
        if let Some(message) = &failure {
            writes.insert("error".into(), Value::String(message.clone()));
        }

        let mut resolved_params = Params::new();
        resolved_params.insert("items".into(), Value::Array(items));

        Ok(StepResult {
            action: if failed { ERROR_ACTION } else { DEFAULT_ACTION }.to_string(),
            writes: Writes::Namespaced(NamespacedWrites::new(scope.node_id.clone(), writes)),
            resolved_params,
            attempts,
            failure,
        })
    }
}

#[async_trait]
impl Stage for BatchStage {
    fn layer(&self) -> LayerKind {
        LayerKind::Batch
    }

    fn inner(&self) -> Option<&dyn Stage> {
        Some(self.inner.as_ref())
    }

    async fn run(&self, scope: &Scope) -> Result<StepResult> {
        let items = self.resolve_items(scope)?;
        tracing::info!(
            node = %scope.node_id,
            items = items.len(),
            parallel = self.parallel,
            max_concurrency = self.max_concurrency,
            policy = ?self.failure_policy,
            "Batch started"
        );

        let outcomes = if self.parallel {
            self.run_parallel(scope, items.clone()).await?
        } else {
            self.run_sequential(scope, items.clone()).await
        };
        self.assemble(scope, items, outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_template::TemplateConfig;
    use relay_types::{ExecutionState, TraceRecorder};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Doubles `item`; fails (error action) on the configured values.
    struct Double {
        fail_on: Vec<i64>,
        hard_fail_on: Vec<i64>,
        fatal_on: Vec<i64>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Double {
        fn new() -> Self {
            Self {
                fail_on: vec![],
                hard_fail_on: vec![],
                fatal_on: vec![],
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Stage for Double {
        fn layer(&self) -> LayerKind {
            LayerKind::Instrument
        }
        fn inner(&self) -> Option<&dyn Stage> {
            None
        }
        async fn run(&self, scope: &Scope) -> Result<StepResult> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let n = scope.bindings["item"].as_i64().unwrap_or_default();
            if self.fatal_on.contains(&n) {
                return Err(RelayError::NamespaceViolation {
                    owner: "elsewhere".into(),
                });
            }
            if self.hard_fail_on.contains(&n) {
                return Err(RelayError::Template {
                    node: scope.node_id.clone(),
                    source: TemplateError::Unresolved {
                        template: "${x}".into(),
                        reason: "boom".into(),
                    },
                });
            }
            let mut values = Params::new();
            let action = if self.fail_on.contains(&n) {
                values.insert("error".into(), json!(format!("bad {n}")));
                ERROR_ACTION
            } else {
                values.insert("doubled".into(), json!(n * 2));
                DEFAULT_ACTION
            };
            Ok(StepResult {
                action: action.into(),
                failure: (action == ERROR_ACTION).then(|| format!("bad {n}")),
                writes: Writes::Namespaced(NamespacedWrites::new(scope.node_id.clone(), values)),
                resolved_params: Params::new(),
                attempts: 1,
            })
        }
    }

    fn scope_with(items: Value) -> Scope {
        let mut state = ExecutionState::default();
        let mut values = Params::new();
        values.insert("items".into(), items);
        state.commit(NamespacedWrites::new("src", values)).unwrap();
        Scope::new("double", Arc::new(state), TraceRecorder::new())
    }

    fn batch(inner: Double) -> BatchStage {
        BatchStage::new(
            Arc::new(inner),
            "${src.items}",
            "item",
            TemplateResolver::new(TemplateConfig::default()),
        )
    }

    #[tokio::test]
    async fn merges_results_positionally() {
        let stage = batch(Double::new()).parallel(3);
        let result = stage.run(&scope_with(json!([1, 2, 3, 4]))).await.unwrap();
        assert_eq!(result.action, DEFAULT_ACTION);
        let values = result.writes.values();
        assert_eq!(
            values["results"],
            json!([{"doubled": 2}, {"doubled": 4}, {"doubled": 6}, {"doubled": 8}])
        );
        assert_eq!(values["count"], json!(4));
        assert_eq!(values["errors"], json!([]));
        assert_eq!(result.attempts, 4);
        assert!(matches!(&result.writes, Writes::Namespaced(w) if w.owner() == "double"));
    }

    #[tokio::test]
    async fn empty_list_completes_with_default() {
        let result = batch(Double::new()).run(&scope_with(json!([]))).await.unwrap();
        assert_eq!(result.action, DEFAULT_ACTION);
        assert_eq!(result.writes.values()["count"], json!(0));
    }

    #[tokio::test]
    async fn non_list_items_are_rejected() {
        let err = batch(Double::new()).run(&scope_with(json!("nope"))).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Template { source: TemplateError::NotAList { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn fail_fast_stops_scheduling_sequentially() {
        let mut inner = Double::new();
        inner.fail_on = vec![2];
        let result = batch(inner).run(&scope_with(json!([1, 2, 3]))).await.unwrap();
        assert_eq!(result.action, ERROR_ACTION);
        let values = result.writes.values();
        assert_eq!(values["results"], json!([{"doubled": 2}, null, null]));
        assert_eq!(values["errors"], json!([{"index": 1, "error": "bad 2"}]));
        assert_eq!(values["error"], json!("bad 2"));
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn collect_all_runs_every_item() {
        let mut inner = Double::new();
        inner.fail_on = vec![2];
        inner.hard_fail_on = vec![3];
        let stage = batch(inner)
            .parallel(2)
            .failure_policy(FailurePolicy::CollectAll);
        let result = stage.run(&scope_with(json!([1, 2, 3, 4]))).await.unwrap();
        assert_eq!(result.action, DEFAULT_ACTION);
        let values = result.writes.values();
        assert_eq!(values["results"], json!([{"doubled": 2}, null, null, {"doubled": 8}]));
        let errors = values["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["index"], json!(1));
        assert_eq!(errors[1]["index"], json!(2));
        assert!(values.get("error").is_none());
    }

    #[tokio::test]
    async fn fail_fast_turns_item_errors_into_the_error_action() {
        let mut inner = Double::new();
        inner.hard_fail_on = vec![2];
        let result = batch(inner).run(&scope_with(json!([1, 2, 3]))).await.unwrap();
        assert_eq!(result.action, ERROR_ACTION);
        let values = result.writes.values();
        assert_eq!(values["results"], json!([{"doubled": 2}, null, null]));
        let errors = values["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["index"], json!(1));
        let message = values["error"].as_str().unwrap();
        assert!(message.contains("boom"), "{message}");
        assert_eq!(result.failure.as_deref(), Some(message));
    }

    #[tokio::test]
    async fn parallel_fail_fast_reports_item_errors() {
        let mut inner = Double::new();
        inner.hard_fail_on = vec![1];
        let result = batch(inner).parallel(4).run(&scope_with(json!([1, 2]))).await.unwrap();
        assert_eq!(result.action, ERROR_ACTION);
        assert_eq!(result.writes.values()["errors"][0]["index"], json!(0));
    }

    #[tokio::test]
    async fn fatal_item_errors_abort_the_batch() {
        let mut inner = Double::new();
        inner.fatal_on = vec![2];
        let err = batch(inner)
            .failure_policy(FailurePolicy::CollectAll)
            .run(&scope_with(json!([1, 2, 3])))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NamespaceViolation { .. }));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let mut inner = Double::new();
        inner.delay = Duration::from_millis(20);
        let peak = inner.peak.clone();
        let stage = batch(inner).parallel(2);
        let result = stage
            .run(&scope_with(json!([1, 2, 3, 4, 5, 6])))
            .await
            .unwrap();
        assert_eq!(result.writes.values()["count"], json!(6));
        let observed = peak.load(Ordering::SeqCst);
        assert!(observed <= 2, "peak concurrency {observed}");
        assert!(observed >= 1);
    }

    #[tokio::test]
    async fn sequential_runs_one_at_a_time() {
        let mut inner = Double::new();
        inner.delay = Duration::from_millis(5);
        let peak = inner.peak.clone();
        batch(inner).run(&scope_with(json!([1, 2, 3]))).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
