//! Execution engine: walks a [`CompiledGraph`] one step at a time.
//!
//! Each step runs the node's wrapper chain against a snapshot of the state,
//! commits the namespaced writes it returns, then follows the transition for
//! the emitted action. A node with no transition for its action halts the
//! run.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_types::{ExecutionState, Params, RelayError, Result, Trace, TraceRecorder, ERROR_ACTION};

use crate::compiler::CompiledGraph;
use crate::config::EngineConfig;
use crate::events::{EventEmitter, PipelineEvent};
use crate::stages::{Scope, Writes};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Halted on a non-error action with no outgoing transition.
    Completed,
    /// Halted because the last node emitted `error` and nothing handles it.
    HaltedOnError,
}

/// The outcome of a run that reached a halt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Node ids in the order they ran.
    pub path: Vec<String>,
    pub last_action: String,
    pub state: ExecutionState,
    pub trace: Trace,
}

impl ExecutionResult {
    /// Outputs written by `node_id`, if it ran.
    pub fn output(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.state.namespace(node_id)
    }
}

/// A run that stopped on an error before reaching a halt, with everything it
/// produced up to that point. The failing step's trace record, if the step
/// started, is the last entry of `trace`.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub error: RelayError,
    /// Nodes that completed before the failure.
    pub path: Vec<String>,
    pub trace: Trace,
}

impl From<RunFailure> for RelayError {
    fn from(failure: RunFailure) -> Self {
        failure.error
    }
}

/// Drives compiled graphs. One executor can run any number of graphs,
/// concurrently or not; every run owns its own state.
#[derive(Clone, Default)]
pub struct Executor {
    config: EngineConfig,
    events: Option<EventEmitter>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

impl Executor {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, events: None }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Run `graph` to a halt with the given workflow inputs.
    pub async fn run(
        &self,
        graph: &CompiledGraph,
        inputs: Params,
    ) -> std::result::Result<ExecutionResult, RunFailure> {
        let run_id = Uuid::new_v4();
        let trace = TraceRecorder::new();
        let mut path = Vec::new();
        match self.walk(graph, inputs, run_id, &trace, &mut path).await {
            Ok(result) => Ok(result),
            Err(error) => {
                let records = trace.snapshot().await;
                tracing::error!(run_id = %run_id, error = %error, steps = records.len(), "Run failed");
                self.emit(PipelineEvent::RunFailed {
                    run_id: run_id.to_string(),
                    error: error.to_string(),
                });
                Err(RunFailure {
                    run_id,
                    error,
                    path,
                    trace: Trace { run_id, records },
                })
            }
        }
    }

    async fn walk(
        &self,
        graph: &CompiledGraph,
        inputs: Params,
        run_id: Uuid,
        trace: &TraceRecorder,
        path: &mut Vec<String>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let inputs = graph
            .source()
            .apply_input_defaults(inputs)
            .map_err(|name| RelayError::MissingInput { name })?;

        let mut state = Arc::new(ExecutionState::new(inputs));
        let mut current = graph.entry.clone();
        let mut steps = 0usize;

        tracing::info!(run_id = %run_id, entry = %current, nodes = graph.nodes.len(), "Run started");
        self.emit(PipelineEvent::RunStarted {
            run_id: run_id.to_string(),
            entry_node: current.clone(),
            node_count: graph.nodes.len(),
        });

        let (status, last_action) = loop {
            if steps >= self.config.max_steps {
                return Err(RelayError::StepLimitExceeded {
                    max_steps: self.config.max_steps,
                    node: current,
                });
            }
            steps += 1;

            let node = graph.node(&current).ok_or_else(|| {
                RelayError::MalformedGraph(format!("transition target '{current}' has no compiled node"))
            })?;
            self.emit(PipelineEvent::StepStarted {
                node_id: node.id.clone(),
                component_type: node.component_type.clone(),
            });
            let step_started = Instant::now();

            let scope = Scope::new(&node.id, state.clone(), trace.clone()).with_events(self.events.clone());
            let outcome = node.chain().run(&scope).await;
            drop(scope);
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    self.emit(PipelineEvent::StepFailed {
                        node_id: node.id.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };

            // Only namespaced writes owned by the running node reach the state.
            let writes = match result.writes {
                Writes::Namespaced(w) if w.owner() == node.id => w,
                Writes::Namespaced(w) => {
                    return Err(RelayError::NamespaceViolation {
                        owner: w.owner().to_string(),
                    })
                }
                Writes::Raw(_) => {
                    return Err(RelayError::MalformedGraph(format!(
                        "node '{}' returned writes that were never bound to a namespace",
                        node.id
                    )))
                }
            };
            Arc::make_mut(&mut state).commit(writes)?;
            path.push(node.id.clone());

            let duration_ms = step_started.elapsed().as_millis() as u64;
            tracing::info!(
                node = %node.id,
                action = %result.action,
                attempts = result.attempts,
                duration_ms,
                "Step completed"
            );
            self.emit(PipelineEvent::StepCompleted {
                node_id: node.id.clone(),
                action: result.action.clone(),
                attempts: result.attempts,
                duration_ms,
            });

            match graph.transition(&node.id, &result.action) {
                Some(next) => {
                    tracing::debug!(from = %node.id, action = %result.action, to = %next, "Transition");
                    self.emit(PipelineEvent::TransitionTaken {
                        from_node: node.id.clone(),
                        action: result.action.clone(),
                        to_node: next.to_string(),
                    });
                    current = next.to_string();
                }
                None if result.action == ERROR_ACTION => break (RunStatus::HaltedOnError, result.action),
                None => break (RunStatus::Completed, result.action),
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match status {
            RunStatus::Completed => {
                tracing::info!(run_id = %run_id, steps = path.len(), duration_ms, "Run completed");
                self.emit(PipelineEvent::RunCompleted {
                    run_id: run_id.to_string(),
                    path: path.clone(),
                    duration_ms,
                });
            }
            RunStatus::HaltedOnError => {
                let node_id = path.last().cloned().unwrap_or_default();
                tracing::warn!(run_id = %run_id, node = %node_id, "Run halted on unhandled error action");
                self.emit(PipelineEvent::RunHalted {
                    run_id: run_id.to_string(),
                    node_id,
                    action: last_action.clone(),
                });
            }
        }

        let state = Arc::try_unwrap(state).unwrap_or_else(|shared| (*shared).clone());
        Ok(ExecutionResult {
            run_id,
            status,
            path: std::mem::take(path),
            last_action,
            state,
            trace: Trace {
                run_id,
                records: trace.snapshot().await,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
