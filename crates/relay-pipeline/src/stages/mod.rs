//! The wrapper chain.
//!
//! Every compiled node is a stack of stages sharing one interface. The
//! compiler builds the stack innermost first:
//!
//! ```text
//! Lifecycle <- Template <- Namespace <- Instrument [<- Batch]
//! ```
//!
//! so a step runs outermost first: batch fan-out (if any), then
//! instrumentation, namespace isolation, template resolution and finally
//! the component lifecycle.

mod batch;
mod instrument;
mod lifecycle;
mod namespace;
mod template;

pub use batch::BatchStage;
pub use instrument::InstrumentStage;
pub use lifecycle::LifecycleStage;
pub use namespace::NamespaceStage;
pub use template::TemplateStage;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relay_types::{ExecutionState, NamespacedWrites, Params, Result, TraceRecorder};

use crate::events::EventEmitter;

/// Which wrapper a stage is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Batch,
    Instrument,
    Namespace,
    Template,
    Lifecycle,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayerKind::Batch => "batch",
            LayerKind::Instrument => "instrument",
            LayerKind::Namespace => "namespace",
            LayerKind::Template => "template",
            LayerKind::Lifecycle => "lifecycle",
        })
    }
}

/// Everything a stage may look at while running one step.
///
/// The state is a read-only snapshot; stages never write to it. Outputs
/// travel back up the chain in [`StepResult`] and the engine commits them.
#[derive(Clone)]
pub struct Scope {
    pub node_id: String,
    pub state: Arc<ExecutionState>,
    /// Extra template scopes, e.g. the batch item alias.
    pub bindings: Params,
    /// Merged parameters, set by the template stage for the stages below it.
    pub params: Option<Params>,
    pub trace: TraceRecorder,
    pub events: Option<EventEmitter>,
    pub batch_index: Option<usize>,
}

impl Scope {
    pub fn new(node_id: impl Into<String>, state: Arc<ExecutionState>, trace: TraceRecorder) -> Self {
        Self {
            node_id: node_id.into(),
            state,
            bindings: Params::new(),
            params: None,
            trace,
            events: None,
            batch_index: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventEmitter>) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn with_params(&self, params: Params) -> Self {
        let mut scope = self.clone();
        scope.params = Some(params);
        scope
    }

    pub(crate) fn for_item(&self, alias: &str, item: serde_json::Value, index: usize) -> Self {
        let mut scope = self.clone();
        scope.bindings.insert(alias.to_string(), item);
        scope.batch_index = Some(index);
        scope
    }
}

/// Outputs of a step before or after namespace isolation.
#[derive(Debug, Clone, PartialEq)]
pub enum Writes {
    /// Straight from the component; not yet bound to a node.
    Raw(Params),
    Namespaced(NamespacedWrites),
}

impl Writes {
    pub fn values(&self) -> &Params {
        match self {
            Writes::Raw(p) => p,
            Writes::Namespaced(w) => w.values(),
        }
    }
}

/// What one pass through the chain produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub action: String,
    pub writes: Writes,
    /// Parameters after template resolution and merge.
    pub resolved_params: Params,
    /// `exec` calls made (summed over items for batch nodes).
    pub attempts: u32,
    /// Message of the error that routed this step to the error action.
    pub failure: Option<String>,
}

/// One layer of the wrapper chain.
#[async_trait]
pub trait Stage: Send + Sync {
    fn layer(&self) -> LayerKind;

    /// The wrapped stage; `None` for the innermost one.
    fn inner(&self) -> Option<&dyn Stage>;

    async fn run(&self, scope: &Scope) -> Result<StepResult>;
}

/// Layers of a chain, outermost first.
pub fn layers_of(stage: &dyn Stage) -> Vec<LayerKind> {
    let mut out = vec![stage.layer()];
    let mut current = stage.inner();
    while let Some(s) = current {
        out.push(s.layer());
        current = s.inner();
    }
    out
}
