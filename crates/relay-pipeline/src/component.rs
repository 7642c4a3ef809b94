//! Component lifecycle trait, factories, and the implementation table the
//! compiler resolves location descriptors against.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_types::{Completion, Params, RelayError, Result};

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A reusable processing unit.
///
/// The engine calls `prep` once, `exec` up to the retry policy's attempt
/// count, `exec_fallback` if every attempt failed, then `post`. A component
/// only ever sees its merged parameter map, never the execution state.
#[async_trait]
pub trait Component: Send + Sync {
    /// Turn parameters into the input of `exec`.
    async fn prep(&self, params: &Params) -> Result<Value> {
        Ok(Value::Object(params.clone()))
    }

    /// The retried unit of work.
    async fn exec(&self, prep: &Value) -> Result<Value>;

    /// Called once `exec` has exhausted its attempts. Returning `Ok` recovers
    /// the step; returning `Err` routes it to the `error` action.
    async fn exec_fallback(&self, _prep: &Value, error: RelayError) -> Result<Value> {
        Err(error)
    }

    /// Choose the action and the outputs to store. By default an object
    /// result is written key by key and anything else under `result`.
    async fn post(&self, _params: &Params, _prep: &Value, exec: Value) -> Result<Completion> {
        Ok(match exec {
            Value::Object(map) => Completion::with_writes(map),
            other => Completion::default().write("result", other),
        })
    }

    /// Retry policy declared by the implementation, used when the interface
    /// doc block has no `Retry:` line.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Creates one component instance per compiled node.
pub trait ComponentFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Component>>;
}

impl<F, C> ComponentFactory for F
where
    F: Fn() -> C + Send + Sync,
    C: Component + 'static,
{
    fn create(&self) -> Result<Arc<dyn Component>> {
        Ok(Arc::new(self()))
    }
}

/// Factory whose constructor can fail (missing configuration and the like).
pub struct FallibleFactory<F>(pub F);

impl<F, C> ComponentFactory for FallibleFactory<F>
where
    F: Fn() -> Result<C> + Send + Sync,
    C: Component + 'static,
{
    fn create(&self) -> Result<Arc<dyn Component>> {
        let component = (self.0)()?;
        Ok(Arc::new(component))
    }
}

// ---------------------------------------------------------------------------
// ImplementationTable
// ---------------------------------------------------------------------------

/// What a location descriptor points at.
#[derive(Clone)]
pub enum Implementation {
    /// Something exposing the component lifecycle.
    Component(Arc<dyn ComponentFactory>),
    /// Registered code that does not expose the lifecycle (a plain function,
    /// a foreign handler). Compiling a node against it is a capability
    /// mismatch.
    Opaque { kind: String },
}

impl std::fmt::Debug for Implementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Implementation::Component(_) => f.write_str("Component(..)"),
            Implementation::Opaque { kind } => write!(f, "Opaque({kind})"),
        }
    }
}

/// Compile-time table from location descriptor to implementation.
///
/// Every table carries a generation that changes on each registration, so
/// two tables binding the same descriptor to different factories never share
/// a compile cache entry. Clones keep the generation until they diverge.
#[derive(Clone, Debug)]
pub struct ImplementationTable {
    entries: HashMap<String, Implementation>,
    generation: u64,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

impl Default for ImplementationTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            generation: next_generation(),
        }
    }
}

/// `<module path>::<Type>` for a type defined in the calling module, the
/// same descriptor a registry scan produces for it.
#[macro_export]
macro_rules! descriptor {
    ($ty:ident) => {
        concat!(module_path!(), "::", stringify!($ty))
    };
}

impl ImplementationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: impl Into<String>, factory: impl ComponentFactory + 'static) {
        self.entries
            .insert(descriptor.into(), Implementation::Component(Arc::new(factory)));
        self.generation = next_generation();
    }

    pub fn register_opaque(&mut self, descriptor: impl Into<String>, kind: impl Into<String>) {
        self.entries
            .insert(descriptor.into(), Implementation::Opaque { kind: kind.into() });
        self.generation = next_generation();
    }

    pub fn with(mut self, descriptor: impl Into<String>, factory: impl ComponentFactory + 'static) -> Self {
        self.register(descriptor, factory);
        self
    }

    pub fn get(&self, descriptor: &str) -> Option<&Implementation> {
        self.entries.get(descriptor)
    }

    /// Identity of this exact set of bindings within the process.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bound descriptors in sorted order, each with what it is bound to.
    pub fn bindings(&self) -> BTreeMap<&str, &'static str> {
        self.entries
            .iter()
            .map(|(descriptor, implementation)| {
                let kind = match implementation {
                    Implementation::Component(_) => "component",
                    Implementation::Opaque { .. } => "opaque",
                };
                (descriptor.as_str(), kind)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
