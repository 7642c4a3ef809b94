//! Graph compiler, wrapper chain, and action-routed execution engine.
//!
//! This crate turns a validated [`relay_ir::GraphSpec`] into a
//! [`CompiledGraph`] of wrapped components and runs it: template resolution,
//! namespace isolation, instrumentation, optional batch fan-out, retries with
//! backoff, and action-based routing until the graph halts.

pub mod cache;
pub mod compiler;
pub mod component;
pub mod config;
pub mod engine;
pub mod events;
pub mod retry;
pub mod stages;

pub use cache::{CacheStats, CompileCache};
pub use compiler::{
    CacheKey, CompiledGraph, CompiledNode, Compiler, GraphStructure, NodeStructure, TransitionStructure,
};
pub use component::{Component, ComponentFactory, FallibleFactory, Implementation, ImplementationTable};
pub use config::{BatchConfig, CompileOptions, EngineConfig};
pub use engine::{ExecutionResult, Executor, RunFailure, RunStatus};
pub use events::{EventEmitter, PipelineEvent};
pub use retry::{execute_with_retry, Attempted, BackoffPolicy, RetryPolicy};
pub use stages::{layers_of, LayerKind, Scope, Stage, StepResult, Writes};
