//! Shared types, errors, execution state, and trace records for the Relay runtime.
//!
//! This crate provides the foundational types used across all other Relay crates:
//! - `RelayError` — unified error taxonomy (compile, template, component, engine)
//! - `ExecutionState` — per-run, per-node namespaced state
//! - `InterfaceField` — recursive interface schema used for path validation
//! - `Completion` — action and writes emitted by a component's finalize phase
//! - `Trace` / `TraceRecord` — append-only step log consumed by debug tooling

mod schema;
mod state;
mod trace;

pub use schema::{element_type, type_shape, InterfaceField, TypeShape};
pub use state::{ExecutionState, NamespacedWrites, INPUTS_NAMESPACE};
pub use trace::{Trace, TraceRecord, TraceRecorder};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Parameter map handed to a component after template resolution and merge.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Action emitted when a component finishes without choosing a route.
pub const DEFAULT_ACTION: &str = "default";

/// Action emitted when a component's execute phase exhausts its retries.
pub const ERROR_ACTION: &str = "error";

// ---------------------------------------------------------------------------
// Compilation errors
// ---------------------------------------------------------------------------

/// The compiler phase that rejected a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilePhase {
    InvalidSpec,
    UnknownType,
    ResolutionFailure,
    CapabilityMismatch,
    Instantiation,
    UnresolvedStaticTemplate,
    AmbiguousTransition,
    DanglingReference,
}

impl CompilePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompilePhase::InvalidSpec => "invalid_spec",
            CompilePhase::UnknownType => "unknown_type",
            CompilePhase::ResolutionFailure => "resolution_failure",
            CompilePhase::CapabilityMismatch => "capability_mismatch",
            CompilePhase::Instantiation => "instantiation",
            CompilePhase::UnresolvedStaticTemplate => "unresolved_static_template",
            CompilePhase::AmbiguousTransition => "ambiguous_transition",
            CompilePhase::DanglingReference => "dangling_reference",
        }
    }
}

impl fmt::Display for CompilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A graph rejected before execution, with enough context to fix the spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationError {
    pub phase: CompilePhase,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub detail: String,
    pub suggestion: Option<String>,
}

impl CompilationError {
    pub fn new(phase: CompilePhase, detail: impl Into<String>) -> Self {
        Self {
            phase,
            node_id: None,
            node_type: None,
            detail: detail.into(),
            suggestion: None,
        }
    }

    /// Attach the offending node.
    pub fn at_node(mut self, node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compilation failed [{}]", self.phase)?;
        match (&self.node_id, &self.node_type) {
            (Some(id), Some(ty)) => write!(f, " at node '{id}' (type '{ty}')")?,
            (Some(id), None) => write!(f, " at node '{id}'")?,
            _ => {}
        }
        write!(f, ": {}", self.detail)?;
        if let Some(ref s) = self.suggestion {
            write!(f, ". Suggestion: {s}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompilationError {}

// ---------------------------------------------------------------------------
// Template errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("Template '{template}' could not be resolved: {reason}")]
    Unresolved { template: String, reason: String },

    #[error("Invalid template path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Template '{template}' resolved to {size} bytes, exceeding the {limit}-byte limit")]
    ValueTooLarge {
        template: String,
        size: usize,
        limit: usize,
    },

    #[error("Batch items '{template}' resolved to {found}, expected a list")]
    NotAList { template: String, found: String },
}

// ---------------------------------------------------------------------------
// Lifecycle phase
// ---------------------------------------------------------------------------

/// One of the three phases of the component lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Prep,
    Exec,
    Post,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecyclePhase::Prep => "prep",
            LifecyclePhase::Exec => "exec",
            LifecyclePhase::Post => "post",
        })
    }
}

// ---------------------------------------------------------------------------
// RelayError
// ---------------------------------------------------------------------------

/// Unified error type for all Relay subsystems.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    // === Compile time ===
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error("Component type '{type_name}' is not registered")]
    NotFound { type_name: String },

    #[error("Registry error: {0}")]
    Registry(String),

    // === Run time: inputs and templates ===
    #[error("Required workflow input '{name}' was not provided")]
    MissingInput { name: String },

    #[error("Template resolution failed on node '{node}': {source}")]
    Template {
        node: String,
        #[source]
        source: TemplateError,
    },

    // === Run time: components ===
    #[error("Component '{component}' failed on node '{node}' during {phase}: {message}")]
    Component {
        node: String,
        component: String,
        phase: LifecyclePhase,
        message: String,
    },

    #[error("Max attempts exhausted for node '{node}' after {attempts} attempts: {message}")]
    ComponentFailure {
        node: String,
        attempts: u32,
        message: String,
    },

    /// Raised by a component to stop retrying immediately.
    #[error("{0}")]
    Permanent(String),

    // === Engine invariants ===
    #[error("Step limit of {max_steps} exceeded at node '{node}'")]
    StepLimitExceeded { max_steps: usize, node: String },

    #[error("Malformed compiled graph: {0}")]
    MalformedGraph(String),

    #[error("Node '{owner}' attempted to write outside its namespace")]
    NamespaceViolation { owner: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Returns `true` if an execute attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RelayError::Permanent(_)
                | RelayError::Compilation(_)
                | RelayError::StepLimitExceeded { .. }
                | RelayError::MalformedGraph(_)
                | RelayError::NamespaceViolation { .. }
        )
    }

    /// Returns `true` for engine-internal invariant violations that abort a run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::StepLimitExceeded { .. }
                | RelayError::MalformedGraph(_)
                | RelayError::NamespaceViolation { .. }
        )
    }
}

/// A convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;

// ---------------------------------------------------------------------------
// Completion — result of a component's finalize phase
// ---------------------------------------------------------------------------

/// The action a component emits and the outputs it wants stored under its
/// own namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub action: String,
    pub writes: Params,
}

impl Completion {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            writes: Params::new(),
        }
    }

    /// A `default` completion carrying the given writes.
    pub fn with_writes(writes: Params) -> Self {
        Self {
            action: DEFAULT_ACTION.to_string(),
            writes,
        }
    }

    pub fn write(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.writes.insert(key.into(), value);
        self
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION)
    }
}
