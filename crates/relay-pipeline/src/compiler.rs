//! Graph compiler: turns a [`GraphSpec`] into an immutable [`CompiledGraph`].
//!
//! Phases run in a fixed order and each one sees the whole graph, so the
//! first error reported is always from the earliest failing phase:
//!
//! 1. shape validation (`invalid_spec`)
//! 2. registry lookup (`unknown_type`)
//! 3. implementation resolution (`resolution_failure`)
//! 4. capability check (`capability_mismatch`)
//! 5. instantiation and retry policy (`instantiation`)
//! 6. static template validation (`unresolved_static_template`)
//! 7. wrapper chain construction
//! 8. transition table (`ambiguous_transition`, `dangling_reference`)
//! 9. entry node selection
//!
//! Compilation never touches run-time state and is deterministic for a given
//! spec, registry and option set.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use relay_ir::{validate_shape_or_raise, BatchSpec, FailurePolicy, GraphSpec, NodeSpec};
use relay_registry::{nearest, ComponentMetadata, Registry};
use relay_template::{canonical_json, check_path, extract_refs, PathCheck, TemplateRef, TemplateResolver};
use relay_types::{
    CompilationError, CompilePhase, InterfaceField, DEFAULT_ACTION, ERROR_ACTION, INPUTS_NAMESPACE,
};

use crate::component::{Component, ComponentFactory, Implementation, ImplementationTable};
use crate::config::CompileOptions;
use crate::retry::RetryPolicy;
use crate::stages::{
    layers_of, BatchStage, InstrumentStage, LayerKind, LifecycleStage, NamespaceStage, Stage, TemplateStage,
};

/// Suggestions offered for an unknown type or scope name.
const SUGGESTION_LIMIT: usize = 3;

// ---------------------------------------------------------------------------
// Compiled output
// ---------------------------------------------------------------------------

/// One node with its fully wrapped execution chain.
pub struct CompiledNode {
    pub id: String,
    pub component_type: String,
    pub location_descriptor: String,
    pub retry: RetryPolicy,
    pub batch: Option<BatchSpec>,
    chain: Arc<dyn Stage>,
}

impl CompiledNode {
    /// The outermost stage of the chain.
    pub fn chain(&self) -> &dyn Stage {
        self.chain.as_ref()
    }

    /// Wrapper layers, outermost first.
    pub fn layers(&self) -> Vec<LayerKind> {
        layers_of(self.chain.as_ref())
    }
}

impl fmt::Debug for CompiledNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledNode")
            .field("id", &self.id)
            .field("component_type", &self.component_type)
            .field("location_descriptor", &self.location_descriptor)
            .field("retry", &self.retry)
            .field("layers", &self.layers())
            .finish()
    }
}

/// An executable graph. Immutable; share it behind an `Arc`.
#[derive(Debug)]
pub struct CompiledGraph {
    pub entry: String,
    pub nodes: BTreeMap<String, CompiledNode>,
    /// Node ids in declaration order.
    pub order: Vec<String>,
    /// `(from, action) -> to`.
    pub transitions: BTreeMap<(String, String), String>,
    /// Hex SHA-256 of the spec, registry, options and bound descriptors
    /// that produced this graph.
    pub fingerprint: String,
    source: GraphSpec,
}

/// Compile cache key; see [`Compiler::cache_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: String,
    pub implementations: u64,
}

/// Comparable description of a compiled graph, free of trait objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStructure {
    pub entry: String,
    pub nodes: Vec<NodeStructure>,
    pub transitions: Vec<TransitionStructure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStructure {
    pub id: String,
    pub component_type: String,
    pub location_descriptor: String,
    pub layers: Vec<LayerKind>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionStructure {
    pub from: String,
    pub action: String,
    pub to: String,
}

impl CompiledGraph {
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }

    pub fn transition(&self, from: &str, action: &str) -> Option<&str> {
        self.transitions
            .get(&(from.to_string(), action.to_string()))
            .map(String::as_str)
    }

    /// The spec this graph was compiled from.
    pub fn source(&self) -> &GraphSpec {
        &self.source
    }

    pub fn structure(&self) -> GraphStructure {
        GraphStructure {
            entry: self.entry.clone(),
            nodes: self
                .order
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|n| NodeStructure {
                    id: n.id.clone(),
                    component_type: n.component_type.clone(),
                    location_descriptor: n.location_descriptor.clone(),
                    layers: n.layers(),
                    retry: n.retry,
                })
                .collect(),
            transitions: self
                .transitions
                .iter()
                .map(|((from, action), to)| TransitionStructure {
                    from: from.clone(),
                    action: action.clone(),
                    to: to.clone(),
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

pub struct Compiler<'a> {
    registry: &'a Registry,
    implementations: &'a ImplementationTable,
    options: CompileOptions,
}

/// Per-node data gathered across phases.
struct Resolved<'s> {
    spec: &'s NodeSpec,
    metadata: &'s ComponentMetadata,
    factory: Option<Arc<dyn ComponentFactory>>,
    component: Option<Arc<dyn Component>>,
    retry: RetryPolicy,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a Registry, implementations: &'a ImplementationTable) -> Self {
        Self {
            registry,
            implementations,
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Stable content hash of `(spec, registry, options, bound descriptors)`.
    pub fn fingerprint(&self, spec: &GraphSpec) -> String {
        let mut hasher = Sha256::new();
        for part in [
            serde_json::to_value(spec).unwrap_or_default(),
            serde_json::to_value(&self.options).unwrap_or_default(),
            serde_json::to_value(self.implementations.bindings()).unwrap_or_default(),
        ] {
            hasher.update(canonical_json(&part).as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(self.registry.fingerprint().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Key under which [`CompileCache`](crate::CompileCache) stores the
    /// result: the content fingerprint plus the identity of the
    /// implementation table, since equal descriptors may be bound to
    /// different factories.
    pub fn cache_key(&self, spec: &GraphSpec) -> CacheKey {
        CacheKey {
            fingerprint: self.fingerprint(spec),
            implementations: self.implementations.generation(),
        }
    }

    /// Parse and compile a JSON graph document.
    pub fn compile_json(&self, text: &str) -> Result<CompiledGraph, CompilationError> {
        self.compile(&GraphSpec::from_json(text)?)
    }

    pub fn compile(&self, spec: &GraphSpec) -> Result<CompiledGraph, CompilationError> {
        validate_shape_or_raise(spec)?;

        let mut nodes = self.lookup_types(spec)?;
        self.resolve_implementations(&mut nodes)?;
        self.instantiate(&mut nodes)?;
        self.check_templates(spec, &nodes)?;

        let mut compiled = BTreeMap::new();
        for node in nodes.iter_mut() {
            let Some(component) = node.component.take() else {
                return Err(CompilationError::new(
                    CompilePhase::Instantiation,
                    "component instance missing after instantiation",
                )
                .at_node(&node.spec.id, &node.spec.component_type));
            };
            let chain = self.build_chain(node.spec, component, node.retry);
            compiled.insert(
                node.spec.id.clone(),
                CompiledNode {
                    id: node.spec.id.clone(),
                    component_type: node.spec.component_type.clone(),
                    location_descriptor: node.metadata.location_descriptor.clone(),
                    retry: node.retry,
                    batch: node.spec.batch.clone(),
                    chain,
                },
            );
        }

        let transitions = self.build_transitions(spec, &nodes)?;

        let entry = spec
            .entry_node()
            .ok_or_else(|| CompilationError::new(CompilePhase::InvalidSpec, "graph has no nodes"))?
            .to_string();

        let fingerprint = self.fingerprint(spec);
        tracing::info!(
            nodes = compiled.len(),
            transitions = transitions.len(),
            entry = %entry,
            fingerprint = %fingerprint,
            "Graph compiled"
        );

        Ok(CompiledGraph {
            entry,
            nodes: compiled,
            order: spec.nodes.iter().map(|n| n.id.clone()).collect(),
            transitions,
            fingerprint,
            source: spec.clone(),
        })
    }

    // ---- Phase 2: registry lookup ----

    fn lookup_types<'s>(&self, spec: &'s GraphSpec) -> Result<Vec<Resolved<'s>>, CompilationError>
    where
        'a: 's,
    {
        let registry: &'a Registry = self.registry;
        spec.nodes
            .iter()
            .map(|node| {
                let metadata = registry.lookup(&node.component_type).map_err(|_| {
                    let mut err = CompilationError::new(
                        CompilePhase::UnknownType,
                        format!("component type '{}' is not registered", node.component_type),
                    )
                    .at_node(&node.id, &node.component_type);
                    let close = registry.suggest(&node.component_type, SUGGESTION_LIMIT);
                    if !close.is_empty() {
                        err = err.with_suggestion(format!("Did you mean: {}?", close.join(", ")));
                    }
                    err
                })?;
                Ok(Resolved {
                    spec: node,
                    metadata,
                    factory: None,
                    component: None,
                    retry: self.options.default_retry,
                })
            })
            .collect()
    }

    // ---- Phases 3 and 4: implementation resolution and capability ----

    fn resolve_implementations(&self, nodes: &mut [Resolved<'_>]) -> Result<(), CompilationError> {
        let mut found: Vec<&Implementation> = Vec::with_capacity(nodes.len());
        for node in nodes.iter() {
            let descriptor = &node.metadata.location_descriptor;
            let implementation = self.implementations.get(descriptor).ok_or_else(|| {
                CompilationError::new(
                    CompilePhase::ResolutionFailure,
                    format!("no implementation is registered for '{descriptor}'"),
                )
                .at_node(&node.spec.id, &node.spec.component_type)
                .with_suggestion("register the component in the implementation table under its descriptor")
            })?;
            found.push(implementation);
        }

        for (node, implementation) in nodes.iter_mut().zip(found) {
            match implementation {
                Implementation::Component(factory) => node.factory = Some(factory.clone()),
                Implementation::Opaque { kind } => {
                    return Err(CompilationError::new(
                        CompilePhase::CapabilityMismatch,
                        format!(
                            "'{}' is a {kind} and does not implement the component lifecycle",
                            node.metadata.location_descriptor
                        ),
                    )
                    .at_node(&node.spec.id, &node.spec.component_type));
                }
            }
        }
        Ok(())
    }

    // ---- Phase 5: instantiation ----

    fn instantiate(&self, nodes: &mut [Resolved<'_>]) -> Result<(), CompilationError> {
        for node in nodes.iter_mut() {
            let fail = |detail: String| {
                CompilationError::new(CompilePhase::Instantiation, detail)
                    .at_node(&node.spec.id, &node.spec.component_type)
            };
            let Some(factory) = node.factory.as_ref() else {
                return Err(fail("no component factory resolved".to_string()));
            };
            let component = factory
                .create()
                .map_err(|e| fail(format!("failed to construct component: {e}")))?;

            let retry = node
                .metadata
                .retry
                .map(RetryPolicy::from)
                .or_else(|| component.retry_policy())
                .unwrap_or(self.options.default_retry);
            if retry.max_attempts == 0 {
                return Err(fail("retry policy must allow at least one attempt".to_string()));
            }

            node.retry = retry;
            node.component = Some(component);
        }
        Ok(())
    }

    // ---- Phase 6: static template validation ----

    fn check_templates(&self, spec: &GraphSpec, nodes: &[Resolved<'_>]) -> Result<(), CompilationError> {
        let outputs: BTreeMap<&str, Vec<InterfaceField>> = nodes
            .iter()
            .map(|n| (n.spec.id.as_str(), declared_outputs(n)))
            .collect();
        let mut scope_names: Vec<&str> = spec.nodes.iter().map(|n| n.id.as_str()).collect();
        scope_names.push(INPUTS_NAMESPACE);

        for (position, node) in nodes.iter().enumerate() {
            let fail = |detail: String| {
                CompilationError::new(CompilePhase::UnresolvedStaticTemplate, detail)
                    .at_node(&node.spec.id, &node.spec.component_type)
            };

            let mut refs: Vec<(TemplateRef, bool)> = Vec::new();
            let params = extract_refs(&node.spec.params).map_err(|e| fail(e.to_string()))?;
            refs.extend(params.into_iter().map(|r| (r, true)));
            if let Some(batch) = &node.spec.batch {
                let items = extract_refs(&Value::String(batch.items.clone())).map_err(|e| fail(e.to_string()))?;
                refs.extend(items.into_iter().map(|r| (r, false)));
            }

            for (reference, in_params) in refs {
                let scope = reference.path.scope.as_str();
                if scope == INPUTS_NAMESPACE {
                    continue;
                }
                if in_params && node.spec.batch.as_ref().is_some_and(|b| b.alias == scope) {
                    continue;
                }
                if scope == node.spec.id {
                    return Err(fail(format!(
                        "'{}' references the node's own outputs",
                        reference.raw
                    )));
                }
                match spec.position(scope) {
                    None => {
                        let mut err = fail(format!("'{}' refers to unknown scope '{scope}'", reference.raw));
                        let close = nearest(scope, scope_names.iter().copied(), SUGGESTION_LIMIT);
                        if !close.is_empty() {
                            err = err.with_suggestion(format!("Did you mean: {}?", close.join(", ")));
                        }
                        return Err(err);
                    }
                    Some(target) if target > position => {
                        return Err(fail(format!(
                            "'{}' refers to node '{scope}', which is declared later",
                            reference.raw
                        ))
                        .with_suggestion(format!("declare '{scope}' before '{}'", node.spec.id)));
                    }
                    Some(_) => {}
                }

                let writes = outputs.get(scope).map(Vec::as_slice).unwrap_or_default();
                match check_path(&reference.path.segments, writes) {
                    PathCheck::Valid => {}
                    PathCheck::Deferred(reason) => tracing::debug!(
                        node = %node.spec.id,
                        template = %reference.raw,
                        %reason,
                        "Template path checked at run time"
                    ),
                    PathCheck::Invalid(reason) => {
                        return Err(fail(format!("'{}': {reason}", reference.raw)));
                    }
                }
            }
        }
        Ok(())
    }

    // ---- Phase 7: wrapper chain ----

    fn build_chain(&self, node: &NodeSpec, component: Arc<dyn Component>, retry: RetryPolicy) -> Arc<dyn Stage> {
        let resolver = TemplateResolver::new(self.options.template.clone());
        let lifecycle: Arc<dyn Stage> = Arc::new(LifecycleStage::new(component, &node.component_type, retry));
        let template: Arc<dyn Stage> = Arc::new(TemplateStage::new(lifecycle, node.param_map(), resolver.clone()));
        let namespace: Arc<dyn Stage> = Arc::new(NamespaceStage::new(template));
        let instrument: Arc<dyn Stage> = Arc::new(InstrumentStage::new(namespace, &node.component_type));

        let Some(batch) = &node.batch else {
            return instrument;
        };
        let policy: FailurePolicy = batch.failure_policy.unwrap_or(self.options.batch.failure_policy);
        let stage = BatchStage::new(instrument, &batch.items, &batch.alias, resolver).failure_policy(policy);
        if batch.parallel {
            let limit = batch.max_concurrency.unwrap_or(self.options.batch.max_concurrency);
            Arc::new(stage.parallel(limit))
        } else {
            Arc::new(stage)
        }
    }

    // ---- Phase 8: transitions ----

    fn build_transitions(
        &self,
        spec: &GraphSpec,
        nodes: &[Resolved<'_>],
    ) -> Result<BTreeMap<(String, String), String>, CompilationError> {
        let type_of = |id: &str| spec.node(id).map(|n| n.component_type.clone()).unwrap_or_default();

        let mut transitions: BTreeMap<(String, String), String> = BTreeMap::new();
        for edge in &spec.edges {
            let key = (edge.from.clone(), edge.action.clone());
            if let Some(existing) = transitions.get(&key) {
                return Err(CompilationError::new(
                    CompilePhase::AmbiguousTransition,
                    format!(
                        "action '{}' from '{}' leads to both '{existing}' and '{}'",
                        edge.action, edge.from, edge.to
                    ),
                )
                .at_node(&edge.from, type_of(&edge.from))
                .with_suggestion("give each outgoing edge of a node a distinct action"));
            }
            transitions.insert(key, edge.to.clone());
        }

        let ids: HashSet<&str> = spec.nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &spec.edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    return Err(CompilationError::new(
                        CompilePhase::DanglingReference,
                        format!(
                            "edge '{}' -[{}]-> '{}' references unknown node '{end}'",
                            edge.from, edge.action, edge.to
                        ),
                    ));
                }
            }
        }
        if let Some(start) = &spec.start_node {
            if !ids.contains(start.as_str()) {
                return Err(CompilationError::new(
                    CompilePhase::DanglingReference,
                    format!("start node '{start}' does not exist"),
                ));
            }
        }

        for node in nodes {
            let metadata = node.metadata;
            if metadata.actions.is_empty() {
                continue;
            }
            for (from, action) in transitions.keys() {
                if from == &node.spec.id
                    && action != DEFAULT_ACTION
                    && action != ERROR_ACTION
                    && !metadata.declares_action(action)
                {
                    tracing::warn!(
                        node = %from,
                        %action,
                        component = %metadata.type_name,
                        "Edge uses an action the component does not declare"
                    );
                }
            }
        }

        Ok(transitions)
    }
}

/// What a node makes available to later templates. Batch nodes expose the
/// merged `{results, count, errors}` shape with each result shaped like the
/// component's own writes. Every node may also write `error` on failure.
fn declared_outputs(node: &Resolved<'_>) -> Vec<InterfaceField> {
    let writes = &node.metadata.writes;
    if writes.is_empty() {
        return Vec::new();
    }
    let error = InterfaceField::new("error", "str");
    match &node.spec.batch {
        None => {
            let mut out = writes.clone();
            if !out.iter().any(|f| f.key == "error") {
                out.push(error);
            }
            out
        }
        Some(_) => vec![
            InterfaceField::new("results", "list[dict]").with_structure(writes.clone()),
            InterfaceField::new("count", "int"),
            InterfaceField::new("errors", "list[dict]")
                .with_structure(vec![InterfaceField::new("index", "int"), error.clone()]),
            error,
        ],
    }
}
