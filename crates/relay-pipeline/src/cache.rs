//! Memoized compilation keyed by content hash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use relay_ir::GraphSpec;
use relay_types::CompilationError;

use crate::compiler::{CacheKey, CompiledGraph, Compiler};

/// Caches compiled graphs by [`Compiler::cache_key`], so an identical spec,
/// registry, option set and implementation table compile once.
#[derive(Default)]
pub struct CompileCache {
    entries: RwLock<HashMap<CacheKey, Arc<CompiledGraph>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CompileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached graph for this spec, or compile and cache it.
    /// Failed compilations are not cached.
    pub fn get_or_compile(
        &self,
        compiler: &Compiler<'_>,
        spec: &GraphSpec,
    ) -> Result<Arc<CompiledGraph>, CompilationError> {
        let key = compiler.cache_key(spec);
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(graph) = entries.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = %key.fingerprint, "Compile cache hit");
                return Ok(graph.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let graph = Arc::new(compiler.compile(spec)?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.entry(key).or_insert(graph).clone())
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().unwrap_or_else(PoisonError::into_inner).len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ImplementationTable};
    use crate::config::CompileOptions;
    use crate::retry::{BackoffPolicy, RetryPolicy};
    use async_trait::async_trait;
    use relay_registry::Registry;
    use relay_types::{Params, Result};
    use serde_json::{json, Value};

    struct Noop;

    #[async_trait]
    impl Component for Noop {
        async fn exec(&self, prep: &Value) -> Result<Value> {
            Ok(prep.clone())
        }
    }

    fn spec(node_type: &str) -> GraphSpec {
        GraphSpec::from_value(json!({"version": "1", "nodes": [{"id": "a", "type": node_type}]})).unwrap()
    }

    #[test]
    fn identical_inputs_hit_the_cache() {
        let registry = Registry::from_docs([("Noop", "steps::Noop", "Writes: none\n")]).unwrap();
        let table = ImplementationTable::new().with("steps::Noop", || Noop);
        let compiler = Compiler::new(&registry, &table);
        let cache = CompileCache::new();

        let first = cache.get_or_compile(&compiler, &spec("noop")).unwrap();
        let second = cache.get_or_compile(&compiler, &spec("noop")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );
    }

    #[test]
    fn options_are_part_of_the_key() {
        let registry = Registry::from_docs([("Noop", "steps::Noop", "Writes: none\n")]).unwrap();
        let table = ImplementationTable::new().with("steps::Noop", || Noop);
        let cache = CompileCache::new();

        let plain = Compiler::new(&registry, &table);
        let retrying = Compiler::new(&registry, &table).with_options(CompileOptions {
            default_retry: RetryPolicy::new(3, BackoffPolicy::None),
            ..CompileOptions::default()
        });
        let a = cache.get_or_compile(&plain, &spec("noop")).unwrap();
        let b = cache.get_or_compile(&retrying, &spec("noop")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.node("a").unwrap().retry.max_attempts, 3);
        assert_eq!(cache.stats().entries, 2);
    }

    struct Named(&'static str);

    #[async_trait]
    impl Component for Named {
        async fn exec(&self, _prep: &Value) -> Result<Value> {
            Ok(json!({"who": self.0}))
        }
    }

    #[tokio::test]
    async fn tables_binding_different_factories_do_not_share_entries() {
        let registry = Registry::from_docs([("Noop", "steps::Noop", "Writes: none\n")]).unwrap();
        let table_a = ImplementationTable::new().with("steps::Noop", || Named("a"));
        let table_b = ImplementationTable::new().with("steps::Noop", || Named("b"));
        let cache = CompileCache::new();

        let a = cache
            .get_or_compile(&Compiler::new(&registry, &table_a), &spec("noop"))
            .unwrap();
        let b = cache
            .get_or_compile(&Compiler::new(&registry, &table_b), &spec("noop"))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(cache.stats().entries, 2);

        let executor = crate::Executor::default();
        let ran_b = executor.run(&b, Params::new()).await.unwrap();
        assert_eq!(ran_b.output("a"), Some(&json!({"who": "b"})));
        let ran_a = executor.run(&a, Params::new()).await.unwrap();
        assert_eq!(ran_a.output("a"), Some(&json!({"who": "a"})));

        let shared = table_a.clone();
        let again = cache
            .get_or_compile(&Compiler::new(&registry, &shared), &spec("noop"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn failures_are_not_cached() {
        let registry = Registry::new();
        let table = ImplementationTable::new();
        let compiler = Compiler::new(&registry, &table);
        let cache = CompileCache::new();
        assert!(cache.get_or_compile(&compiler, &spec("missing")).is_err());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().misses, 1);
    }
}
