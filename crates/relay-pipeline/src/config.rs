//! Engine and compiler configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use relay_ir::FailurePolicy;
use relay_template::TemplateConfig;
use relay_types::Result;

use crate::retry::RetryPolicy;

/// Deployment-wide batch defaults; a node's `batch` block may override them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrency: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

/// Everything that affects compiled output. Part of the compile cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub template: TemplateConfig,
    pub batch: BatchConfig,
    pub default_retry: RetryPolicy,
}

/// Runtime configuration, loadable from a JSON file.
///
/// `max_steps` is read by the [`Executor`](crate::Executor). The other
/// fields shape compiled graphs and only take effect through
/// [`compile_options`](Self::compile_options) passed to
/// [`Compiler::with_options`](crate::Compiler::with_options); a graph keeps the
/// template mode, batch defaults and retry policy it was compiled with.
///
/// ```json
/// {
///   "max_steps": 500,
///   "template": {"mode": "lenient"},
///   "batch": {"max_concurrency": 4, "failure_policy": "collect_all"},
///   "default_retry": {"max_attempts": 3, "backoff": {"kind": "fixed", "delay_ms": 100}}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Steps a single run may take before it is aborted.
    pub max_steps: usize,
    /// Compile-time: template mode and size guard baked into each node.
    pub template: TemplateConfig,
    /// Compile-time: batch defaults for nodes that don't set their own.
    pub batch: BatchConfig,
    /// Compile-time: retry policy for components that declare none.
    pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            template: TemplateConfig::default(),
            batch: BatchConfig::default(),
            default_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            template: self.template.clone(),
            batch: self.batch.clone(),
            default_retry: self.default_retry,
        }
    }
}
