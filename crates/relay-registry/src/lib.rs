//! Component metadata registry.
//!
//! The registry is built by scanning source trees for component
//! implementations and parsing the interface doc block above each struct
//! (see [`parse_interface_doc`]). It is read-only once built and can be
//! shared freely between concurrent compilations.

mod doc;
mod scan;
mod suggest;

pub use doc::{parse_interface_doc, ActionDoc, InterfaceDoc, RetryHint};
pub use scan::{default_type_name, find_candidates, module_path_for, Candidate, ScanOptions};
pub use suggest::{edit_distance, nearest};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use relay_template::canonical_json;
use relay_types::{InterfaceField, RelayError, Result};

/// Interchange format version written by [`Registry::save`].
const REGISTRY_FORMAT_VERSION: u32 = 1;

/// Declared interface of one component type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub type_name: String,
    /// Where the implementation lives: `<crate>::<module path>::<Struct>`.
    pub location_descriptor: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reads: Vec<InterfaceField>,
    #[serde(default)]
    pub writes: Vec<InterfaceField>,
    #[serde(default)]
    pub params: Vec<InterfaceField>,
    #[serde(default)]
    pub actions: Vec<ActionDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryHint>,
}

impl ComponentMetadata {
    /// Build metadata from a parsed doc block. `Name:` overrides the type
    /// name derived from the struct.
    pub fn from_doc(struct_name: &str, location_descriptor: impl Into<String>, doc: InterfaceDoc) -> Self {
        Self {
            type_name: doc.name.unwrap_or_else(|| default_type_name(struct_name)),
            location_descriptor: location_descriptor.into(),
            description: doc.description,
            reads: doc.reads,
            writes: doc.writes,
            params: doc.params,
            actions: doc.actions,
            retry: doc.retry,
        }
    }

    pub fn declares_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.name == action)
    }
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    components: Vec<ComponentMetadata>,
}

/// Lookup table from component type name to metadata.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    components: BTreeMap<String, ComponentMetadata>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `roots` with the default filters (`**/*.rs`, excluding `target/`).
    pub async fn scan<P: AsRef<Path>>(roots: &[P]) -> Result<Self> {
        Self::scan_with(roots, &ScanOptions::default()).await
    }

    /// Scan source roots for component implementations.
    ///
    /// Unreadable files and unparseable doc blocks are logged and skipped;
    /// whatever could be read is returned. Only invalid filter patterns fail
    /// the scan.
    pub async fn scan_with<P: AsRef<Path>>(roots: &[P], options: &ScanOptions) -> Result<Self> {
        let (include, exclude) = options.build()?;
        let mut registry = Self::new();

        for root in roots {
            let root = root.as_ref();
            let mut files: Vec<PathBuf> = Vec::new();
            scan::collect_files(root, root, &include, &exclude, &mut files).await;
            tracing::debug!(root = %root.display(), files = files.len(), "Scanning for components");

            for file in files {
                let source = match tokio::fs::read_to_string(&file).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(path = %file.display(), error = %e, "Skipping unreadable source file");
                        continue;
                    }
                };
                let module = module_path_for(root, &file).await;
                for candidate in find_candidates(&source, &module) {
                    let Some(doc_text) = candidate.doc else {
                        tracing::warn!(
                            path = %file.display(),
                            component = %candidate.struct_name,
                            "Skipping component without an interface doc block"
                        );
                        continue;
                    };
                    match parse_interface_doc(&doc_text) {
                        Ok(doc) => registry.register(ComponentMetadata::from_doc(
                            &candidate.struct_name,
                            candidate.location_descriptor,
                            doc,
                        )),
                        Err(reason) => tracing::warn!(
                            path = %file.display(),
                            component = %candidate.struct_name,
                            %reason,
                            "Skipping component with unparseable interface doc"
                        ),
                    }
                }
            }
        }

        tracing::info!(components = registry.len(), "Registry built");
        Ok(registry)
    }

    /// Build a registry from in-process doc strings:
    /// `(struct name, location descriptor, doc text)`.
    ///
    /// Unlike [`Registry::scan`], a malformed doc block is an error here.
    pub fn from_docs<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    {
        let mut registry = Self::new();
        for (struct_name, descriptor, text) in entries {
            let doc = parse_interface_doc(text)
                .map_err(|e| RelayError::Registry(format!("{struct_name}: {e}")))?;
            registry.register(ComponentMetadata::from_doc(struct_name, descriptor, doc));
        }
        Ok(registry)
    }

    /// Add or replace an entry. A later registration of the same type name
    /// replaces the earlier one.
    pub fn register(&mut self, metadata: ComponentMetadata) {
        if let Some(previous) = self.components.get(&metadata.type_name) {
            tracing::warn!(
                type_name = %metadata.type_name,
                previous = %previous.location_descriptor,
                replacement = %metadata.location_descriptor,
                "Duplicate component type; last registration wins"
            );
        }
        self.components.insert(metadata.type_name.clone(), metadata);
    }

    pub fn lookup(&self, type_name: &str) -> Result<&ComponentMetadata> {
        self.components.get(type_name).ok_or_else(|| RelayError::NotFound {
            type_name: type_name.to_string(),
        })
    }

    /// Up to `limit` registered names closest to `type_name`.
    pub fn suggest(&self, type_name: &str, limit: usize) -> Vec<String> {
        nearest(type_name, self.components.keys().map(String::as_str), limit)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Entries in type-name order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentMetadata> {
        self.components.values()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Hex SHA-256 over the canonical JSON of every record. Stable across
    /// processes and toolchains, so it can be stored next to saved metadata.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for record in self.components.values() {
            let value = serde_json::to_value(record).unwrap_or_default();
            hasher.update(canonical_json(&value).as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Write all records as JSON interchange.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = RegistryFile {
            version: REGISTRY_FORMAT_VERSION,
            components: self.components.values().cloned().collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&data)?;
        if file.version != REGISTRY_FORMAT_VERSION {
            return Err(RelayError::Registry(format!(
                "unsupported registry format version {}",
                file.version
            )));
        }
        let mut registry = Self::new();
        for record in file.components {
            registry.register(record);
        }
        Ok(registry)
    }
}
