//! Source scanning: find component implementations and their doc blocks.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use relay_types::{RelayError, Result};

/// File filters for [`crate::Registry::scan_with`]. Patterns are matched
/// against paths relative to each scan root.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include: vec!["**/*.rs".to_string()],
            exclude: vec!["**/target/**".to_string()],
        }
    }
}

impl ScanOptions {
    pub(crate) fn build(&self) -> Result<(GlobSet, GlobSet)> {
        Ok((build_set(&self.include)?, build_set(&self.exclude)?))
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| RelayError::Registry(format!("invalid scan pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RelayError::Registry(e.to_string()))
}

/// A component implementation found in a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub struct_name: String,
    pub location_descriptor: String,
    /// Doc comment text with the `///` markers removed; `None` if the
    /// struct has no doc block or could not be found.
    pub doc: Option<String>,
}

fn impl_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*impl(?:<[^>]*>)?\s+(?:[A-Za-z_][A-Za-z0-9_]*::)*Component\s+for\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("impl regex is valid")
    })
}

fn package_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*name\s*=\s*"([^"]+)""#).expect("package name regex is valid")
    })
}

/// Recursively collect files under `current` accepted by the filters.
/// Unreadable directories are logged and skipped.
pub(crate) async fn collect_files(
    base: &Path,
    current: &Path,
    include: &GlobSet,
    exclude: &GlobSet,
    files: &mut Vec<PathBuf>,
) {
    let meta = match tokio::fs::metadata(current).await {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(path = %current.display(), error = %e, "Skipping unreadable path");
            return;
        }
    };
    let rel = current.strip_prefix(base).unwrap_or(current);
    if !rel.as_os_str().is_empty() && exclude.is_match(rel) {
        return;
    }
    if meta.is_file() {
        if include.is_match(rel) {
            files.push(current.to_path_buf());
        }
    } else if meta.is_dir() {
        let mut read_dir = match tokio::fs::read_dir(current).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %current.display(), error = %e, "Skipping unreadable directory");
                return;
            }
        };
        let mut children = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => children.push(entry.path()),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(path = %current.display(), error = %e, "Directory listing interrupted");
                    break;
                }
            }
        }
        children.sort();
        for child in children {
            Box::pin(collect_files(base, &child, include, exclude, files)).await;
        }
    }
}

/// Find every `impl Component for X` in `source` and pair it with the doc
/// block of `struct X`.
pub fn find_candidates(source: &str, module_prefix: &str) -> Vec<Candidate> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for caps in impl_regex().captures_iter(source) {
        let name = caps[1].to_string();
        if seen.contains(&name) {
            continue;
        }
        seen.push(name.clone());
        out.push(Candidate {
            location_descriptor: format!("{module_prefix}::{name}"),
            doc: struct_doc(source, &name),
            struct_name: name,
        });
    }
    out
}

/// The `///` block directly above `struct name`, skipping attributes.
fn struct_doc(source: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+{}\b",
        regex::escape(name)
    );
    let re = Regex::new(&pattern).ok()?;
    let lines: Vec<&str> = source.lines().collect();
    let at = lines.iter().position(|l| re.is_match(l))?;

    let mut doc = Vec::new();
    for line in lines[..at].iter().rev() {
        let t = line.trim_start();
        if t.starts_with("#[") {
            continue;
        }
        match t.strip_prefix("///") {
            Some(rest) => doc.push(rest.strip_prefix(' ').unwrap_or(rest)),
            None => break,
        }
    }
    if doc.is_empty() {
        return None;
    }
    doc.reverse();
    Some(doc.join("\n"))
}

/// `<crate>::<module path>` for a source file, matching what
/// `module_path!()` reports inside it.
///
/// The crate is the nearest ancestor holding a `Cargo.toml`; files outside
/// any crate use the scan root's directory name.
pub async fn module_path_for(root: &Path, file: &Path) -> String {
    let mut crate_dir: Option<(PathBuf, String)> = None;
    for dir in file.ancestors().skip(1) {
        let manifest = dir.join("Cargo.toml");
        if let Ok(text) = tokio::fs::read_to_string(&manifest).await {
            if let Some(name) = package_name(&text) {
                crate_dir = Some((dir.to_path_buf(), name));
                break;
            }
        }
        if dir == root {
            break;
        }
    }

    let (base, crate_name) = match crate_dir {
        Some((dir, name)) => {
            let src = dir.join("src");
            (if file.starts_with(&src) { src } else { dir }, name)
        }
        None => {
            let name = root
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("crate")
                .to_string();
            (root.to_path_buf(), name)
        }
    };

    let mut segments = vec![crate_name.replace('-', "_")];
    if let Ok(rel) = file.strip_prefix(&base) {
        let parts: Vec<String> = rel
            .with_extension("")
            .components()
            .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
            .collect();
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            if last && matches!(part.as_str(), "lib" | "main" | "mod") {
                continue;
            }
            segments.push(part.replace('-', "_"));
        }
    }
    segments.join("::")
}

fn package_name(manifest: &str) -> Option<String> {
    let package = manifest.split("[package]").nth(1)?;
    let section = package.split("\n[").next().unwrap_or(package);
    package_name_regex()
        .captures(section)
        .map(|c| c[1].to_string())
}

/// `FetchLinksComponent` → `fetch-links`.
pub fn default_type_name(struct_name: &str) -> String {
    let base = ["Component", "Node"]
        .iter()
        .find_map(|suffix| struct_name.strip_suffix(suffix).filter(|b| !b.is_empty()))
        .unwrap_or(struct_name);
    let mut out = String::new();
    let chars: Vec<char> = base.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_ascii_uppercase();
            if !out.is_empty() && (prev_lower || (prev_upper && next_lower)) {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            if !out.is_empty() {
                out.push('-');
            }
        } else {
            out.push(c);
        }
    }
    out
}
