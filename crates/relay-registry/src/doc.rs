//! Interface doc grammar.
//!
//! A component documents its interface in the doc comment of its struct:
//!
//! ```text
//! Fetch a page and extract its links.
//!
//! Name: fetch-links
//! Reads:
//!   - url: str  # page to fetch
//! Writes:
//!   - links: list[dict]  # one entry per anchor
//!       - href: str
//!       - text: str
//!   - status: int
//! Params:
//!   - timeout_ms: int  # request timeout
//! Actions:
//!   - default: page fetched
//!   - not_found: server answered 404
//! Retry: max_attempts=3 wait_ms=250
//! ```
//!
//! Everything before the first section is the description. Entries are
//! `key: type  # description`; a leading `- ` is optional and deeper
//! indentation nests an entry under the one above it.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use relay_template::is_identifier;
use relay_types::InterfaceField;

/// A declared action and what it means.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Retry behaviour declared by the component author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryHint {
    pub max_attempts: u32,
    #[serde(default)]
    pub wait_ms: u64,
}

/// Everything the doc grammar extracts from one doc block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceDoc {
    pub name: Option<String>,
    pub description: String,
    pub reads: Vec<InterfaceField>,
    pub writes: Vec<InterfaceField>,
    pub params: Vec<InterfaceField>,
    pub actions: Vec<ActionDoc>,
    pub retry: Option<RetryHint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Description,
    Reads,
    Writes,
    Params,
    Actions,
}

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(Reads|Writes|Params|Actions|Name|Retry):\s*(.*)$").expect("header regex is valid")
    })
}

/// Parse one doc block (comment markers already stripped).
///
/// Errors name the offending line (1-based within the block).
pub fn parse_interface_doc(doc: &str) -> Result<InterfaceDoc, String> {
    let mut out = InterfaceDoc::default();
    let mut section = Section::Description;
    let mut saw_section = false;
    let mut description: Vec<&str> = Vec::new();
    let mut stack: Vec<(usize, InterfaceField)> = Vec::new();

    for (idx, raw) in doc.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();

        if let Some(caps) = header_regex().captures(trimmed).filter(|_| !raw.starts_with(char::is_whitespace)) {
            flush(&mut stack, section, &mut out);
            let rest = caps[2].trim();
            match &caps[1] {
                "Name" => {
                    if !is_type_name(rest) {
                        return Err(format!("line {line_no}: invalid component name '{rest}'"));
                    }
                    out.name = Some(rest.to_string());
                }
                "Retry" => out.retry = Some(parse_retry(rest).map_err(|e| format!("line {line_no}: {e}"))?),
                header => {
                    if !rest.is_empty() && !rest.eq_ignore_ascii_case("none") {
                        return Err(format!("line {line_no}: unexpected text after '{header}:'"));
                    }
                    section = match header {
                        "Reads" => Section::Reads,
                        "Writes" => Section::Writes,
                        "Params" => Section::Params,
                        _ => Section::Actions,
                    };
                    saw_section = true;
                }
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }

        match section {
            Section::Description => description.push(trimmed),
            Section::Actions => {
                let entry = trimmed.strip_prefix("- ").unwrap_or(trimmed).trim();
                let (name, desc) = match entry.split_once(':') {
                    Some((n, d)) => (n.trim(), d.trim()),
                    None => split_comment(entry),
                };
                if !is_identifier(name) {
                    return Err(format!("line {line_no}: invalid action name '{name}'"));
                }
                out.actions.push(ActionDoc {
                    name: name.to_string(),
                    description: desc.to_string(),
                });
            }
            Section::Reads | Section::Writes | Section::Params => {
                let indent = raw.len() - raw.trim_start().len();
                let field = parse_entry(trimmed).map_err(|e| format!("line {line_no}: {e}"))?;
                while stack.last().is_some_and(|(i, _)| *i >= indent) {
                    pop_into(&mut stack, section, &mut out);
                }
                stack.push((indent, field));
            }
        }
    }
    flush(&mut stack, section, &mut out);

    if !saw_section {
        return Err("doc block declares no interface sections".to_string());
    }
    out.description = description.join(" ");
    Ok(out)
}

/// `key: type  # description`, optionally prefixed with `- `.
fn parse_entry(line: &str) -> Result<InterfaceField, String> {
    let entry = line.strip_prefix("- ").unwrap_or(line).trim();
    let (key, rest) = entry
        .split_once(':')
        .ok_or_else(|| format!("expected 'key: type', got '{entry}'"))?;
    let key = key.trim();
    if !is_identifier(key) {
        return Err(format!("invalid key '{key}'"));
    }
    let (type_name, description) = split_comment(rest.trim());
    if type_name.is_empty() {
        return Err(format!("entry '{key}' has no type"));
    }
    let mut field = InterfaceField::new(key, type_name);
    field.description = description.to_string();
    Ok(field)
}

fn split_comment(text: &str) -> (&str, &str) {
    match text.split_once('#') {
        Some((head, comment)) => (head.trim(), comment.trim()),
        None => (text.trim(), ""),
    }
}

fn parse_retry(text: &str) -> Result<RetryHint, String> {
    let mut hint = RetryHint {
        max_attempts: 1,
        wait_ms: 0,
    };
    for pair in text.split([',', ' ']).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value in Retry, got '{pair}'"))?;
        let parsed = value
            .trim()
            .trim_end_matches("ms")
            .parse::<u64>()
            .map_err(|_| format!("Retry value for '{key}' is not a number"))?;
        match key.trim() {
            "max_attempts" => hint.max_attempts = u32::try_from(parsed).map_err(|_| "max_attempts is too large")?,
            "wait_ms" | "wait" => hint.wait_ms = parsed,
            other => return Err(format!("unknown Retry key '{other}'")),
        }
    }
    if hint.max_attempts == 0 {
        return Err("max_attempts must be at least 1".to_string());
    }
    Ok(hint)
}

fn is_type_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn pop_into(stack: &mut Vec<(usize, InterfaceField)>, section: Section, out: &mut InterfaceDoc) {
    let Some((_, field)) = stack.pop() else { return };
    match stack.last_mut() {
        Some((_, parent)) => parent.structure.push(field),
        None => match section {
            Section::Reads => out.reads.push(field),
            Section::Writes => out.writes.push(field),
            Section::Params => out.params.push(field),
            Section::Description | Section::Actions => {}
        },
    }
}

fn flush(stack: &mut Vec<(usize, InterfaceField)>, section: Section, out: &mut InterfaceDoc) {
    while !stack.is_empty() {
        pop_into(stack, section, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
Fetch a page and
extract its links.

Name: fetch-links
Reads:
  - url: str  # page to fetch
Writes:
  - links: list[dict]  # one entry per anchor
      - href: str
      - text: str
  - status: int
Params:
  - timeout_ms: int
Actions:
  - default: page fetched
  - not_found
Retry: max_attempts=3 wait_ms=250
";

    #[test]
    fn parses_full_doc_block() {
        let doc = parse_interface_doc(DOC).unwrap();
        assert_eq!(doc.name.as_deref(), Some("fetch-links"));
        assert_eq!(doc.description, "Fetch a page and extract its links.");
        assert_eq!(doc.reads, vec![{
            let mut f = InterfaceField::new("url", "str");
            f.description = "page to fetch".into();
            f
        }]);
        assert_eq!(doc.writes.len(), 2);
        assert_eq!(doc.writes[0].key, "links");
        assert_eq!(doc.writes[0].type_name, "list[dict]");
        let nested: Vec<&str> = doc.writes[0].structure.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(nested, vec!["href", "text"]);
        assert_eq!(doc.writes[1].key, "status");
        assert_eq!(doc.params[0].key, "timeout_ms");
        assert_eq!(doc.actions.len(), 2);
        assert_eq!(doc.actions[1].name, "not_found");
        assert_eq!(doc.retry, Some(RetryHint { max_attempts: 3, wait_ms: 250 }));
    }

    #[test]
    fn deep_nesting_and_dedent() {
        let doc = parse_interface_doc(
            "Writes:\n  - a: dict\n    - b: dict\n      - c: int\n    - d: str\n  - e: bool\n",
        )
        .unwrap();
        assert_eq!(doc.writes.len(), 2);
        let a = &doc.writes[0];
        assert_eq!(a.structure.len(), 2);
        assert_eq!(a.structure[0].structure[0].key, "c");
        assert_eq!(a.structure[1].key, "d");
        assert_eq!(doc.writes[1].key, "e");
    }

    #[test]
    fn entries_without_dash_prefix() {
        let doc = parse_interface_doc("Reads:\n  path: str # file\nWrites: none\n").unwrap();
        assert_eq!(doc.reads[0].description, "file");
        assert!(doc.writes.is_empty());
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_interface_doc("Writes:\n  - just words\n").unwrap_err().contains("line 2"));
        assert!(parse_interface_doc("Writes:\n  - 1bad: str\n").is_err());
        assert!(parse_interface_doc("Writes:\n  - key:\n").is_err());
        assert!(parse_interface_doc("Retry: max_attempts=0\nReads:\n").is_err());
        assert!(parse_interface_doc("Retry: attempts=2\nReads:\n").is_err());
    }

    #[test]
    fn plain_prose_is_not_an_interface() {
        assert!(parse_interface_doc("Just a helper struct.").is_err());
    }
}
