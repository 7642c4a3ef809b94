use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use relay_types::TemplateError;

const IDENT: &str = r"[A-Za-z_][A-Za-z0-9_]*(?:-[A-Za-z_][A-Za-z0-9_]*)*";

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"\$(\$)?\{{({IDENT}(?:\.{IDENT}|\[[0-9]+\])*)\}}");
        Regex::new(&pattern).expect("template grammar regex is valid")
    })
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!("^{IDENT}$")).expect("identifier regex is valid"))
}

/// Returns `true` if `s` is a valid template identifier (node ids, output
/// keys and batch aliases must be).
pub fn is_identifier(s: &str) -> bool {
    identifier_regex().is_match(s)
}

/// One step of a variable path after the scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed reference path: `scope(.key|[index])*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarPath {
    pub scope: String,
    pub segments: Vec<Segment>,
}

impl VarPath {
    /// Parse the inside of `${...}`.
    pub fn parse(path: &str) -> Result<Self, TemplateError> {
        let invalid = |reason: &str| TemplateError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let scope_end = path.find(['.', '[']).unwrap_or(path.len());
        let scope = &path[..scope_end];
        if !is_identifier(scope) {
            return Err(invalid("scope must be an identifier"));
        }

        let mut segments = Vec::new();
        let mut rest = &path[scope_end..];
        while !rest.is_empty() {
            if let Some(after_dot) = rest.strip_prefix('.') {
                let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
                let key = &after_dot[..end];
                if !is_identifier(key) {
                    return Err(invalid("field names must be identifiers"));
                }
                segments.push(Segment::Key(key.to_string()));
                rest = &after_dot[end..];
            } else if let Some(after_open) = rest.strip_prefix('[') {
                let close = after_open
                    .find(']')
                    .ok_or_else(|| invalid("unclosed '['"))?;
                let index = after_open[..close]
                    .parse::<usize>()
                    .map_err(|_| invalid("array index must be a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &after_open[close + 1..];
            } else {
                return Err(invalid("expected '.' or '['"));
            }
        }

        Ok(Self {
            scope: scope.to_string(),
            segments,
        })
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scope)?;
        for seg in &self.segments {
            match seg {
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

/// A `${...}` occurrence: the exact source text and its parsed path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateRef {
    pub raw: String,
    pub path: VarPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// Literal text, with `$${...}` escapes already unescaped.
    Text(String),
    Ref(TemplateRef),
}

/// Split a string into literal text and template references.
///
/// Adjacent text pieces are merged, so a string without any live reference
/// yields at most one `Text` piece.
pub fn parse_template(input: &str) -> Result<Vec<Piece>, TemplateError> {
    let mut pieces: Vec<Piece> = Vec::new();
    let push_text = |pieces: &mut Vec<Piece>, text: &str| {
        if text.is_empty() {
            return;
        }
        if let Some(Piece::Text(prev)) = pieces.last_mut() {
            prev.push_str(text);
        } else {
            pieces.push(Piece::Text(text.to_string()));
        }
    };

    let mut last = 0;
    for caps in template_regex().captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_text(&mut pieces, &input[last..whole.start()]);
        last = whole.end();

        let path_src = &caps[2];
        if caps.get(1).is_some() {
            // `$${x}` is the literal text `${x}`.
            push_text(&mut pieces, &format!("${{{path_src}}}"));
            continue;
        }
        let path = VarPath::parse(path_src)?;
        pieces.push(Piece::Ref(TemplateRef {
            raw: whole.as_str().to_string(),
            path,
        }));
    }
    push_text(&mut pieces, &input[last..]);
    Ok(pieces)
}

/// Returns `true` if `input` contains at least one live (unescaped) reference.
pub fn has_templates(input: &str) -> bool {
    template_regex()
        .captures_iter(input)
        .any(|caps| caps.get(1).is_none())
}
