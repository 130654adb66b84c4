//! Hierarchical unit paths.
//!
//! Paths are dot-separated labels restricted to `[A-Za-z0-9_]`. This module
//! sanitizes labels, renders path templates such as `PRV.{meta[chapter]}.{ordinal:02d}`,
//! and matches paths against lquery-style patterns (`RA.*.sub_*`,
//! `book.chapter|appendix.*`).

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::models::JsonMap;

static PATH_SANITIZER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]+").expect("sanitizer pattern is valid"));

/// Characters that mark a unit selector as a pattern rather than a literal path.
const WILDCARD_CHARS: &[char] = &['*', '?', '[', ']', '|', '{', '}'];

/// Replace every run of disallowed characters with `_` and trim underscores.
///
/// Never returns an empty string: a token with no usable characters becomes
/// `"unit"`.
pub fn sanitize_token(token: &str) -> String {
    let cleaned = PATH_SANITIZER.replace_all(token, "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "unit".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Sanitize each label of a dotted path, dropping empty labels.
pub fn normalize_path(path: &str) -> String {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(sanitize_token)
        .collect::<Vec<_>>()
        .join(".")
}

/// Whether `path` equals `prefix` or lies beneath it.
pub fn is_descendant_or_self(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.')
}

/// Whether a selector should be treated as a pattern.
pub fn is_wildcard(selector: &str) -> bool {
    selector.contains(WILDCARD_CHARS)
}

/// Label-by-label ordering, so `a.b.c` sorts before `a.b_x`.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    a.split('.').cmp(b.split('.'))
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),
    #[error("unknown template field '{0}'")]
    UnknownField(String),
    #[error("meta key '{0}' is missing")]
    MissingMeta(String),
    #[error("invalid format spec '{0}'")]
    BadSpec(String),
    #[error("field '{0}' is not an integer")]
    NotInteger(String),
}

/// Values exposed to a path template.
pub struct TemplateContext<'a> {
    pub ordinal: i64,
    pub kind: &'a str,
    pub label: Option<&'a str>,
    pub meta: &'a JsonMap,
}

enum TemplateValue {
    Int(i64),
    Str(String),
}

/// Render a path template.
///
/// Supported fields are `ordinal`, `kind`, `label`, and `meta[key]`. A field
/// may carry a format spec of the form `[0][width][d|s]`, e.g. `{ordinal:03d}`.
/// Literal braces are written `{{` and `}}`.
pub fn render_template(scheme: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(scheme.len() + 8);
    let bytes = scheme.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push('{');
                i += 2;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push('}');
                i += 2;
            }
            b'{' => {
                let close = scheme[i..]
                    .find('}')
                    .map(|off| i + off)
                    .ok_or(TemplateError::UnbalancedBrace(i))?;
                let field = &scheme[i + 1..close];
                out.push_str(&render_field(field, ctx)?);
                i = close + 1;
            }
            b'}' => return Err(TemplateError::UnbalancedBrace(i)),
            _ => {
                let next = scheme[i..]
                    .find(['{', '}'])
                    .map(|off| i + off)
                    .unwrap_or(bytes.len());
                out.push_str(&scheme[i..next]);
                i = next;
            }
        }
    }
    Ok(out)
}

fn render_field(field: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let (name, spec) = match field.split_once(':') {
        Some((n, s)) => (n.trim(), Some(s)),
        None => (field.trim(), None),
    };

    let value = if name == "ordinal" {
        TemplateValue::Int(ctx.ordinal)
    } else if name == "kind" {
        TemplateValue::Str(ctx.kind.to_string())
    } else if name == "label" {
        TemplateValue::Str(ctx.label.unwrap_or_default().to_string())
    } else if let Some(key) = name
        .strip_prefix("meta[")
        .and_then(|rest| rest.strip_suffix(']'))
    {
        let key = key.trim_matches(|c| c == '\'' || c == '"');
        match ctx.meta.get(key) {
            Some(Value::Number(n)) if n.is_i64() => TemplateValue::Int(n.as_i64().unwrap_or(0)),
            Some(Value::String(s)) => TemplateValue::Str(s.clone()),
            Some(Value::Null) | None => return Err(TemplateError::MissingMeta(key.to_string())),
            Some(other) => TemplateValue::Str(other.to_string()),
        }
    } else {
        return Err(TemplateError::UnknownField(name.to_string()));
    };

    apply_spec(name, value, spec)
}

fn apply_spec(name: &str, value: TemplateValue, spec: Option<&str>) -> Result<String, TemplateError> {
    let Some(spec) = spec.filter(|s| !s.is_empty()) else {
        return Ok(match value {
            TemplateValue::Int(n) => n.to_string(),
            TemplateValue::Str(s) => s,
        });
    };

    let (body, ty) = match spec.chars().last() {
        Some(c @ ('d' | 's')) => (&spec[..spec.len() - 1], Some(c)),
        _ => (spec, None),
    };
    let zero = body.starts_with('0');
    let width: usize = if body.is_empty() {
        0
    } else {
        body.parse()
            .map_err(|_| TemplateError::BadSpec(spec.to_string()))?
    };

    let rendered = match (ty, value) {
        (Some('d'), TemplateValue::Int(n)) | (None, TemplateValue::Int(n)) => {
            if zero {
                format!("{:0width$}", n, width = width)
            } else {
                format!("{:>width$}", n, width = width)
            }
        }
        (Some('d'), TemplateValue::Str(s)) => {
            let n: i64 = s
                .trim()
                .parse()
                .map_err(|_| TemplateError::NotInteger(name.to_string()))?;
            if zero {
                format!("{:0width$}", n, width = width)
            } else {
                format!("{:>width$}", n, width = width)
            }
        }
        (_, TemplateValue::Int(n)) => format!("{:<width$}", n, width = width),
        (_, TemplateValue::Str(s)) => format!("{:<width$}", s, width = width),
    };
    Ok(rendered)
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum LabelMatch {
    Exact(String),
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// Any run of labels whose length lies in `min..=max`.
    Any { min: usize, max: Option<usize> },
    /// A single label matching one of the alternatives.
    Label(Vec<LabelMatch>),
}

/// A compiled lquery-style path pattern.
///
/// | Syntax | Matches |
/// |--------|---------|
/// | `*` | zero or more labels |
/// | `*{n}`, `*{n,}`, `*{n,m}` | a bounded run of labels |
/// | `abc*` | one label starting with `abc` |
/// | `a\|b` | one label equal to `a` or `b` |
#[derive(Debug, Clone, PartialEq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid path pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let err = |reason: &str| PatternError {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        if pattern.trim().is_empty() {
            return Err(err("empty pattern"));
        }

        let mut segments = Vec::new();
        for raw in pattern.split('.') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(err("empty label"));
            }
            if let Some(rest) = raw.strip_prefix('*') {
                if rest.is_empty() {
                    segments.push(Segment::Any { min: 0, max: None });
                    continue;
                }
                let inner = rest
                    .strip_prefix('{')
                    .and_then(|r| r.strip_suffix('}'))
                    .ok_or_else(|| err("expected '{n,m}' after '*'"))?;
                let parse_bound = |s: &str| -> Result<Option<usize>, PatternError> {
                    let s = s.trim();
                    if s.is_empty() {
                        Ok(None)
                    } else {
                        s.parse().map(Some).map_err(|_| err("bad quantifier"))
                    }
                };
                let (min, max) = match inner.split_once(',') {
                    Some((lo, hi)) => (parse_bound(lo)?.unwrap_or(0), parse_bound(hi)?),
                    None => {
                        let n = parse_bound(inner)?.ok_or_else(|| err("bad quantifier"))?;
                        (n, Some(n))
                    }
                };
                if max.is_some_and(|m| m < min) {
                    return Err(err("quantifier upper bound below lower bound"));
                }
                segments.push(Segment::Any { min, max });
                continue;
            }

            let mut alts = Vec::new();
            for alt in raw.split('|') {
                let alt = alt.trim();
                if let Some(prefix) = alt.strip_suffix('*') {
                    alts.push(LabelMatch::Prefix(prefix.to_string()));
                } else if alt.is_empty() {
                    return Err(err("empty alternative"));
                } else {
                    alts.push(LabelMatch::Exact(alt.to_string()));
                }
            }
            segments.push(Segment::Label(alts));
        }
        Ok(Self { segments })
    }

    /// Literal leading labels shared by every match, useful to narrow a scan.
    pub fn literal_prefix(&self) -> Option<String> {
        let mut labels = Vec::new();
        for seg in &self.segments {
            match seg {
                Segment::Label(alts) if alts.len() == 1 => match &alts[0] {
                    LabelMatch::Exact(s) => labels.push(s.as_str()),
                    LabelMatch::Prefix(_) => break,
                },
                _ => break,
            }
        }
        if labels.is_empty() {
            None
        } else {
            Some(labels.join("."))
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let labels: Vec<&str> = path.split('.').collect();
        match_from(&self.segments, &labels)
    }
}

fn match_from(segments: &[Segment], labels: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return labels.is_empty();
    };
    match first {
        Segment::Label(alts) => match labels.split_first() {
            Some((label, tail)) => {
                alts.iter().any(|alt| match alt {
                    LabelMatch::Exact(s) => s == label,
                    LabelMatch::Prefix(p) => label.starts_with(p.as_str()),
                }) && match_from(rest, tail)
            }
            None => false,
        },
        Segment::Any { min, max } => {
            let upper = max.unwrap_or(labels.len()).min(labels.len());
            (*min..=upper).any(|skip| match_from(rest, &labels[skip..]))
        }
    }
}
