//! Declarative extraction rulesets.
//!
//! Rulesets arrive as JSON and deserialize into the raw [`MarkupRules`] /
//! [`RecordRules`] shapes, then compile into their executable forms. All
//! selectors and regexes are compiled up front so a broken ruleset fails
//! before the store is touched.
//!
//! A markup ruleset:
//!
//! ```json
//! {
//!   "root_selector": "/",
//!   "path_prefix": "PRV",
//!   "units": [
//!     { "select": ".//chapter", "kind": "chapter", "path_attr": "@n" },
//!     { "select": ".//verse", "kind": "verse", "parent_kind": "chapter",
//!       "meta": { "n": "@n", "depth": { "derive": "depth" } },
//!       "children": [{ "kind": "sentence", "split": "sentence" }] }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::ExplodeError;
use crate::xml::selector::{Namespaces, Selector};
use crate::xml::{Document, NodeId, NodeKind};

const DEFAULT_TEXT_SELECTOR: &str = "normalize-space(.)";

/// Selectors that always denote the document's root element.
const DOCUMENT_ROOT_SELECTORS: &[&str] = &["/", ".", "./"];

/// Prefixes that mark a bare string field as a selector rather than a literal.
const SELECTOR_PREFIXES: &[&str] = &[
    "@",
    "./",
    "../",
    ".//",
    "//",
    "normalize-space",
    "string(",
    "concat(",
    "name(",
];

fn default_root() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_record_prefix() -> String {
    "DOC".to_string()
}

fn default_scene_gap() -> f64 {
    45.0
}

// ---------------------------------------------------------------------------
// Raw (deserialized) shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MarkupRules {
    #[serde(default = "default_root", alias = "root_path")]
    pub root_selector: String,
    #[serde(default)]
    pub units: Vec<UnitRule>,
    #[serde(default)]
    pub namespaces: Namespaces,
    #[serde(default)]
    pub path_scheme: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub clear_existing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitRule {
    #[serde(default, alias = "path")]
    pub select: String,
    #[serde(default)]
    pub kind: String,
    pub label_path: Option<String>,
    pub label_attr: Option<String>,
    pub ordinal_path: Option<String>,
    pub ordinal: Option<FieldSpec>,
    pub text_path: Option<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, FieldSpec>,
    pub path_scheme: Option<String>,
    pub path_attr: Option<String>,
    pub path_prefix: Option<String>,
    pub path_pad: Option<usize>,
    #[serde(alias = "parent_xpath")]
    pub parent_selector: Option<String>,
    pub parent_kind: Option<OneOrMany>,
    #[serde(default)]
    pub inherit_parent: bool,
    #[serde(default)]
    pub children: Vec<ChildRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildRule {
    pub kind: String,
    pub split: Option<String>,
}

/// A meta or ordinal field as written in the ruleset.
///
/// Objects with a single `select`, `derive`, or `literal` key are explicit.
/// Anything else is classified by shape: strings that look like selectors
/// become selectors, every other value is a literal.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    Select { select: String },
    Derive { derive: Derivation },
    Literal { literal: Value },
    Bare(Value),
}

/// Built-in node derivations usable as field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    /// Local element name.
    Tag,
    /// Depth below the document node (root element = 1).
    Depth,
    /// 1-based position among the parent's child elements.
    Position,
    /// Number of child elements.
    ChildCount,
    /// Character count of the whitespace-normalized text.
    TextLength,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordRules {
    #[serde(default = "default_record_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_scene_gap")]
    pub scene_gap_seconds: f64,
    #[serde(default)]
    pub boundary_shot_regex: Option<String>,
}

impl Default for RecordRules {
    fn default() -> Self {
        Self {
            path_prefix: default_record_prefix(),
            scene_gap_seconds: default_scene_gap(),
            boundary_shot_regex: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled shapes
// ---------------------------------------------------------------------------

/// A resolved field value.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Literal(Value),
    Selector(Selector),
    Derived(Derivation),
}

impl FieldValue {
    fn compile(spec: FieldSpec) -> Result<Self, ExplodeError> {
        Ok(match spec {
            FieldSpec::Select { select } => FieldValue::Selector(compile_selector(&select)?),
            FieldSpec::Derive { derive } => FieldValue::Derived(derive),
            FieldSpec::Literal { literal } => FieldValue::Literal(literal),
            FieldSpec::Bare(Value::String(s)) if looks_like_selector(&s) => {
                FieldValue::Selector(compile_selector(&s)?)
            }
            FieldSpec::Bare(v) => FieldValue::Literal(v),
        })
    }

    /// Evaluate against a node. Empty strings and nulls resolve to `None`.
    pub fn resolve(&self, doc: &Document, node: NodeId, ns: &Namespaces) -> Option<Value> {
        let value = match self {
            FieldValue::Literal(v) => v.clone(),
            FieldValue::Selector(sel) => Value::String(sel.first_string(doc, node, ns)?),
            FieldValue::Derived(d) => derive(*d, doc, node),
        };
        match &value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            _ => Some(value),
        }
    }

    /// Evaluate and coerce to an integer.
    pub fn resolve_int(&self, doc: &Document, node: NodeId, ns: &Namespaces) -> Option<i64> {
        match self.resolve(doc, node, ns)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn derive(derivation: Derivation, doc: &Document, node: NodeId) -> Value {
    match derivation {
        Derivation::Tag => doc
            .element(node)
            .map(|el| Value::String(el.local.clone()))
            .unwrap_or(Value::Null),
        Derivation::Depth => Value::from(doc.depth(node)),
        Derivation::Position => {
            let position = doc
                .parent(node)
                .and_then(|p| doc.child_elements(p).position(|c| c == node))
                .map(|i| i + 1)
                .unwrap_or(1);
            Value::from(position)
        }
        Derivation::ChildCount => Value::from(doc.child_elements(node).count()),
        Derivation::TextLength => {
            let text = doc.string_value(node);
            Value::from(text.split_whitespace().collect::<Vec<_>>().join(" ").chars().count())
        }
    }
}

pub fn looks_like_selector(expr: &str) -> bool {
    SELECTOR_PREFIXES.iter().any(|p| expr.starts_with(p))
}

fn compile_selector(expr: &str) -> Result<Selector, ExplodeError> {
    Selector::parse(expr).map_err(|e| ExplodeError::InvalidSelector {
        expr: e.expr,
        reason: e.reason,
    })
}

fn strip_at(attr: &str) -> String {
    attr.strip_prefix('@').unwrap_or(attr).to_string()
}

#[derive(Debug, Clone)]
pub enum RootSelector {
    /// The document's root element itself.
    DocumentRoot,
    Select(Selector),
}

#[derive(Debug, Clone)]
pub struct CompiledRules {
    pub root: RootSelector,
    pub units: Vec<CompiledUnit>,
    pub namespaces: Namespaces,
    pub path_scheme: Option<String>,
    pub path_prefix: Option<String>,
    pub clear_existing: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub kind: String,
    pub select: Selector,
    pub label: Option<Selector>,
    pub label_attr: Option<String>,
    pub ordinal: Option<FieldValue>,
    pub text: Selector,
    pub meta: Vec<(String, FieldValue)>,
    pub path_scheme: Option<String>,
    pub path_attr: Option<String>,
    pub path_prefix: Option<String>,
    pub path_pad: usize,
    pub parent_selector: Option<Selector>,
    pub parent_kinds: Vec<String>,
    pub inherit_parent: bool,
    /// Kinds of sentence-split child units.
    pub sentence_children: Vec<String>,
}

impl MarkupRules {
    pub fn from_json(json: &str) -> Result<Self, ExplodeError> {
        serde_json::from_str(json).map_err(ExplodeError::InvalidRules)
    }

    /// Validate and compile every selector in the ruleset.
    pub fn compile(&self) -> Result<CompiledRules, ExplodeError> {
        if self.units.is_empty() {
            return Err(ExplodeError::MissingRules("units".to_string()));
        }

        let root_expr = self.root_selector.trim();
        let root = if DOCUMENT_ROOT_SELECTORS.contains(&root_expr) || root_expr.is_empty() {
            RootSelector::DocumentRoot
        } else {
            RootSelector::Select(compile_selector(root_expr)?)
        };

        let units = self
            .units
            .iter()
            .enumerate()
            .map(|(i, rule)| rule.compile(i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledRules {
            root,
            units,
            namespaces: self.namespaces.clone(),
            path_scheme: self.path_scheme.clone().filter(|s| !s.is_empty()),
            path_prefix: self.path_prefix.clone().filter(|s| !s.is_empty()),
            clear_existing: self.clear_existing,
        })
    }
}

impl UnitRule {
    fn compile(&self, index: usize) -> Result<CompiledUnit, ExplodeError> {
        if self.kind.trim().is_empty() {
            return Err(ExplodeError::MissingRules(format!("units[{}].kind", index)));
        }
        if self.select.trim().is_empty() {
            return Err(ExplodeError::MissingRules(format!("units[{}].select", index)));
        }

        // `ordinal_path` is always a selector; `ordinal` is classified like meta.
        let ordinal = match (&self.ordinal_path, &self.ordinal) {
            (Some(path), _) if !path.is_empty() => {
                Some(FieldValue::Selector(compile_selector(path)?))
            }
            (_, Some(spec)) => Some(FieldValue::compile(spec.clone())?),
            _ => None,
        };

        let meta = self
            .meta
            .iter()
            .map(|(k, v)| Ok((k.clone(), FieldValue::compile(v.clone())?)))
            .collect::<Result<Vec<_>, ExplodeError>>()?;

        let mut sentence_children = Vec::new();
        for child in &self.children {
            match child.split.as_deref() {
                Some("sentence") => sentence_children.push(child.kind.clone()),
                other => warn!(
                    kind = %self.kind,
                    child = %child.kind,
                    split = ?other,
                    "Ignoring child rule with unsupported split"
                ),
            }
        }

        Ok(CompiledUnit {
            kind: self.kind.clone(),
            select: compile_selector(&self.select)?,
            label: self
                .label_path
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(compile_selector)
                .transpose()?,
            label_attr: self.label_attr.as_deref().map(strip_at),
            ordinal,
            text: compile_selector(
                self.text_path
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_TEXT_SELECTOR),
            )?,
            meta,
            path_scheme: self.path_scheme.clone().filter(|s| !s.is_empty()),
            path_attr: self.path_attr.as_deref().map(strip_at),
            path_prefix: self.path_prefix.clone().filter(|s| !s.is_empty()),
            path_pad: self.path_pad.unwrap_or(3),
            parent_selector: self
                .parent_selector
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(compile_selector)
                .transpose()?,
            parent_kinds: self
                .parent_kind
                .clone()
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            inherit_parent: self.inherit_parent,
            sentence_children,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRecordRules {
    pub path_prefix: String,
    pub scene_gap_seconds: f64,
    /// `None` means camera shots never open a scene.
    pub boundary: Option<Regex>,
}

impl RecordRules {
    pub fn from_json(json: &str) -> Result<Self, ExplodeError> {
        serde_json::from_str(json).map_err(ExplodeError::InvalidRules)
    }

    pub fn compile(&self) -> Result<CompiledRecordRules, ExplodeError> {
        let boundary = self
            .boundary_shot_regex
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(ExplodeError::InvalidRegex)?;
        let path_prefix = crate::path::normalize_path(&self.path_prefix);
        if path_prefix.is_empty() {
            return Err(ExplodeError::MissingRules("path_prefix".to_string()));
        }
        Ok(CompiledRecordRules {
            path_prefix,
            scene_gap_seconds: self.scene_gap_seconds,
            boundary,
        })
    }
}

/// Whether a node is an element (rule selections may also return text).
pub(crate) fn is_element(doc: &Document, node: NodeId) -> bool {
    matches!(doc.node(node).kind, NodeKind::Element(_))
}
