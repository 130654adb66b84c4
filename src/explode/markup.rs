//! Markup decomposition.
//!
//! Two extractors share one output contract (an ordered [`Unit`] list whose
//! parents precede their children):
//!
//! - [`extract_with_rules`] walks selector results per rule, per root, in
//!   rule-declaration order. Auto ordinals count per kind across the whole
//!   document, so the visiting order decides numbering.
//! - [`extract_generic`] turns every element into a unit with an ordinal
//!   counted per `(parent path, kind)`.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::debug;

use super::rules::{is_element, CompiledRules, CompiledUnit, RootSelector};
use super::{ExplodeError, OrdinalCounters};
use crate::chunk::sentence_split;
use crate::models::{JsonMap, Unit};
use crate::path::{normalize_path, render_template, sanitize_token, TemplateContext};
use crate::xml::selector::Namespaces;
use crate::xml::{Document, NodeId};

/// Attributes consulted, in order, for a generic unit's label.
const LABEL_ATTRS: &[&str] = &["label", "name", "title", "id"];

/// Units already emitted for a node: `(path, kind)`.
type Visited = HashMap<NodeId, (String, String)>;

/// Decompose a document according to a compiled ruleset.
pub fn extract_with_rules(
    doc: &Document,
    rules: &CompiledRules,
    domain: &str,
    doc_key: &str,
) -> Result<Vec<Unit>, ExplodeError> {
    let ns = &rules.namespaces;
    let roots = match &rules.root {
        RootSelector::DocumentRoot => vec![doc.root_element()],
        RootSelector::Select(sel) => {
            let found = sel.select_nodes(doc, doc.root_element(), ns);
            if found.is_empty() {
                return Err(ExplodeError::RootNotFound {
                    selector: sel.source().to_string(),
                });
            }
            found
        }
    };

    let mut counters: OrdinalCounters<String> = OrdinalCounters::default();
    let mut visited: Visited = HashMap::new();
    let mut units = Vec::new();

    for root in roots {
        for rule in &rules.units {
            let nodes = rule.select.select_nodes(doc, root, ns);
            debug!(kind = %rule.kind, selector = rule.select.source(), matched = nodes.len(), "Rule selection");
            for node in nodes.into_iter().filter(|n| is_element(doc, *n)) {
                let unit = build_unit(doc, rules, rule, node, &mut counters, &visited, domain, doc_key);
                visited.insert(node, (unit.path.clone(), unit.kind.clone()));

                if !rule.sentence_children.is_empty() {
                    let sentences = unit.text.as_deref().map(sentence_split).unwrap_or_default();
                    for child_kind in &rule.sentence_children {
                        for (j, sentence) in sentences.iter().enumerate() {
                            let j = j + 1;
                            units.push(Unit {
                                domain: domain.to_string(),
                                doc_key: doc_key.to_string(),
                                kind: child_kind.clone(),
                                label: Some(format!(
                                    "{}-{}",
                                    unit.label.as_deref().unwrap_or(&unit.kind),
                                    j
                                )),
                                path: normalize_path(&format!("{}.{:03}", unit.path, j)),
                                ordinal: j as i64,
                                text: Some(sentence.clone()),
                                meta: JsonMap::new(),
                                parent_path: Some(unit.path.clone()),
                            });
                        }
                    }
                    // Parent goes ahead of its sentences.
                    let at = units.len() - sentences.len() * rule.sentence_children.len();
                    units.insert(at, unit);
                } else {
                    units.push(unit);
                }
            }
        }
    }

    Ok(units)
}

#[allow(clippy::too_many_arguments)]
fn build_unit(
    doc: &Document,
    rules: &CompiledRules,
    rule: &CompiledUnit,
    node: NodeId,
    counters: &mut OrdinalCounters<String>,
    visited: &Visited,
    domain: &str,
    doc_key: &str,
) -> Unit {
    let ns = &rules.namespaces;
    let label = resolve_label(doc, rule, node, ns);

    let mut meta = JsonMap::new();
    for (key, field) in &rule.meta {
        if let Some(value) = field.resolve(doc, node, ns) {
            meta.insert(key.clone(), value);
        }
    }

    let explicit = rule
        .ordinal
        .as_ref()
        .and_then(|f| f.resolve_int(doc, node, ns));
    let ordinal = match explicit {
        Some(n) => {
            counters.observe(rule.kind.clone(), n);
            n
        }
        None => counters.next(rule.kind.clone()),
    };

    let texts = rule.text.strings(doc, node, ns);
    let text = if texts.is_empty() {
        None
    } else {
        Some(texts.join(" "))
    };

    let path = resolve_path(doc, rules, rule, node, ordinal, &meta, label.as_deref());
    let parent_path = resolve_parent(doc, rule, node, visited, ns);

    Unit {
        domain: domain.to_string(),
        doc_key: doc_key.to_string(),
        kind: rule.kind.clone(),
        label,
        path,
        ordinal,
        text,
        meta,
        parent_path,
    }
}

fn resolve_label(doc: &Document, rule: &CompiledUnit, node: NodeId, ns: &Namespaces) -> Option<String> {
    if let Some(label) = rule.label.as_ref().and_then(|s| s.first_string(doc, node, ns)) {
        return Some(label);
    }
    let attr = rule.label_attr.as_deref()?;
    doc.element(node)?
        .attr(attr)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn resolve_path(
    doc: &Document,
    rules: &CompiledRules,
    rule: &CompiledUnit,
    node: NodeId,
    ordinal: i64,
    meta: &JsonMap,
    label: Option<&str>,
) -> String {
    let prefix = rule.path_prefix.as_deref().or(rules.path_prefix.as_deref());

    if let Some(scheme) = rule.path_scheme.as_deref().or(rules.path_scheme.as_deref()) {
        let ctx = TemplateContext {
            ordinal,
            kind: &rule.kind,
            label,
            meta,
        };
        match render_template(scheme, &ctx) {
            Ok(path) if !path.is_empty() => return normalize_path(&path),
            Ok(_) => {}
            Err(e) => debug!(scheme, kind = %rule.kind, error = %e, "Path scheme failed, using fallback"),
        }
    }

    if let Some(attr) = rule.path_attr.as_deref() {
        let value = doc
            .element(node)
            .and_then(|el| el.attr(attr))
            .filter(|v| !v.is_empty());
        if let Some(value) = value {
            let token = sanitize_token(value);
            let path = match prefix {
                Some(p) => format!("{}.{}", p, token),
                None => token,
            };
            return normalize_path(&path);
        }
    }

    let prefix = prefix.unwrap_or(&rule.kind);
    normalize_path(&format!(
        "{}.{:0pad$}",
        prefix,
        ordinal,
        pad = rule.path_pad
    ))
}

fn resolve_parent(
    doc: &Document,
    rule: &CompiledUnit,
    node: NodeId,
    visited: &Visited,
    ns: &Namespaces,
) -> Option<String> {
    if let Some(sel) = &rule.parent_selector {
        let hit = sel
            .select_nodes(doc, node, ns)
            .into_iter()
            .find_map(|candidate| visited.get(&candidate));
        if let Some((path, _)) = hit {
            return Some(path.clone());
        }
    }

    if !rule.parent_kinds.is_empty() {
        let hit = doc.ancestors(node).find_map(|a| {
            visited
                .get(&a)
                .filter(|(_, kind)| rule.parent_kinds.iter().any(|k| k == kind))
        });
        if let Some((path, _)) = hit {
            return Some(path.clone());
        }
    }

    if rule.inherit_parent {
        return doc
            .parent(node)
            .and_then(|p| visited.get(&p))
            .map(|(path, _)| path.clone());
    }

    None
}

/// Ruleset-free decomposition: every element becomes a unit.
pub fn extract_generic(doc: &Document, domain: &str, doc_key: &str) -> Vec<Unit> {
    let mut counters: OrdinalCounters<(Option<String>, String)> = OrdinalCounters::default();
    let mut units = Vec::new();
    let mut stack: Vec<(NodeId, Option<String>)> = vec![(doc.root_element(), None)];

    while let Some((node, parent_path)) = stack.pop() {
        let Some(el) = doc.element(node) else {
            continue;
        };
        let kind = sanitize_token(&el.local.to_lowercase());
        let ordinal = counters.next((parent_path.clone(), kind.clone()));
        let path = match &parent_path {
            Some(p) => format!("{}.{}.{:03}", p, kind, ordinal),
            None => format!("{}.{:03}", kind, ordinal),
        };

        let label = LABEL_ATTRS
            .iter()
            .find_map(|name| el.attrs.iter().find(|a| a.name == *name))
            .map(|a| a.value.clone())
            .filter(|v| !v.is_empty());
        let skip: BTreeSet<&str> = LABEL_ATTRS.iter().copied().collect();
        let mut meta = JsonMap::new();
        for attr in el.attrs.iter().filter(|a| !skip.contains(a.name.as_str())) {
            meta.insert(attr.name.clone(), Value::String(attr.value.clone()));
        }
        meta.insert("tag".to_string(), Value::String(el.local.clone()));

        let children: Vec<NodeId> = doc.child_elements(node).collect();
        for child in children.into_iter().rev() {
            stack.push((child, Some(path.clone())));
        }

        units.push(Unit {
            domain: domain.to_string(),
            doc_key: doc_key.to_string(),
            kind,
            label,
            path,
            ordinal,
            text: doc.direct_text(node),
            meta,
            parent_path,
        });
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explode::rules::MarkupRules;

    const PROVERBS: &str = r#"<book title="Proverbs">
  <chapter n="1" name="Chapter One!">
    <verse n="1">The fear of the Lord. It is the beginning.</verse>
    <verse n="2">Hear, my son.</verse>
  </chapter>
  <chapter n="2" name="Chapter Two">
    <verse n="1">Wisdom cries aloud.</verse>
  </chapter>
</book>"#;

    fn run(rules: &str) -> Result<Vec<Unit>, ExplodeError> {
        let doc = Document::parse(PROVERBS).unwrap();
        let compiled = MarkupRules::from_json(rules)?.compile()?;
        extract_with_rules(&doc, &compiled, "prv", "proverbs")
    }

    fn paths(units: &[Unit]) -> Vec<&str> {
        units.iter().map(|u| u.path.as_str()).collect()
    }

    #[test]
    fn test_rule_driven_paths_and_parents() {
        let units = run(r#"{
            "path_prefix": "PRV",
            "units": [
              {"select": ".//chapter", "kind": "chapter", "path_attr": "@n", "label_attr": "@name"},
              {"select": ".//verse", "kind": "verse", "parent_kind": "chapter",
               "path_scheme": "PRV.{meta[ch]}.{ordinal:02d}",
               "meta": {"ch": "../@n"}, "ordinal_path": "@n"}
            ]}"#)
        .unwrap();
        assert_eq!(
            paths(&units),
            vec!["PRV.1", "PRV.2", "PRV.1.01", "PRV.1.02", "PRV.2.01"]
        );
        assert_eq!(units[0].label.as_deref(), Some("Chapter One!"));
        assert_eq!(units[2].parent_path.as_deref(), Some("PRV.1"));
        assert_eq!(units[4].parent_path.as_deref(), Some("PRV.2"));
        assert_eq!(units[0].parent_path, None);
    }

    #[test]
    fn test_auto_ordinals_count_per_kind_across_document() {
        let units = run(r#"{"units": [{"select": ".//verse", "kind": "verse"}]}"#).unwrap();
        assert_eq!(paths(&units), vec!["verse.001", "verse.002", "verse.003"]);
        assert_eq!(units[2].text.as_deref(), Some("Wisdom cries aloud."));
    }

    #[test]
    fn test_explicit_ordinal_advances_counter() {
        let units = run(
            r#"{"units": [
                {"select": "chapter[1]", "kind": "c", "ordinal": 5},
                {"select": "chapter[2]", "kind": "c"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(paths(&units), vec!["c.005", "c.006"]);
    }

    #[test]
    fn test_scheme_failure_falls_back() {
        let units = run(
            r#"{"units": [{"select": ".//chapter", "kind": "chapter",
                "path_scheme": "X.{meta[missing]}", "path_prefix": "BK"}]}"#,
        )
        .unwrap();
        assert_eq!(paths(&units), vec!["BK.001", "BK.002"]);
    }

    #[test]
    fn test_attribute_path_is_sanitized() {
        let units = run(
            r#"{"path_prefix": "BK", "units": [{"select": ".//chapter", "kind": "chapter", "path_attr": "name"}]}"#,
        )
        .unwrap();
        assert_eq!(paths(&units), vec!["BK.Chapter_One", "BK.Chapter_Two"]);
        for unit in &units {
            for segment in unit.path.split('.') {
                assert!(!segment.is_empty());
                assert!(segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
            }
        }
    }

    #[test]
    fn test_sentence_children_follow_parent() {
        let units = run(
            r#"{"units": [{"select": "chapter[1]/verse[1]", "kind": "verse",
                "children": [{"kind": "sentence", "split": "sentence"}]}]}"#,
        )
        .unwrap();
        assert_eq!(paths(&units), vec!["verse.001", "verse.001.001", "verse.001.002"]);
        assert_eq!(units[1].label.as_deref(), Some("verse-1"));
        assert_eq!(units[2].text.as_deref(), Some("It is the beginning."));
        assert_eq!(units[2].parent_path.as_deref(), Some("verse.001"));
    }

    #[test]
    fn test_inherit_and_selector_parents() {
        let units = run(
            r#"{"units": [
                {"select": "chapter", "kind": "chapter"},
                {"select": "chapter/verse", "kind": "verse", "inherit_parent": true},
                {"select": ".//verse", "kind": "echo", "parent_selector": "ancestor::chapter"}
            ]}"#,
        )
        .unwrap();
        let verse = units.iter().find(|u| u.kind == "verse").unwrap();
        assert_eq!(verse.parent_path.as_deref(), Some("chapter.001"));
        let echo = units.iter().filter(|u| u.kind == "echo").last().unwrap();
        assert_eq!(echo.parent_path.as_deref(), Some("chapter.002"));
    }

    #[test]
    fn test_root_not_found_names_selector() {
        let err = run(r#"{"root_selector": "/missing", "units": [{"select": "x", "kind": "x"}]}"#)
            .unwrap_err();
        match err {
            ExplodeError::RootNotFound { selector } => assert_eq!(selector, "/missing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_generic_extractor() {
        let doc = Document::parse(PROVERBS).unwrap();
        let units = extract_generic(&doc, "prv", "proverbs");
        assert_eq!(units.len(), 6);
        assert_eq!(units[0].path, "book.001");
        assert_eq!(units[0].label.as_deref(), Some("Proverbs"));
        assert_eq!(units[1].path, "book.001.chapter.001");
        assert_eq!(units[1].label.as_deref(), Some("Chapter One!"));
        assert_eq!(units[1].meta.get("n"), Some(&Value::String("1".into())));
        assert_eq!(units[1].meta.get("tag"), Some(&Value::String("chapter".into())));
        assert_eq!(units[2].path, "book.001.chapter.001.verse.001");
        assert_eq!(units[3].path, "book.001.chapter.001.verse.002");
        assert_eq!(units[4].path, "book.001.chapter.002");
        // Counters are scoped per parent.
        assert_eq!(units[5].path, "book.001.chapter.002.verse.001");
        assert_eq!(units[5].parent_path.as_deref(), Some("book.001.chapter.002"));
    }
}
