//! Ingestion entry points.
//!
//! Each entry point drives [`MoveGraphBuilder::ingest`] once per unit of
//! text, in order, threading a [`CarryState`] so edges chain within one
//! document or session:
//!
//! ```text
//! ingest_text               raw text ──▶ sentences ──▶ moves
//! ingest_units_by_selector  stored units (by path) ──▶ moves, per document
//! process_corpus            corpus markup ──▶ generic units ──▶ moves
//! ```
//!
//! Units are processed one at a time. Each unit's moves and edges commit in
//! their own transaction, so a failure leaves earlier units in place.

use std::cmp::Ordering;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::sentence_split;
use crate::explode::markup::extract_generic;
use crate::graph::{CarryState, MoveGraphBuilder, TextUnit};
use crate::models::{CorpusFormat, JsonMap, StoredUnit};
use crate::path::{compare_paths, is_wildcard, PathPattern};
use crate::store::CorpusFilter;
use crate::xml::Document;

#[derive(Debug, Clone, Serialize)]
pub struct TextIngestSummary {
    pub session_id: String,
    pub sentence_count: usize,
    pub move_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitIngestSummary {
    pub unit_count: usize,
    pub move_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorpusSummary {
    pub processed_units: usize,
    pub documents_seen: usize,
    pub documents_failed: usize,
}

/// `{domain}_{unix_millis}_{6 hex chars}`.
pub fn default_session_id(domain: &str) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("{}_{}_{}", domain, Utc::now().timestamp_millis(), suffix)
}

fn span(entries: &[(&str, Value)]) -> JsonMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Split `text` into sentences and chain one set of moves per sentence.
pub async fn ingest_text(
    builder: &MoveGraphBuilder,
    text: &str,
    domain: &str,
    session_id: Option<&str>,
    channels: Option<&[String]>,
) -> Result<TextIngestSummary> {
    let session_id = match session_id {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        _ => default_session_id(domain),
    };
    let sentences = sentence_split(text);

    let mut carry = CarryState::new();
    let mut move_count = 0;
    let mut edge_count = 0;
    for (i, sentence) in sentences.iter().enumerate() {
        let step = builder
            .ingest(
                TextUnit {
                    text: sentence,
                    session_id: &session_id,
                    domain,
                    channels,
                    span: span(&[
                        ("sent", json!(i)),
                        ("ingest_source", json!("ingest_text")),
                    ]),
                },
                carry,
            )
            .await
            .with_context(|| format!("Failed to ingest sentence {} of session {}", i, session_id))?;
        move_count += step.moves_created;
        edge_count += step.edges_linked;
        carry = step.carry;
    }

    info!(
        session = %session_id,
        sentences = sentences.len(),
        moves = move_count,
        edges = edge_count,
        "Ingested text"
    );
    Ok(TextIngestSummary {
        session_id,
        sentence_count: sentences.len(),
        move_count,
        edge_count,
    })
}

/// Select stored units by path and chain their text into moves.
///
/// A wildcard selector is matched as a path pattern. A plain path with a
/// kind filter selects that kind anywhere under the path; without one it
/// is an exact lookup. Edges chain per document in path order.
pub async fn ingest_units_by_selector(
    builder: &MoveGraphBuilder,
    selector: &str,
    kind: Option<&str>,
    channels: Option<&[String]>,
) -> Result<UnitIngestSummary> {
    let store = builder.store();
    let mut units = if is_wildcard(selector) {
        let pattern = PathPattern::parse(selector)?;
        store.units_matching(&pattern, kind).await?
    } else if kind.is_some() {
        store.units_under(selector, kind).await?
    } else {
        store.units_at(selector, None).await?
    };
    units.sort_by(document_order);

    let mut summary = UnitIngestSummary {
        unit_count: units.len(),
        ..UnitIngestSummary::default()
    };

    let mut current: Option<(&str, &str)> = None;
    let mut carry = CarryState::new();
    for unit in &units {
        let doc = (unit.domain.as_str(), unit.doc_key.as_str());
        if current != Some(doc) {
            current = Some(doc);
            carry = CarryState::new();
        }
        let Some(text) = unit.text.as_deref() else {
            continue;
        };
        let session_id = format!("{}@{}", selector, unit.doc_key);
        let step = builder
            .ingest(
                TextUnit {
                    text,
                    session_id: &session_id,
                    domain: &unit.domain,
                    channels,
                    span: span(&[
                        ("unit_id", json!(unit.id)),
                        ("path", json!(unit.path)),
                        ("kind", json!(unit.kind)),
                        ("label", json!(unit.label)),
                    ]),
                },
                carry,
            )
            .await
            .with_context(|| format!("Failed to ingest unit {}", unit.path))?;
        summary.move_count += step.moves_created;
        summary.edge_count += step.edges_linked;
        carry = step.carry;
    }

    info!(
        selector,
        units = summary.unit_count,
        moves = summary.move_count,
        edges = summary.edge_count,
        "Ingested units"
    );
    Ok(summary)
}

fn document_order(a: &StoredUnit, b: &StoredUnit) -> Ordering {
    (a.domain.as_str(), a.doc_key.as_str())
        .cmp(&(b.domain.as_str(), b.doc_key.as_str()))
        .then_with(|| compare_paths(&a.path, &b.path))
}

/// Decompose stored markup documents with the generic extractor, replace
/// their units, and write moves for every unit in document order.
///
/// Each document gets session `{session_prefix}_{session_hint or doc_key}`.
/// A document that fails to parse is logged and skipped.
pub async fn process_corpus(
    builder: &MoveGraphBuilder,
    filter: &CorpusFilter,
    session_prefix: &str,
) -> Result<CorpusSummary> {
    if filter.domain.is_none() && filter.doc_key.is_none() {
        bail!("Provide a domain or doc_key to select corpus documents");
    }
    let filter = CorpusFilter {
        format: Some(CorpusFormat::Markup),
        ..filter.clone()
    };
    let store = builder.store();
    let docs = store.list_corpus(&filter).await?;
    if docs.is_empty() {
        bail!("No matching corpus documents");
    }

    let mut summary = CorpusSummary {
        documents_seen: docs.len(),
        ..CorpusSummary::default()
    };

    for doc in &docs {
        let parsed = match Document::parse(&doc.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(domain = %doc.domain, doc_key = %doc.doc_key, error = %e.0, "Skipping unparseable document");
                summary.documents_failed += 1;
                continue;
            }
        };
        let units = extract_generic(&parsed, &doc.domain, &doc.doc_key);
        if units.is_empty() {
            continue;
        }
        store
            .replace_units(&doc.domain, &doc.doc_key, &units)
            .await
            .with_context(|| format!("Failed to store units for {}/{}", doc.domain, doc.doc_key))?;

        let session_id = format!(
            "{}_{}",
            session_prefix,
            doc.session_hint().unwrap_or(&doc.doc_key)
        );
        let mut carry = CarryState::new();
        for unit in &units {
            let Some(text) = unit.text.as_deref() else {
                continue;
            };
            let step = builder
                .ingest(
                    TextUnit {
                        text,
                        session_id: &session_id,
                        domain: &doc.domain,
                        channels: None,
                        span: span(&[
                            ("doc_key", json!(doc.doc_key)),
                            ("path", json!(unit.path)),
                            ("kind", json!(unit.kind)),
                            ("ordinal", json!(unit.ordinal)),
                        ]),
                    },
                    carry,
                )
                .await
                .with_context(|| format!("Failed to ingest unit {}", unit.path))?;
            carry = step.carry;
        }
        summary.processed_units += units.len();
        info!(domain = %doc.domain, doc_key = %doc.doc_key, units = units.len(), session = %session_id, "Processed corpus document");
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelRegistry;
    use crate::models::{CorpusDocument, Unit};
    use crate::store::memory::InMemoryStore;
    use crate::store::Store;
    use std::sync::Arc;

    fn builder() -> MoveGraphBuilder {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        MoveGraphBuilder::new(store, ChannelRegistry::with_builtin(16), 0.15)
    }

    fn only(name: &str) -> Vec<String> {
        vec![name.to_string()]
    }

    fn unit(doc_key: &str, path: &str, kind: &str, text: Option<&str>) -> Unit {
        Unit {
            domain: "bible".into(),
            doc_key: doc_key.into(),
            kind: kind.into(),
            label: None,
            path: path.into(),
            ordinal: 1,
            text: text.map(str::to_string),
            meta: JsonMap::new(),
            parent_path: None,
        }
    }

    #[test]
    fn test_default_session_id_shape() {
        let id = default_session_id("film");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "film");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_ingest_text_counts() {
        let b = builder();
        let channels = only("rhetoric");
        let summary = ingest_text(
            &b,
            "One sentence. Another one! A third?",
            "test",
            Some("s1"),
            Some(channels.as_slice()),
        )
        .await
        .unwrap();
        assert_eq!(summary.session_id, "s1");
        assert_eq!(summary.sentence_count, 3);
        assert_eq!(summary.move_count, 3);
        assert_eq!(summary.edge_count, 2);

        let moves = b.store().session_moves("s1").await.unwrap();
        assert_eq!(moves[1].span.get("sent"), Some(&json!(1)));
        assert_eq!(moves[1].span.get("ingest_source"), Some(&json!("ingest_text")));
    }

    #[tokio::test]
    async fn test_ingest_text_empty_is_zero() {
        let b = builder();
        let summary = ingest_text(&b, "   ", "test", None, None).await.unwrap();
        assert_eq!(summary.sentence_count, 0);
        assert_eq!(summary.move_count, 0);
        assert!(summary.session_id.starts_with("test_"));
    }

    #[tokio::test]
    async fn test_units_chain_per_document() {
        let b = builder();
        let store = b.store();
        store
            .replace_units(
                "bible",
                "a",
                &[
                    unit("a", "B.c1", "chapter", None),
                    unit("a", "B.c1.v1", "verse", Some("In the beginning.")),
                    unit("a", "B.c1.v2", "verse", Some("And the earth.")),
                    unit("a", "B.c1.v3", "verse", Some("Third.")),
                ],
            )
            .await
            .unwrap();
        store
            .replace_units(
                "bible",
                "b",
                &[unit("b", "B.c1.v1", "verse", Some("Other book."))],
            )
            .await
            .unwrap();

        let channels = only("lexico_semantic");
        let summary =
            ingest_units_by_selector(&b, "B.c1", Some("verse"), Some(channels.as_slice()))
                .await
                .unwrap();
        assert_eq!(summary.unit_count, 4);
        assert_eq!(summary.move_count, 4);
        // Three verses in doc "a" chain twice; doc "b" starts fresh.
        assert_eq!(summary.edge_count, 2);

        let moves = store.session_moves("B.c1@a").await.unwrap();
        let paths: Vec<&Value> = moves.iter().filter_map(|m| m.span.get("path")).collect();
        assert_eq!(paths, vec!["B.c1.v1", "B.c1.v2", "B.c1.v3"]);
    }

    #[tokio::test]
    async fn test_units_by_wildcard() {
        let b = builder();
        b.store()
            .replace_units(
                "bible",
                "a",
                &[
                    unit("a", "B.c1.v1", "verse", Some("One.")),
                    unit("a", "B.c2.v1", "verse", Some("Two.")),
                    unit("a", "B.c2.v2", "verse", Some("Three.")),
                ],
            )
            .await
            .unwrap();
        let channels = only("imagery");
        let summary = ingest_units_by_selector(&b, "B.*.v1", None, Some(channels.as_slice()))
            .await
            .unwrap();
        assert_eq!(summary.unit_count, 2);
        assert_eq!(summary.edge_count, 1);
    }

    #[tokio::test]
    async fn test_process_corpus_uses_session_hint() {
        let b = builder();
        let mut meta = JsonMap::new();
        meta.insert("session_hint".into(), json!("gen"));
        b.store()
            .put_corpus(&CorpusDocument {
                domain: "bible".into(),
                doc_key: "genesis".into(),
                format: CorpusFormat::Markup,
                payload: "<book><chapter><verse>In the beginning.</verse><verse>Light.</verse></chapter></book>".into(),
                meta,
            })
            .await
            .unwrap();
        b.store()
            .put_corpus(&CorpusDocument {
                domain: "bible".into(),
                doc_key: "broken".into(),
                format: CorpusFormat::Markup,
                payload: "<book><chapter>".into(),
                meta: JsonMap::new(),
            })
            .await
            .unwrap();

        let filter = CorpusFilter {
            domain: Some("bible".into()),
            ..CorpusFilter::default()
        };
        let summary = process_corpus(&b, &filter, "CORPUS").await.unwrap();
        assert_eq!(summary.documents_seen, 2);
        assert_eq!(summary.documents_failed, 1);
        assert_eq!(summary.processed_units, 4);

        let moves = b.store().session_moves("CORPUS_gen").await.unwrap();
        assert!(!moves.is_empty());
        assert_eq!(moves[0].span.get("doc_key"), Some(&json!("genesis")));
    }

    #[tokio::test]
    async fn test_process_corpus_requires_selection() {
        let b = builder();
        assert!(process_corpus(&b, &CorpusFilter::default(), "CORPUS")
            .await
            .is_err());
        let filter = CorpusFilter {
            domain: Some("none".into()),
            ..CorpusFilter::default()
        };
        assert!(process_corpus(&b, &filter, "CORPUS").await.is_err());
    }
}
