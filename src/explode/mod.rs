//! Unit extraction engine.
//!
//! Turns a stored corpus document into an ordered list of [`Unit`]s and
//! persists it through the [`Store`]:
//!
//! ```text
//! corpus row ──▶ parse ──▶ extractor ──▶ Vec<Unit> ──▶ Store::replace_units
//!                 │            │
//!                 │            ├── markup::extract_with_rules (ruleset)
//!                 │            ├── markup::extract_generic    (no ruleset)
//!                 │            └── records::segment_records   (JSONL)
//!                 └── xml::Document / line-delimited JSON
//! ```
//!
//! Rulesets are compiled before the store is touched, so configuration
//! errors never leave partial writes behind.

pub mod markup;
pub mod records;
pub mod rules;

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::models::{CorpusFormat, Unit};
use crate::store::{duplicate_path, Store};
use crate::xml::Document;
use rules::{MarkupRules, RecordRules};

#[derive(Debug, Error)]
pub enum ExplodeError {
    #[error("invalid markup: {0}")]
    InvalidMarkup(String),
    #[error("root selector '{selector}' yielded no nodes")]
    RootNotFound { selector: String },
    #[error("invalid selector '{expr}': {reason}")]
    InvalidSelector { expr: String, reason: String },
    #[error("ruleset is missing required field '{0}'")]
    MissingRules(String),
    #[error("invalid ruleset: {0}")]
    InvalidRules(#[source] serde_json::Error),
    #[error("unit path '{path}' is produced more than once")]
    DuplicatePath { path: String },
    #[error("invalid boundary regex: {0}")]
    InvalidRegex(#[source] regex::Error),
    #[error("no {format} corpus document for {domain}/{doc_key}")]
    DocumentNotFound {
        domain: String,
        doc_key: String,
        format: &'static str,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Monotonic ordinal counters keyed by scope.
#[derive(Debug)]
pub struct OrdinalCounters<K> {
    counts: HashMap<K, i64>,
}

impl<K> Default for OrdinalCounters<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> OrdinalCounters<K> {
    /// Advance the counter for `key` and return the new value (first is 1).
    pub fn next(&mut self, key: K) -> i64 {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Record an explicit ordinal so later automatic ones continue past it.
    pub fn observe(&mut self, key: K, ordinal: i64) {
        let count = self.counts.entry(key).or_insert(0);
        *count = (*count).max(ordinal);
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkupSummary {
    pub inserted_count: usize,
    pub counts_by_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub scene_count: usize,
    pub unit_count: usize,
    pub skipped_lines: usize,
}

/// Decompose a stored markup document with a ruleset and persist its units.
pub async fn explode_markup(
    store: &dyn Store,
    domain: &str,
    doc_key: &str,
    rules: &MarkupRules,
) -> Result<MarkupSummary, ExplodeError> {
    let compiled = rules.compile()?;
    let payload = load_payload(store, domain, doc_key, CorpusFormat::Markup).await?;
    let doc = Document::parse(&payload).map_err(|e| ExplodeError::InvalidMarkup(e.0))?;

    let units = markup::extract_with_rules(&doc, &compiled, domain, doc_key)?;
    ensure_unique_paths(&units)?;
    let inserted_count = if compiled.clear_existing {
        store.replace_units(domain, doc_key, &units).await?
    } else {
        store.upsert_units(domain, doc_key, &units).await?
    };

    let counts_by_kind = count_by_kind(&units);
    info!(domain, doc_key, inserted = inserted_count, kinds = counts_by_kind.len(), "Exploded markup");
    Ok(MarkupSummary {
        inserted_count,
        counts_by_kind,
    })
}

/// Segment a stored record stream into scenes and persist its units.
pub async fn explode_records(
    store: &dyn Store,
    domain: &str,
    doc_key: &str,
    rules: &RecordRules,
) -> Result<RecordSummary, ExplodeError> {
    let compiled = rules.compile()?;
    let payload = load_payload(store, domain, doc_key, CorpusFormat::Records).await?;

    let seg = records::segment_records(&payload, &compiled, domain, doc_key);
    ensure_unique_paths(&seg.units)?;
    let unit_count = store.replace_units(domain, doc_key, &seg.units).await?;

    info!(
        domain,
        doc_key,
        scenes = seg.scene_count,
        units = unit_count,
        skipped = seg.skipped_lines,
        "Exploded record stream"
    );
    Ok(RecordSummary {
        scene_count: seg.scene_count,
        unit_count,
        skipped_lines: seg.skipped_lines,
    })
}

async fn load_payload(
    store: &dyn Store,
    domain: &str,
    doc_key: &str,
    format: CorpusFormat,
) -> Result<String, ExplodeError> {
    store
        .get_corpus(domain, doc_key, format)
        .await?
        .map(|doc| doc.payload)
        .ok_or_else(|| ExplodeError::DocumentNotFound {
            domain: domain.to_string(),
            doc_key: doc_key.to_string(),
            format: format.as_str(),
        })
}

fn ensure_unique_paths(units: &[Unit]) -> Result<(), ExplodeError> {
    match duplicate_path(units) {
        Some(path) => Err(ExplodeError::DuplicatePath {
            path: path.to_string(),
        }),
        None => Ok(()),
    }
}

pub fn count_by_kind(units: &[Unit]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for unit in units {
        *counts.entry(unit.kind.clone()).or_insert(0) += 1;
    }
    counts
}
