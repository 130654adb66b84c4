//! Storage abstraction for Trajectory Harness.
//!
//! The [`Store`] trait covers every persistence operation the pipeline
//! needs: corpus payloads, the unit tree, moves and edges, concept
//! trajectories, and the decay pass. [`sqlite::SqliteStore`] is the
//! production backend; [`memory::InMemoryStore`] backs tests.
//!
//! Multi-row writes that must be atomic (a unit list replacement, one text
//! unit's moves and edges, one observation sequence) are single trait calls,
//! so each backend can wrap them in its own transaction.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::decay::DecayParams;
use crate::graph::CarryState;
use crate::models::{
    Concept, CorpusDocument, CorpusFormat, Edge, JsonMap, Move, Prediction, StoredUnit, Trajectory,
    Unit,
};
use crate::path::PathPattern;

/// Selects stored corpus documents.
#[derive(Debug, Clone, Default)]
pub struct CorpusFilter {
    pub domain: Option<String>,
    pub doc_key: Option<String>,
    pub format: Option<CorpusFormat>,
}

impl CorpusFilter {
    pub fn matches(&self, doc: &CorpusDocument) -> bool {
        self.domain.as_deref().map_or(true, |d| d == doc.domain)
            && self.doc_key.as_deref().map_or(true, |k| k == doc.doc_key)
            && self.format.map_or(true, |f| f == doc.format)
    }
}

/// First path that occurs more than once in `units`.
pub fn duplicate_path(units: &[Unit]) -> Option<&str> {
    let mut seen = std::collections::HashSet::new();
    units
        .iter()
        .map(|u| u.path.as_str())
        .find(|path| !seen.insert(*path))
}

/// One text unit's worth of moves, written atomically.
pub struct MoveBatch<'a> {
    pub session_id: &'a str,
    pub domain: &'a str,
    pub span: &'a JsonMap,
    /// One feature vector per channel, in channel order.
    pub vectors: &'a [(String, Vec<f32>)],
    /// Previous move per channel; an edge is linked for each hit.
    pub previous: &'a CarryState,
    pub context: &'a JsonMap,
    pub alpha: f64,
    /// Unix seconds recorded as the edges' `last_seen`.
    pub now: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MoveBatchOutcome {
    /// `(channel, move id)` in the order written.
    pub moves: Vec<(String, i64)>,
    /// Edges newly inserted (existing edges only had their counters advanced).
    pub edges_created: usize,
    /// Edges inserted or advanced.
    pub edges_linked: usize,
}

/// One observed concept sequence, written atomically.
pub struct ObservationBatch<'a> {
    pub session_id: &'a str,
    pub keys: &'a [String],
    pub outcome: &'a str,
    pub context: Option<&'a JsonMap>,
    pub alpha: f64,
    pub dims: usize,
    pub now: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservationOutcome {
    pub observations: usize,
    pub transitions: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecayReport {
    pub edges_scanned: usize,
    pub edges_updated: usize,
    pub trajectories_scanned: usize,
    pub trajectories_updated: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub corpus_documents: i64,
    pub units: i64,
    pub moves: i64,
    pub edges: i64,
    pub concepts: i64,
    pub observations: i64,
    pub trajectories: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put_corpus`](Store::put_corpus) | Insert or replace a raw corpus payload |
/// | [`replace_units`](Store::replace_units) | Delete a document's units, insert a new list |
/// | [`upsert_units`](Store::upsert_units) | Insert or update units in place |
/// | [`units_at`](Store::units_at) | Exact-path lookup across documents |
/// | [`units_under`](Store::units_under) | Descendant-or-self of a path prefix |
/// | [`units_matching`](Store::units_matching) | Pattern lookup across documents |
/// | [`record_moves`](Store::record_moves) | Moves plus chained edges for one text unit |
/// | [`record_observation`](Store::record_observation) | Observations plus concept trajectories |
/// | [`decay`](Store::decay) | Age edge and trajectory counters |
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_corpus(&self, doc: &CorpusDocument) -> Result<()>;

    async fn get_corpus(
        &self,
        domain: &str,
        doc_key: &str,
        format: CorpusFormat,
    ) -> Result<Option<CorpusDocument>>;

    /// Matching documents ordered by `(domain, doc_key)`.
    async fn list_corpus(&self, filter: &CorpusFilter) -> Result<Vec<CorpusDocument>>;

    /// Delete every unit of `(domain, doc_key)` and insert `units` in order,
    /// resolving `parent_path` against units inserted earlier in the call.
    /// Returns the number inserted. A path repeated within `units` fails the
    /// call with nothing written.
    async fn replace_units(&self, domain: &str, doc_key: &str, units: &[Unit]) -> Result<usize>;

    /// Like [`replace_units`](Store::replace_units) without the delete:
    /// existing paths are updated in place, parents may resolve to rows
    /// from earlier runs.
    async fn upsert_units(&self, domain: &str, doc_key: &str, units: &[Unit]) -> Result<usize>;

    async fn units_at(&self, path: &str, kind: Option<&str>) -> Result<Vec<StoredUnit>>;

    async fn units_under(&self, prefix: &str, kind: Option<&str>) -> Result<Vec<StoredUnit>>;

    async fn units_matching(
        &self,
        pattern: &PathPattern,
        kind: Option<&str>,
    ) -> Result<Vec<StoredUnit>>;

    /// Insert one move per vector and link each to its channel's previous
    /// move. Fails with [`GraphError::UnknownMove`](crate::graph::GraphError)
    /// when a previous move is missing; nothing is written on failure.
    async fn record_moves(&self, batch: &MoveBatch<'_>) -> Result<MoveBatchOutcome>;

    /// Moves of a session in insertion order.
    async fn session_moves(&self, session_id: &str) -> Result<Vec<Move>>;

    async fn edge(&self, source: i64, target: i64, channel: &str) -> Result<Option<Edge>>;

    async fn edges_from(&self, source: i64) -> Result<Vec<Edge>>;

    /// Insert or update a concept by key; returns its id.
    async fn upsert_concept(&self, key: &str, label: Option<&str>, embedding: &[f32])
        -> Result<i64>;

    async fn concept(&self, key: &str) -> Result<Option<Concept>>;

    /// Fails with [`GraphError::UnknownConcept`](crate::graph::GraphError)
    /// if any key is unregistered; nothing is written on failure.
    async fn record_observation(&self, batch: &ObservationBatch<'_>) -> Result<ObservationOutcome>;

    async fn trajectory(&self, source_id: i64, target_id: i64) -> Result<Option<Trajectory>>;

    /// Successors of a concept ordered by weight, then frequency.
    async fn top_successors(&self, source_id: i64, k: usize) -> Result<Vec<Prediction>>;

    /// Age every edge and trajectory as of `now` (unix seconds).
    async fn decay(&self, params: &DecayParams, now: i64) -> Result<DecayReport>;

    async fn stats(&self) -> Result<StoreStats>;
}
