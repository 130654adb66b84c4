//! In-memory [`Store`] implementation for tests.
//!
//! All tables live in one `State` behind a single `RwLock`, so every trait
//! call is atomic: validation happens before the first mutation and a
//! failing call leaves the state untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    duplicate_path, CorpusFilter, DecayReport, MoveBatch, MoveBatchOutcome, ObservationBatch,
    ObservationOutcome, Store, StoreStats,
};
use crate::decay::{decay_row, weight_for_freq, DecayParams};
use crate::graph::GraphError;
use crate::models::{
    Concept, CorpusDocument, CorpusFormat, Edge, Move, Prediction, StoredUnit, Trajectory, Unit,
};
use crate::path::{is_descendant_or_self, PathPattern};
use crate::vector;

#[derive(Default)]
struct State {
    corpus: BTreeMap<(String, String, &'static str), CorpusDocument>,
    units: Vec<StoredUnit>,
    next_unit_id: i64,
    moves: Vec<Move>,
    edges: Vec<Edge>,
    concepts: Vec<Concept>,
    observations: usize,
    trajectories: Vec<Trajectory>,
}

/// In-memory store for tests.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn sorted(mut units: Vec<StoredUnit>) -> Vec<StoredUnit> {
    units.sort_by(|a, b| {
        (a.domain.as_str(), a.doc_key.as_str(), a.path.as_str())
            .cmp(&(b.domain.as_str(), b.doc_key.as_str(), b.path.as_str()))
    });
    units
}

impl State {
    fn write_units(&mut self, domain: &str, doc_key: &str, units: &[Unit]) -> Result<usize> {
        if let Some(path) = duplicate_path(units) {
            bail!("duplicate unit path '{}' in {}/{}", path, domain, doc_key);
        }
        let mut ids: HashMap<&str, i64> = HashMap::new();
        for unit in units {
            let parent_id = unit.parent_path.as_deref().and_then(|p| {
                ids.get(p).copied().or_else(|| {
                    self.units
                        .iter()
                        .find(|u| u.domain == domain && u.doc_key == doc_key && u.path == p)
                        .map(|u| u.id)
                })
            });

            let existing = self
                .units
                .iter_mut()
                .find(|u| u.domain == domain && u.doc_key == doc_key && u.path == unit.path);
            let id = match existing {
                Some(row) => {
                    row.kind = unit.kind.clone();
                    row.label = unit.label.clone();
                    row.ordinal = unit.ordinal;
                    row.text = unit.text.clone();
                    row.meta = unit.meta.clone();
                    row.parent_id = parent_id;
                    row.id
                }
                None => {
                    self.next_unit_id += 1;
                    self.units.push(StoredUnit {
                        id: self.next_unit_id,
                        parent_id,
                        domain: domain.to_string(),
                        doc_key: doc_key.to_string(),
                        kind: unit.kind.clone(),
                        label: unit.label.clone(),
                        path: unit.path.clone(),
                        ordinal: unit.ordinal,
                        text: unit.text.clone(),
                        meta: unit.meta.clone(),
                    });
                    self.next_unit_id
                }
            };
            ids.insert(unit.path.as_str(), id);
        }
        Ok(units.len())
    }

    fn move_by_id(&self, id: i64) -> Option<&Move> {
        usize::try_from(id - 1).ok().and_then(|i| self.moves.get(i))
    }

    fn concept_by_key(&self, key: &str) -> Option<&Concept> {
        self.concepts.iter().find(|c| c.key == key)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_corpus(&self, doc: &CorpusDocument) -> Result<()> {
        let mut state = self.write()?;
        state.corpus.insert(
            (doc.domain.clone(), doc.doc_key.clone(), doc.format.as_str()),
            doc.clone(),
        );
        Ok(())
    }

    async fn get_corpus(
        &self,
        domain: &str,
        doc_key: &str,
        format: CorpusFormat,
    ) -> Result<Option<CorpusDocument>> {
        let state = self.read()?;
        Ok(state
            .corpus
            .get(&(domain.to_string(), doc_key.to_string(), format.as_str()))
            .cloned())
    }

    async fn list_corpus(&self, filter: &CorpusFilter) -> Result<Vec<CorpusDocument>> {
        let state = self.read()?;
        Ok(state
            .corpus
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn replace_units(&self, domain: &str, doc_key: &str, units: &[Unit]) -> Result<usize> {
        if let Some(path) = duplicate_path(units) {
            bail!("duplicate unit path '{}' in {}/{}", path, domain, doc_key);
        }
        let mut state = self.write()?;
        state
            .units
            .retain(|u| !(u.domain == domain && u.doc_key == doc_key));
        state.write_units(domain, doc_key, units)
    }

    async fn upsert_units(&self, domain: &str, doc_key: &str, units: &[Unit]) -> Result<usize> {
        let mut state = self.write()?;
        state.write_units(domain, doc_key, units)
    }

    async fn units_at(&self, path: &str, kind: Option<&str>) -> Result<Vec<StoredUnit>> {
        let state = self.read()?;
        Ok(sorted(
            state
                .units
                .iter()
                .filter(|u| u.path == path && kind.map_or(true, |k| u.kind == k))
                .cloned()
                .collect(),
        ))
    }

    async fn units_under(&self, prefix: &str, kind: Option<&str>) -> Result<Vec<StoredUnit>> {
        let state = self.read()?;
        Ok(sorted(
            state
                .units
                .iter()
                .filter(|u| is_descendant_or_self(&u.path, prefix))
                .filter(|u| kind.map_or(true, |k| u.kind == k))
                .cloned()
                .collect(),
        ))
    }

    async fn units_matching(
        &self,
        pattern: &PathPattern,
        kind: Option<&str>,
    ) -> Result<Vec<StoredUnit>> {
        let state = self.read()?;
        Ok(sorted(
            state
                .units
                .iter()
                .filter(|u| pattern.matches(&u.path))
                .filter(|u| kind.map_or(true, |k| u.kind == k))
                .cloned()
                .collect(),
        ))
    }

    async fn record_moves(&self, batch: &MoveBatch<'_>) -> Result<MoveBatchOutcome> {
        let mut state = self.write()?;

        // Validate every link before the first write.
        for (channel, features) in batch.vectors {
            if let Some(prev) = batch.previous.get(channel) {
                let prev_move = state.move_by_id(prev).ok_or(GraphError::UnknownMove(prev))?;
                if prev_move.features.len() != features.len() {
                    return Err(GraphError::DimensionMismatch {
                        expected: features.len(),
                        found: prev_move.features.len(),
                    }
                    .into());
                }
            }
        }

        let now = timestamp(batch.now);
        let mut outcome = MoveBatchOutcome::default();
        for (channel, features) in batch.vectors {
            let id = state.moves.len() as i64 + 1;
            state.moves.push(Move {
                id,
                session_id: batch.session_id.to_string(),
                domain: batch.domain.to_string(),
                channel: channel.clone(),
                span: batch.span.clone(),
                features: features.clone(),
            });
            outcome.moves.push((channel.clone(), id));

            let Some(prev) = batch.previous.get(channel) else {
                continue;
            };
            let exists = state
                .edges
                .iter()
                .any(|e| e.source_move == prev && e.target_move == id && &e.channel == channel);
            if !exists {
                let source = state.move_by_id(prev).map(|m| m.features.clone()).unwrap_or_default();
                state.edges.push(Edge {
                    source_move: prev,
                    target_move: id,
                    channel: channel.clone(),
                    delta: vector::delta(&source, features, features.len()),
                    weight: 0.0,
                    freq: 0,
                    last_seen: now,
                    context: batch.context.clone(),
                });
                outcome.edges_created += 1;
            }
            if let Some(edge) = state
                .edges
                .iter_mut()
                .find(|e| e.source_move == prev && e.target_move == id && &e.channel == channel)
            {
                edge.freq += 1;
                edge.weight = weight_for_freq(batch.alpha, edge.freq);
                edge.last_seen = now;
                outcome.edges_linked += 1;
            }
        }
        Ok(outcome)
    }

    async fn session_moves(&self, session_id: &str) -> Result<Vec<Move>> {
        let state = self.read()?;
        Ok(state
            .moves
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn edge(&self, source: i64, target: i64, channel: &str) -> Result<Option<Edge>> {
        let state = self.read()?;
        Ok(state
            .edges
            .iter()
            .find(|e| e.source_move == source && e.target_move == target && e.channel == channel)
            .cloned())
    }

    async fn edges_from(&self, source: i64) -> Result<Vec<Edge>> {
        let state = self.read()?;
        Ok(state
            .edges
            .iter()
            .filter(|e| e.source_move == source)
            .cloned()
            .collect())
    }

    async fn upsert_concept(
        &self,
        key: &str,
        label: Option<&str>,
        embedding: &[f32],
    ) -> Result<i64> {
        let mut state = self.write()?;
        if let Some(c) = state.concepts.iter_mut().find(|c| c.key == key) {
            c.label = label.map(str::to_string);
            c.embedding = embedding.to_vec();
            return Ok(c.id);
        }
        let id = state.concepts.len() as i64 + 1;
        state.concepts.push(Concept {
            id,
            key: key.to_string(),
            label: label.map(str::to_string),
            embedding: embedding.to_vec(),
        });
        Ok(id)
    }

    async fn concept(&self, key: &str) -> Result<Option<Concept>> {
        let state = self.read()?;
        Ok(state.concept_by_key(key).cloned())
    }

    async fn record_observation(&self, batch: &ObservationBatch<'_>) -> Result<ObservationOutcome> {
        let mut state = self.write()?;
        let mut resolved = Vec::with_capacity(batch.keys.len());
        for key in batch.keys {
            let concept = state
                .concept_by_key(key)
                .ok_or_else(|| GraphError::UnknownConcept(key.clone()))?;
            resolved.push((concept.id, concept.embedding.clone()));
        }

        state.observations += resolved.len();
        let now = timestamp(batch.now);
        let mut transitions = 0;
        for pair in resolved.windows(2) {
            let (source_id, source_vec) = (pair[0].0, &pair[0].1);
            let (target_id, target_vec) = (pair[1].0, &pair[1].1);
            let exists = state
                .trajectories
                .iter()
                .any(|t| t.source_id == source_id && t.target_id == target_id);
            if !exists {
                state.trajectories.push(Trajectory {
                    source_id,
                    target_id,
                    delta: vector::delta(source_vec, target_vec, batch.dims),
                    weight: 0.0,
                    freq: 0,
                    last_seen: now,
                });
            }
            if let Some(t) = state
                .trajectories
                .iter_mut()
                .find(|t| t.source_id == source_id && t.target_id == target_id)
            {
                t.freq += 1;
                t.weight = weight_for_freq(batch.alpha, t.freq);
                t.last_seen = now;
                transitions += 1;
            }
        }
        Ok(ObservationOutcome {
            observations: resolved.len(),
            transitions,
        })
    }

    async fn trajectory(&self, source_id: i64, target_id: i64) -> Result<Option<Trajectory>> {
        let state = self.read()?;
        Ok(state
            .trajectories
            .iter()
            .find(|t| t.source_id == source_id && t.target_id == target_id)
            .cloned())
    }

    async fn top_successors(&self, source_id: i64, k: usize) -> Result<Vec<Prediction>> {
        let state = self.read()?;
        let mut hits: Vec<Prediction> = state
            .trajectories
            .iter()
            .filter(|t| t.source_id == source_id)
            .filter_map(|t| {
                let target = state.concepts.iter().find(|c| c.id == t.target_id)?;
                Some(Prediction {
                    target_id: t.target_id,
                    target_key: target.key.clone(),
                    weight: t.weight,
                    freq: t.freq,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| b.freq.cmp(&a.freq))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn decay(&self, params: &DecayParams, now: i64) -> Result<DecayReport> {
        let mut state = self.write()?;
        let mut report = DecayReport::default();
        for edge in state.edges.iter_mut() {
            report.edges_scanned += 1;
            if let Some((freq, weight)) =
                decay_row(params, edge.freq, edge.weight, edge.last_seen.timestamp(), now)
            {
                edge.freq = freq;
                edge.weight = weight;
                report.edges_updated += 1;
            }
        }
        for t in state.trajectories.iter_mut() {
            report.trajectories_scanned += 1;
            if let Some((freq, weight)) =
                decay_row(params, t.freq, t.weight, t.last_seen.timestamp(), now)
            {
                t.freq = freq;
                t.weight = weight;
                report.trajectories_updated += 1;
            }
        }
        Ok(report)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.read()?;
        Ok(StoreStats {
            corpus_documents: state.corpus.len() as i64,
            units: state.units.len() as i64,
            moves: state.moves.len() as i64,
            edges: state.edges.len() as i64,
            concepts: state.concepts.len() as i64,
            observations: state.observations as i64,
            trajectories: state.trajectories.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CarryState;
    use crate::models::JsonMap;

    const PARAMS: DecayParams = DecayParams {
        alpha: 0.15,
        half_life_days: 45.0,
    };
    const TAU: i64 = 45 * 86_400;

    fn unit(path: &str, parent: Option<&str>) -> Unit {
        Unit {
            domain: "d".into(),
            doc_key: "k".into(),
            kind: "verse".into(),
            label: None,
            path: path.into(),
            ordinal: 1,
            text: None,
            meta: JsonMap::new(),
            parent_path: parent.map(str::to_string),
        }
    }

    async fn link(store: &InMemoryStore, previous: Option<i64>, now: i64) -> i64 {
        let span = JsonMap::new();
        let context = JsonMap::new();
        let vectors = vec![("c".to_string(), vec![1.0])];
        let mut carry = CarryState::new();
        if let Some(prev) = previous {
            carry.set("c", prev);
        }
        let out = store
            .record_moves(&MoveBatch {
                session_id: "s",
                domain: "d",
                span: &span,
                vectors: &vectors,
                previous: &carry,
                context: &context,
                alpha: 0.15,
                now,
            })
            .await
            .unwrap();
        out.moves[0].1
    }

    async fn observe(store: &InMemoryStore, keys: &[String], now: i64) {
        store
            .record_observation(&ObservationBatch {
                session_id: "s",
                keys,
                outcome: "ok",
                context: None,
                alpha: 0.15,
                dims: 1,
                now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_path_writes_nothing() {
        let store = InMemoryStore::new();
        store
            .replace_units("d", "k", &[unit("V", None), unit("V.1", Some("V"))])
            .await
            .unwrap();

        let clashing = [unit("V", None), unit("V.1", Some("V")), unit("V.1", Some("V"))];
        assert!(store.replace_units("d", "k", &clashing).await.is_err());
        assert!(store.upsert_units("d", "k", &clashing).await.is_err());
        assert_eq!(store.stats().await.unwrap().units, 2);
    }

    #[tokio::test]
    async fn test_decay_ages_move_edges() {
        let store = InMemoryStore::new();
        let first = link(&store, None, 0).await;
        let second = link(&store, Some(first), 0).await;

        let report = store.decay(&PARAMS, 2 * TAU).await.unwrap();
        assert_eq!(report.edges_scanned, 1);
        assert_eq!(report.edges_updated, 1);

        let edge = store.edge(first, second, "c").await.unwrap().unwrap();
        assert_eq!(edge.freq, 0);
        assert_eq!(edge.weight, 0.0);
        assert_eq!(edge.last_seen.timestamp(), 0);
    }

    #[tokio::test]
    async fn test_decay_spares_rows_observed_at_pass_time() {
        let store = InMemoryStore::new();
        store.upsert_concept("a", None, &[1.0]).await.unwrap();
        store.upsert_concept("b", None, &[2.0]).await.unwrap();
        store.upsert_concept("c", None, &[3.0]).await.unwrap();
        let fresh = vec!["a".to_string(), "b".to_string()];
        let stale = vec!["a".to_string(), "c".to_string()];
        for _ in 0..10 {
            observe(&store, &fresh, 0).await;
            observe(&store, &stale, 0).await;
        }
        observe(&store, &fresh, TAU).await;

        let report = store.decay(&PARAMS, TAU).await.unwrap();
        assert_eq!(report.trajectories_scanned, 2);
        assert_eq!(report.trajectories_updated, 1);

        let a = store.concept("a").await.unwrap().unwrap();
        let b = store.concept("b").await.unwrap().unwrap();
        let c = store.concept("c").await.unwrap().unwrap();
        let kept = store.trajectory(a.id, b.id).await.unwrap().unwrap();
        assert_eq!(kept.freq, 11);
        assert!((kept.weight - weight_for_freq(0.15, 11)).abs() < 1e-12);
        let aged = store.trajectory(a.id, c.id).await.unwrap().unwrap();
        assert_eq!(aged.freq, 4);
    }
}
