//! Concept-level trajectories.
//!
//! The coarse peer of the move graph: callers register concepts with a
//! fixed-dimension embedding, then report observed concept sequences. Each
//! adjacent pair in a sequence advances a concept-to-concept trajectory with
//! the same insert-if-absent plus increment pattern move edges use.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::models::{JsonMap, Prediction};
use crate::store::{ObservationBatch, ObservationOutcome, Store};
use crate::vector::fit_dims;

pub struct ConceptTracker {
    store: Arc<dyn Store>,
    dims: usize,
    alpha: f64,
}

impl ConceptTracker {
    pub fn new(store: Arc<dyn Store>, dims: usize, alpha: f64) -> Self {
        Self { store, dims, alpha }
    }

    /// Insert or update a concept. The embedding is zero-padded or truncated
    /// to the configured dimensionality.
    pub async fn register_concept(
        &self,
        key: &str,
        label: Option<&str>,
        embedding: Vec<f32>,
    ) -> Result<i64> {
        if key.trim().is_empty() {
            bail!("concept key must not be empty");
        }
        let embedding = fit_dims(embedding, self.dims);
        let id = self.store.upsert_concept(key, label, &embedding).await?;
        debug!(key, id, "Registered concept");
        Ok(id)
    }

    /// Record one observed sequence of concept keys.
    ///
    /// Fails with [`GraphError::UnknownConcept`](crate::graph::GraphError)
    /// if any key is unregistered, writing nothing.
    pub async fn observe(
        &self,
        session_id: &str,
        keys: &[String],
        outcome: &str,
        context: Option<&JsonMap>,
    ) -> Result<ObservationOutcome> {
        let result = self
            .store
            .record_observation(&ObservationBatch {
                session_id,
                keys,
                outcome,
                context,
                alpha: self.alpha,
                dims: self.dims,
                now: Utc::now().timestamp(),
            })
            .await?;
        info!(
            session = session_id,
            observations = result.observations,
            transitions = result.transitions,
            "Recorded observation"
        );
        Ok(result)
    }

    /// Top `k` successors of `key` by weight, then frequency. Unknown keys
    /// have no successors.
    pub async fn predict_next(&self, key: &str, k: usize) -> Result<Vec<Prediction>> {
        let Some(concept) = self.store.concept(key).await? else {
            return Ok(Vec::new());
        };
        self.store.top_successors(concept.id, k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphError;
    use crate::store::memory::InMemoryStore;

    fn tracker() -> ConceptTracker {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        ConceptTracker::new(store, 4, 0.15)
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_fits_dims() {
        let t = tracker();
        t.register_concept("short", None, vec![1.0]).await.unwrap();
        t.register_concept("long", Some("Long"), vec![1.0; 9]).await.unwrap();
        let short = t.store.concept("short").await.unwrap().unwrap();
        let long = t.store.concept("long").await.unwrap().unwrap();
        assert_eq!(short.embedding, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(long.embedding.len(), 4);
        assert_eq!(long.label.as_deref(), Some("Long"));
    }

    #[tokio::test]
    async fn test_register_same_key_updates() {
        let t = tracker();
        let a = t.register_concept("a", None, vec![1.0]).await.unwrap();
        let b = t.register_concept("a", Some("A"), vec![2.0]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(t.store.stats().await.unwrap().concepts, 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_key() {
        assert!(tracker().register_concept(" ", None, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_observe_then_predict() {
        let t = tracker();
        for key in ["greet", "ask", "thank", "leave"] {
            t.register_concept(key, None, vec![0.5]).await.unwrap();
        }
        t.observe("s1", &keys(&["greet", "ask", "thank"]), "ok", None)
            .await
            .unwrap();
        t.observe("s2", &keys(&["greet", "ask"]), "ok", None)
            .await
            .unwrap();
        let out = t
            .observe("s3", &keys(&["greet", "leave"]), "abandoned", None)
            .await
            .unwrap();
        assert_eq!(out.observations, 2);
        assert_eq!(out.transitions, 1);

        let preds = t.predict_next("greet", 5).await.unwrap();
        let ranked: Vec<(&str, i64)> = preds
            .iter()
            .map(|p| (p.target_key.as_str(), p.freq))
            .collect();
        assert_eq!(ranked, vec![("ask", 2), ("leave", 1)]);
        assert!(preds[0].weight > preds[1].weight);

        assert_eq!(t.predict_next("greet", 1).await.unwrap().len(), 1);
        assert!(t.predict_next("nobody", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_observe_unknown_key_writes_nothing() {
        let t = tracker();
        t.register_concept("a", None, vec![1.0]).await.unwrap();
        let err = t
            .observe("s", &keys(&["a", "ghost"]), "ok", None)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<GraphError>(),
            Some(&GraphError::UnknownConcept("ghost".into()))
        );
        let stats = t.store.stats().await.unwrap();
        assert_eq!(stats.observations, 0);
        assert_eq!(stats.trajectories, 0);
    }
}
