//! Move graph construction.
//!
//! For each unit of text, [`MoveGraphBuilder::ingest`] runs the channel
//! registry, writes one [`Move`](crate::models::Move) per channel, and links
//! it to the previous move of the same channel recorded in the caller's
//! [`CarryState`]. Callers thread the carry state through consecutive calls
//! of one document or session, so edges chain `u1 → u2 → u3` per channel and
//! never cross channels or sessions.
//!
//! Edge maintenance is two statements inside the unit's transaction: insert
//! the edge if absent, then unconditionally advance `freq`, `weight`, and
//! `last_seen`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::channels::ChannelRegistry;
use crate::models::JsonMap;
use crate::store::{MoveBatch, Store};

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("move {0} does not exist")]
    UnknownMove(i64),
    #[error("unknown concept key '{0}'")]
    UnknownConcept(String),
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("vector has {found} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Last move id per channel within one ingestion stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarryState {
    last: HashMap<String, i64>,
}

impl CarryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: &str) -> Option<i64> {
        self.last.get(channel).copied()
    }

    pub fn set(&mut self, channel: &str, move_id: i64) {
        self.last.insert(channel.to_string(), move_id);
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// One unit of text to turn into moves.
#[derive(Debug, Clone)]
pub struct TextUnit<'a> {
    pub text: &'a str,
    pub session_id: &'a str,
    pub domain: &'a str,
    /// Channels to run; `None` uses the builder's defaults.
    pub channels: Option<&'a [String]>,
    pub span: JsonMap,
}

#[derive(Debug, Clone, Default)]
pub struct IngestStep {
    pub moves_created: usize,
    pub edges_created: usize,
    /// Edges inserted or re-observed.
    pub edges_linked: usize,
    pub carry: CarryState,
}

pub struct MoveGraphBuilder {
    store: Arc<dyn Store>,
    channels: ChannelRegistry,
    alpha: f64,
    default_channels: Option<Vec<String>>,
}

impl MoveGraphBuilder {
    pub fn new(store: Arc<dyn Store>, channels: ChannelRegistry, alpha: f64) -> Self {
        Self {
            store,
            channels,
            alpha,
            default_channels: None,
        }
    }

    /// Restrict calls that name no channels to `names`.
    pub fn with_default_channels(mut self, names: Vec<String>) -> Result<Self, GraphError> {
        if let Some(unknown) = names.iter().find(|n| !self.channels.contains(n)) {
            return Err(GraphError::UnknownChannel(unknown.clone()));
        }
        self.default_channels = Some(names);
        Ok(self)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn dims(&self) -> usize {
        self.channels.dims()
    }

    /// Write moves for one unit of text and link them into the graph.
    ///
    /// Blank text is a no-op that hands the carry state back unchanged.
    pub async fn ingest(&self, unit: TextUnit<'_>, carry: CarryState) -> Result<IngestStep> {
        if unit.text.trim().is_empty() {
            return Ok(IngestStep {
                carry,
                ..IngestStep::default()
            });
        }

        let chosen = unit.channels.or(self.default_channels.as_deref());
        let vectors = self.channels.run(unit.text, chosen);
        if vectors.is_empty() {
            debug!(session = unit.session_id, "No known channels requested");
            return Ok(IngestStep {
                carry,
                ..IngestStep::default()
            });
        }

        let mut context = JsonMap::new();
        context.insert("domain".into(), Value::String(unit.domain.to_string()));
        context.insert("session_id".into(), Value::String(unit.session_id.to_string()));

        let outcome = self
            .store
            .record_moves(&MoveBatch {
                session_id: unit.session_id,
                domain: unit.domain,
                span: &unit.span,
                vectors: &vectors,
                previous: &carry,
                context: &context,
                alpha: self.alpha,
                now: Utc::now().timestamp(),
            })
            .await?;

        let mut carry = carry;
        for (channel, move_id) in &outcome.moves {
            carry.set(channel, *move_id);
        }
        debug!(
            session = unit.session_id,
            moves = outcome.moves.len(),
            edges = outcome.edges_linked,
            "Recorded moves"
        );

        Ok(IngestStep {
            moves_created: outcome.moves.len(),
            edges_created: outcome.edges_created,
            edges_linked: outcome.edges_linked,
            carry,
        })
    }
}
