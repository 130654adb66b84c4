//! Core data models used throughout Trajectory Harness.
//!
//! These types represent the extracted units, channel moves, and weighted
//! edges that flow through the ingestion pipeline, plus the coarser
//! concept-level trajectory records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Free-form JSON object carried on units, moves, and edges.
pub type JsonMap = Map<String, Value>;

/// One addressable node of extracted document structure, before it has a
/// store-assigned identifier.
///
/// `path` is unique within `(domain, doc_key)`. `parent_path`, when present,
/// must name a unit emitted earlier in the same list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unit {
    pub domain: String,
    pub doc_key: String,
    pub kind: String,
    pub label: Option<String>,
    pub path: String,
    pub ordinal: i64,
    pub text: Option<String>,
    pub meta: JsonMap,
    pub parent_path: Option<String>,
}

/// A [`Unit`] as persisted, with its store identifier and resolved parent.
#[derive(Debug, Clone, Serialize)]
pub struct StoredUnit {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub domain: String,
    pub doc_key: String,
    pub kind: String,
    pub label: Option<String>,
    pub path: String,
    pub ordinal: i64,
    pub text: Option<String>,
    pub meta: JsonMap,
}

/// Input format of a raw corpus document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorpusFormat {
    /// A marked-up (XML) document.
    Markup,
    /// Line-delimited JSON records.
    Records,
}

impl CorpusFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusFormat::Markup => "markup",
            CorpusFormat::Records => "records",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markup" | "xml" => Some(CorpusFormat::Markup),
            "records" | "jsonl" => Some(CorpusFormat::Records),
            _ => None,
        }
    }
}

/// A raw document awaiting decomposition.
#[derive(Debug, Clone)]
pub struct CorpusDocument {
    pub domain: String,
    pub doc_key: String,
    pub format: CorpusFormat,
    pub payload: String,
    pub meta: JsonMap,
}

impl CorpusDocument {
    /// Session hint recorded in the document metadata, if any.
    pub fn session_hint(&self) -> Option<&str> {
        self.meta
            .get("session_hint")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// One channel's feature vector computed for one unit of text.
#[derive(Debug, Clone, Serialize)]
pub struct Move {
    pub id: i64,
    pub session_id: String,
    pub domain: String,
    pub channel: String,
    pub span: JsonMap,
    pub features: Vec<f32>,
}

/// A directed, frequency-counted transition between two moves of the same
/// channel.
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub source_move: i64,
    pub target_move: i64,
    pub channel: String,
    pub delta: Vec<f32>,
    pub weight: f64,
    pub freq: i64,
    pub last_seen: DateTime<Utc>,
    pub context: JsonMap,
}

/// An externally registered concept with a fixed-dimension embedding.
#[derive(Debug, Clone, Serialize)]
pub struct Concept {
    pub id: i64,
    pub key: String,
    pub label: Option<String>,
    pub embedding: Vec<f32>,
}

/// Concept-to-concept transition, the coarse peer of [`Edge`].
#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    pub source_id: i64,
    pub target_id: i64,
    pub delta: Vec<f32>,
    pub weight: f64,
    pub freq: i64,
    pub last_seen: DateTime<Utc>,
}

/// A ranked successor returned by next-concept prediction.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub target_id: i64,
    pub target_key: String,
    pub weight: f64,
    pub freq: i64,
}
