//! SQLite-backed [`Store`] implementation.
//!
//! Atomic trait calls run inside one transaction each. Edges and
//! trajectories are maintained with an insert-if-absent followed by an
//! unconditional increment, so concurrent writers of the same key both land.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::{
    duplicate_path, CorpusFilter, DecayReport, MoveBatch, MoveBatchOutcome, ObservationBatch,
    ObservationOutcome, Store, StoreStats,
};
use crate::decay::{decay_row, weight_for_freq, DecayParams};
use crate::graph::GraphError;
use crate::models::{
    Concept, CorpusDocument, CorpusFormat, Edge, JsonMap, Move, Prediction, StoredUnit,
    Trajectory, Unit,
};
use crate::path::PathPattern;
use crate::vector::{blob_to_vec, delta, vec_to_blob};

const UNIT_COLUMNS: &str =
    "id, parent_id, domain, doc_key, kind, label, path, ordinal, text, meta_json";

const EDGE_COLUMNS: &str =
    "source_move, target_move, channel, delta, weight, freq, last_seen, context_json";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Transaction holding the write lock from `BEGIN`. Calls that read
    /// before writing would otherwise fail with `SQLITE_BUSY_SNAPSHOT` when
    /// another connection commits between the two.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_json(raw: Option<String>) -> Result<JsonMap> {
    match raw {
        Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
        _ => Ok(JsonMap::new()),
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unit_from_row(row: &SqliteRow) -> Result<StoredUnit> {
    Ok(StoredUnit {
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        domain: row.get("domain"),
        doc_key: row.get("doc_key"),
        kind: row.get("kind"),
        label: row.get("label"),
        path: row.get("path"),
        ordinal: row.get("ordinal"),
        text: row.get("text"),
        meta: parse_json(row.get("meta_json"))?,
    })
}

fn edge_from_row(row: &SqliteRow) -> Result<Edge> {
    let blob: Vec<u8> = row.get("delta");
    Ok(Edge {
        source_move: row.get("source_move"),
        target_move: row.get("target_move"),
        channel: row.get("channel"),
        delta: blob_to_vec(&blob),
        weight: row.get("weight"),
        freq: row.get("freq"),
        last_seen: timestamp(row.get("last_seen")),
        context: parse_json(row.get("context_json"))?,
    })
}

fn corpus_from_row(row: &SqliteRow) -> Result<CorpusDocument> {
    let format: String = row.get("format");
    Ok(CorpusDocument {
        domain: row.get("domain"),
        doc_key: row.get("doc_key"),
        format: CorpusFormat::parse(&format)
            .ok_or_else(|| anyhow!("unknown corpus format '{}'", format))?,
        payload: row.get("payload"),
        meta: parse_json(row.get("meta_json"))?,
    })
}

#[derive(Debug, Clone, Copy)]
enum DecayTable {
    MoveEdge,
    Trajectory,
}

impl DecayTable {
    fn name(self) -> &'static str {
        match self {
            DecayTable::MoveEdge => "move_edge",
            DecayTable::Trajectory => "trajectory",
        }
    }
}

/// Counters of one row as read by the decay scan.
#[derive(Debug, Clone)]
struct ScannedRow {
    id: i64,
    freq: i64,
    weight: f64,
    last_seen: i64,
}

fn sort_units(mut units: Vec<StoredUnit>) -> Vec<StoredUnit> {
    units.sort_by(|a, b| {
        (a.domain.as_str(), a.doc_key.as_str(), a.path.as_str())
            .cmp(&(b.domain.as_str(), b.doc_key.as_str(), b.path.as_str()))
    });
    units
}

/// Insert or update `units` in order. Parents resolve against units written
/// earlier in this call, then against rows already in the table.
async fn write_units(
    conn: &mut SqliteConnection,
    domain: &str,
    doc_key: &str,
    units: &[Unit],
) -> Result<usize> {
    if let Some(path) = duplicate_path(units) {
        bail!("duplicate unit path '{}' in {}/{}", path, domain, doc_key);
    }
    let mut ids: std::collections::HashMap<&str, i64> = std::collections::HashMap::new();
    for unit in units {
        let parent_id = match unit.parent_path.as_deref() {
            None => None,
            Some(p) => match ids.get(p) {
                Some(id) => Some(*id),
                None => {
                    sqlx::query_scalar::<_, i64>(
                        "SELECT id FROM doc_unit WHERE domain = ? AND doc_key = ? AND path = ?",
                    )
                    .bind(domain)
                    .bind(doc_key)
                    .bind(p)
                    .fetch_optional(&mut *conn)
                    .await?
                }
            },
        };

        let meta_json = serde_json::to_string(&unit.meta)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO doc_unit (domain, doc_key, kind, label, path, ordinal, text,
                                  meta_json, parent_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain, doc_key, path) DO UPDATE SET
                kind = excluded.kind,
                label = excluded.label,
                ordinal = excluded.ordinal,
                text = excluded.text,
                meta_json = excluded.meta_json,
                parent_id = excluded.parent_id
            RETURNING id
            "#,
        )
        .bind(domain)
        .bind(doc_key)
        .bind(&unit.kind)
        .bind(&unit.label)
        .bind(&unit.path)
        .bind(unit.ordinal)
        .bind(&unit.text)
        .bind(&meta_json)
        .bind(parent_id)
        .fetch_one(&mut *conn)
        .await?;

        ids.insert(unit.path.as_str(), id);
    }
    Ok(units.len())
}

impl SqliteStore {
    /// Read every row's counters outside any write transaction.
    async fn scan_decay(&self, table: DecayTable) -> Result<Vec<ScannedRow>> {
        let rows = sqlx::query(&format!(
            "SELECT id, freq, weight, last_seen FROM {}",
            table.name()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ScannedRow {
                id: row.get("id"),
                freq: row.get("freq"),
                weight: row.get("weight"),
                last_seen: row.get("last_seen"),
            })
            .collect())
    }

    /// Write decayed counters for scanned rows. A row whose `last_seen`
    /// moved since the scan was re-observed and keeps its fresh counters.
    async fn apply_decay(
        &self,
        table: DecayTable,
        rows: &[ScannedRow],
        params: &DecayParams,
        now: i64,
    ) -> Result<usize> {
        let mut tx = self.begin_write().await?;
        let sql = format!(
            "UPDATE {} SET freq = ?, weight = ? WHERE id = ? AND last_seen = ?",
            table.name()
        );

        let mut updated = 0;
        for row in rows {
            let Some((freq, weight)) =
                decay_row(params, row.freq, row.weight, row.last_seen, now)
            else {
                continue;
            };
            let affected = sqlx::query(&sql)
                .bind(freq)
                .bind(weight)
                .bind(row.id)
                .bind(row.last_seen)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            updated += affected as usize;
        }

        tx.commit().await?;
        Ok(updated)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_corpus(&self, doc: &CorpusDocument) -> Result<()> {
        let meta_json = serde_json::to_string(&doc.meta)?;
        sqlx::query(
            r#"
            INSERT INTO corpus (domain, doc_key, format, payload, meta_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain, doc_key, format) DO UPDATE SET
                payload = excluded.payload,
                meta_json = excluded.meta_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.domain)
        .bind(&doc.doc_key)
        .bind(doc.format.as_str())
        .bind(&doc.payload)
        .bind(&meta_json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_corpus(
        &self,
        domain: &str,
        doc_key: &str,
        format: CorpusFormat,
    ) -> Result<Option<CorpusDocument>> {
        let row = sqlx::query(
            r#"
            SELECT domain, doc_key, format, payload, meta_json
            FROM corpus
            WHERE domain = ? AND doc_key = ? AND format = ?
            "#,
        )
        .bind(domain)
        .bind(doc_key)
        .bind(format.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(corpus_from_row).transpose()
    }

    async fn list_corpus(&self, filter: &CorpusFilter) -> Result<Vec<CorpusDocument>> {
        let format = filter.format.map(|f| f.as_str());
        let rows = sqlx::query(
            r#"
            SELECT domain, doc_key, format, payload, meta_json
            FROM corpus
            WHERE (? IS NULL OR domain = ?)
              AND (? IS NULL OR doc_key = ?)
              AND (? IS NULL OR format = ?)
            ORDER BY domain, doc_key, format
            "#,
        )
        .bind(&filter.domain)
        .bind(&filter.domain)
        .bind(&filter.doc_key)
        .bind(&filter.doc_key)
        .bind(format)
        .bind(format)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(corpus_from_row).collect()
    }

    async fn replace_units(&self, domain: &str, doc_key: &str, units: &[Unit]) -> Result<usize> {
        let mut tx = self.begin_write().await?;

        sqlx::query("DELETE FROM doc_unit WHERE domain = ? AND doc_key = ?")
            .bind(domain)
            .bind(doc_key)
            .execute(&mut *tx)
            .await?;

        let inserted = write_units(&mut *tx, domain, doc_key, units).await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn upsert_units(&self, domain: &str, doc_key: &str, units: &[Unit]) -> Result<usize> {
        let mut tx = self.begin_write().await?;
        let written = write_units(&mut *tx, domain, doc_key, units).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn units_at(&self, path: &str, kind: Option<&str>) -> Result<Vec<StoredUnit>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM doc_unit
            WHERE path = ? AND (? IS NULL OR kind = ?)
            ORDER BY domain, doc_key, path
            "#
        ))
        .bind(path)
        .bind(kind)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn units_under(&self, prefix: &str, kind: Option<&str>) -> Result<Vec<StoredUnit>> {
        let child_head = format!("{prefix}.");
        let rows = sqlx::query(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM doc_unit
            WHERE (path = ? OR substr(path, 1, ?) = ?)
              AND (? IS NULL OR kind = ?)
            ORDER BY domain, doc_key, path
            "#
        ))
        .bind(prefix)
        .bind(child_head.chars().count() as i64)
        .bind(&child_head)
        .bind(kind)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn units_matching(
        &self,
        pattern: &PathPattern,
        kind: Option<&str>,
    ) -> Result<Vec<StoredUnit>> {
        // Narrow the scan by the pattern's literal head, then match in Rust.
        let like = match pattern.literal_prefix() {
            Some(prefix) => format!("{}%", escape_like(&prefix)),
            None => "%".to_string(),
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM doc_unit
            WHERE path LIKE ? ESCAPE '\'
              AND (? IS NULL OR kind = ?)
            "#
        ))
        .bind(like)
        .bind(kind)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        let mut units = Vec::new();
        for row in &rows {
            let unit = unit_from_row(row)?;
            if pattern.matches(&unit.path) {
                units.push(unit);
            }
        }
        Ok(sort_units(units))
    }

    async fn record_moves(&self, batch: &MoveBatch<'_>) -> Result<MoveBatchOutcome> {
        let mut tx = self.begin_write().await?;

        // Resolve every previous move before the first write.
        let mut previous: Vec<Option<(i64, Vec<f32>)>> = Vec::with_capacity(batch.vectors.len());
        for (channel, features) in batch.vectors {
            let Some(prev) = batch.previous.get(channel) else {
                previous.push(None);
                continue;
            };
            let blob: Option<Vec<u8>> =
                sqlx::query_scalar("SELECT features FROM move WHERE id = ?")
                    .bind(prev)
                    .fetch_optional(&mut *tx)
                    .await?;
            let prev_features = blob_to_vec(&blob.ok_or(GraphError::UnknownMove(prev))?);
            if prev_features.len() != features.len() {
                return Err(GraphError::DimensionMismatch {
                    expected: features.len(),
                    found: prev_features.len(),
                }
                .into());
            }
            previous.push(Some((prev, prev_features)));
        }

        let span_json = serde_json::to_string(batch.span)?;
        let context_json = serde_json::to_string(batch.context)?;
        let mut outcome = MoveBatchOutcome::default();

        for ((channel, features), prev) in batch.vectors.iter().zip(previous) {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO move (session_id, domain, channel, span_json, features, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(batch.session_id)
            .bind(batch.domain)
            .bind(channel)
            .bind(&span_json)
            .bind(vec_to_blob(features))
            .bind(batch.now)
            .fetch_one(&mut *tx)
            .await?;
            outcome.moves.push((channel.clone(), id));

            let Some((prev_id, prev_features)) = prev else {
                continue;
            };

            let inserted = sqlx::query(
                r#"
                INSERT INTO move_edge (source_move, target_move, channel, delta, weight, freq,
                                       last_seen, context_json)
                VALUES (?, ?, ?, ?, 0.0, 0, ?, ?)
                ON CONFLICT(source_move, target_move, channel) DO NOTHING
                "#,
            )
            .bind(prev_id)
            .bind(id)
            .bind(channel)
            .bind(vec_to_blob(&delta(&prev_features, features, features.len())))
            .bind(batch.now)
            .bind(&context_json)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            outcome.edges_created += inserted as usize;

            let freq: i64 = sqlx::query_scalar(
                r#"
                UPDATE move_edge SET freq = freq + 1, last_seen = ?
                WHERE source_move = ? AND target_move = ? AND channel = ?
                RETURNING freq
                "#,
            )
            .bind(batch.now)
            .bind(prev_id)
            .bind(id)
            .bind(channel)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE move_edge SET weight = ? WHERE source_move = ? AND target_move = ? AND channel = ?",
            )
            .bind(weight_for_freq(batch.alpha, freq))
            .bind(prev_id)
            .bind(id)
            .bind(channel)
            .execute(&mut *tx)
            .await?;
            outcome.edges_linked += 1;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn session_moves(&self, session_id: &str) -> Result<Vec<Move>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, domain, channel, span_json, features
            FROM move
            WHERE session_id = ?
            ORDER BY id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("features");
                Ok(Move {
                    id: row.get("id"),
                    session_id: row.get("session_id"),
                    domain: row.get("domain"),
                    channel: row.get("channel"),
                    span: parse_json(row.get("span_json"))?,
                    features: blob_to_vec(&blob),
                })
            })
            .collect()
    }

    async fn edge(&self, source: i64, target: i64, channel: &str) -> Result<Option<Edge>> {
        let row = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM move_edge WHERE source_move = ? AND target_move = ? AND channel = ?"
        ))
        .bind(source)
        .bind(target)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(edge_from_row).transpose()
    }

    async fn edges_from(&self, source: i64) -> Result<Vec<Edge>> {
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM move_edge WHERE source_move = ? ORDER BY id"
        ))
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(edge_from_row).collect()
    }

    async fn upsert_concept(
        &self,
        key: &str,
        label: Option<&str>,
        embedding: &[f32],
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO concept (key, label, embedding)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                label = excluded.label,
                embedding = excluded.embedding
            RETURNING id
            "#,
        )
        .bind(key)
        .bind(label)
        .bind(vec_to_blob(embedding))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn concept(&self, key: &str) -> Result<Option<Concept>> {
        let row = sqlx::query("SELECT id, key, label, embedding FROM concept WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            Concept {
                id: row.get("id"),
                key: row.get("key"),
                label: row.get("label"),
                embedding: blob_to_vec(&blob),
            }
        }))
    }

    async fn record_observation(&self, batch: &ObservationBatch<'_>) -> Result<ObservationOutcome> {
        let mut tx = self.begin_write().await?;

        let mut resolved: Vec<(i64, Vec<f32>)> = Vec::with_capacity(batch.keys.len());
        for key in batch.keys {
            let row = sqlx::query("SELECT id, embedding FROM concept WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| GraphError::UnknownConcept(key.clone()))?;
            let blob: Vec<u8> = row.get("embedding");
            resolved.push((row.get("id"), blob_to_vec(&blob)));
        }

        let context_json = batch
            .context
            .map(|c| serde_json::to_string(c))
            .transpose()?;

        for (seq, (concept_id, _)) in resolved.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO observation (session_id, seq, concept_id, outcome, context_json,
                                         created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(batch.session_id)
            .bind(seq as i64)
            .bind(concept_id)
            .bind(batch.outcome)
            .bind(&context_json)
            .bind(batch.now)
            .execute(&mut *tx)
            .await?;
        }

        let mut transitions = 0;
        for pair in resolved.windows(2) {
            let (source_id, source_vec) = (pair[0].0, &pair[0].1);
            let (target_id, target_vec) = (pair[1].0, &pair[1].1);

            sqlx::query(
                r#"
                INSERT INTO trajectory (source_id, target_id, delta, weight, freq, last_seen,
                                        context_json)
                VALUES (?, ?, ?, 0.0, 0, ?, ?)
                ON CONFLICT(source_id, target_id) DO NOTHING
                "#,
            )
            .bind(source_id)
            .bind(target_id)
            .bind(vec_to_blob(&delta(source_vec, target_vec, batch.dims)))
            .bind(batch.now)
            .bind(&context_json)
            .execute(&mut *tx)
            .await?;

            let freq: i64 = sqlx::query_scalar(
                r#"
                UPDATE trajectory SET freq = freq + 1, last_seen = ?
                WHERE source_id = ? AND target_id = ?
                RETURNING freq
                "#,
            )
            .bind(batch.now)
            .bind(source_id)
            .bind(target_id)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("UPDATE trajectory SET weight = ? WHERE source_id = ? AND target_id = ?")
                .bind(weight_for_freq(batch.alpha, freq))
                .bind(source_id)
                .bind(target_id)
                .execute(&mut *tx)
                .await?;
            transitions += 1;
        }

        tx.commit().await?;
        Ok(ObservationOutcome {
            observations: resolved.len(),
            transitions,
        })
    }

    async fn trajectory(&self, source_id: i64, target_id: i64) -> Result<Option<Trajectory>> {
        let row = sqlx::query(
            r#"
            SELECT source_id, target_id, delta, weight, freq, last_seen
            FROM trajectory
            WHERE source_id = ? AND target_id = ?
            "#,
        )
        .bind(source_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let blob: Vec<u8> = row.get("delta");
            Trajectory {
                source_id: row.get("source_id"),
                target_id: row.get("target_id"),
                delta: blob_to_vec(&blob),
                weight: row.get("weight"),
                freq: row.get("freq"),
                last_seen: timestamp(row.get("last_seen")),
            }
        }))
    }

    async fn top_successors(&self, source_id: i64, k: usize) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            r#"
            SELECT t.target_id, c.key, t.weight, t.freq
            FROM trajectory t
            JOIN concept c ON c.id = t.target_id
            WHERE t.source_id = ?
            ORDER BY t.weight DESC, t.freq DESC
            LIMIT ?
            "#,
        )
        .bind(source_id)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Prediction {
                target_id: row.get("target_id"),
                target_key: row.get("key"),
                weight: row.get("weight"),
                freq: row.get("freq"),
            })
            .collect())
    }

    async fn decay(&self, params: &DecayParams, now: i64) -> Result<DecayReport> {
        let mut report = DecayReport::default();

        let edges = self.scan_decay(DecayTable::MoveEdge).await?;
        report.edges_scanned = edges.len();
        report.edges_updated = self
            .apply_decay(DecayTable::MoveEdge, &edges, params, now)
            .await?;

        let trajectories = self.scan_decay(DecayTable::Trajectory).await?;
        report.trajectories_scanned = trajectories.len();
        report.trajectories_updated = self
            .apply_decay(DecayTable::Trajectory, &trajectories, params, now)
            .await?;

        Ok(report)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut counts = [0i64; 7];
        let tables = [
            "corpus",
            "doc_unit",
            "move",
            "move_edge",
            "concept",
            "observation",
            "trajectory",
        ];
        for (count, table) in counts.iter_mut().zip(tables) {
            *count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
        }
        let [corpus_documents, units, moves, edges, concepts, observations, trajectories] = counts;
        Ok(StoreStats {
            corpus_documents,
            units,
            moves,
            edges,
            concepts,
            observations,
            trajectories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CarryState;
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        store_with_connections(1).await
    }

    async fn store_with_connections(max: u32) -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    async fn link(store: &SqliteStore, previous: Option<i64>, now: i64) -> i64 {
        let span = JsonMap::new();
        let context = JsonMap::new();
        let vectors = vec![("c".to_string(), vec![1.0, 0.0])];
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

    async fn observe(store: &SqliteStore, keys: &[String], now: i64) {
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

    const PARAMS: DecayParams = DecayParams {
        alpha: 0.15,
        half_life_days: 45.0,
    };
    const TAU: i64 = 45 * 86_400;

    fn unit(path: &str, kind: &str, parent: Option<&str>) -> Unit {
        Unit {
            domain: "d".into(),
            doc_key: "k".into(),
            kind: kind.into(),
            label: None,
            path: path.into(),
            ordinal: 1,
            text: Some(format!("text of {path}")),
            meta: JsonMap::new(),
            parent_path: parent.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_replace_units_resolves_parents() {
        let (_dir, store) = store().await;
        let units = vec![
            unit("BOOK", "book", None),
            unit("BOOK.ch_1", "chapter", Some("BOOK")),
            unit("BOOK.ch_1.v_1", "verse", Some("BOOK.ch_1")),
        ];
        assert_eq!(store.replace_units("d", "k", &units).await.unwrap(), 3);

        let under = store.units_under("BOOK.ch_1", None).await.unwrap();
        assert_eq!(under.len(), 2);
        let chapter = &under[0];
        assert_eq!(under[1].parent_id, Some(chapter.id));

        // Replacing drops the old rows.
        let again = vec![unit("BOOK", "book", None)];
        store.replace_units("d", "k", &again).await.unwrap();
        assert!(store.units_at("BOOK.ch_1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_units_rejects_duplicate_path() {
        let (_dir, store) = store().await;
        let first = vec![unit("V", "book", None), unit("V.1", "verse", Some("V"))];
        store.replace_units("d", "k", &first).await.unwrap();

        let clashing = vec![
            unit("V", "book", None),
            unit("V.1", "verse", Some("V")),
            unit("V.2", "verse", Some("V")),
            unit("V.1", "verse", Some("V")),
        ];
        let err = store.replace_units("d", "k", &clashing).await.unwrap_err();
        assert!(err.to_string().contains("V.1"), "err={}", err);

        // The earlier rows survive the failed replacement.
        assert_eq!(store.units_under("V", None).await.unwrap().len(), 2);
        assert!(store.units_at("V.2", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_units_under_escapes_like_wildcards() {
        let (_dir, store) = store().await;
        let units = vec![
            unit("a_b", "x", None),
            unit("a_b.c", "x", Some("a_b")),
            unit("aXb.c", "x", None),
        ];
        store.replace_units("d", "k", &units).await.unwrap();
        let paths: Vec<String> = store
            .units_under("a_b", None)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.path)
            .collect();
        assert_eq!(paths, vec!["a_b", "a_b.c"]);
    }

    #[tokio::test]
    async fn test_units_matching_pattern() {
        let (_dir, store) = store().await;
        let units = vec![
            unit("B", "book", None),
            unit("B.c1", "chapter", Some("B")),
            unit("B.c1.v1", "verse", Some("B.c1")),
            unit("B.c2", "chapter", Some("B")),
            unit("B.c2.v1", "verse", Some("B.c2")),
        ];
        store.replace_units("d", "k", &units).await.unwrap();
        let pattern = PathPattern::parse("B.*.v1").unwrap();
        let hits = store.units_matching(&pattern, Some("verse")).await.unwrap();
        let paths: Vec<&str> = hits.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["B.c1.v1", "B.c2.v1"]);
    }

    #[tokio::test]
    async fn test_record_moves_links_and_counts() {
        let (_dir, store) = store().await;
        let span = JsonMap::new();
        let context = JsonMap::new();
        let first = vec![("c".to_string(), vec![1.0, 2.0])];
        let carry = CarryState::new();
        let out1 = store
            .record_moves(&MoveBatch {
                session_id: "s",
                domain: "d",
                span: &span,
                vectors: &first,
                previous: &carry,
                context: &context,
                alpha: 0.15,
                now: 100,
            })
            .await
            .unwrap();
        assert_eq!(out1.edges_created, 0);

        let mut carry = CarryState::new();
        carry.set("c", out1.moves[0].1);
        let second = vec![("c".to_string(), vec![4.0, 0.0])];
        let out2 = store
            .record_moves(&MoveBatch {
                session_id: "s",
                domain: "d",
                span: &span,
                vectors: &second,
                previous: &carry,
                context: &context,
                alpha: 0.15,
                now: 200,
            })
            .await
            .unwrap();
        assert_eq!(out2.edges_created, 1);
        assert_eq!(out2.edges_linked, 1);

        let edge = store
            .edge(out1.moves[0].1, out2.moves[0].1, "c")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edge.freq, 1);
        assert_eq!(edge.delta, vec![3.0, -2.0]);
        assert_eq!(edge.last_seen.timestamp(), 200);
        assert!((edge.weight - weight_for_freq(0.15, 1)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_record_moves_unknown_previous_rolls_back() {
        let (_dir, store) = store().await;
        let span = JsonMap::new();
        let context = JsonMap::new();
        let vectors = vec![("c".to_string(), vec![1.0])];
        let mut carry = CarryState::new();
        carry.set("c", 77);
        let err = store
            .record_moves(&MoveBatch {
                session_id: "s",
                domain: "d",
                span: &span,
                vectors: &vectors,
                previous: &carry,
                context: &context,
                alpha: 0.15,
                now: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<GraphError>(),
            Some(&GraphError::UnknownMove(77))
        );
        assert_eq!(store.stats().await.unwrap().moves, 0);
    }

    #[tokio::test]
    async fn test_observations_and_predictions() {
        let (_dir, store) = store().await;
        for key in ["a", "b", "c"] {
            store.upsert_concept(key, None, &[0.0, 1.0]).await.unwrap();
        }
        let seq = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
        for keys in [seq(&["a", "b"]), seq(&["a", "b"]), seq(&["a", "c"])] {
            store
                .record_observation(&ObservationBatch {
                    session_id: "s",
                    keys: &keys,
                    outcome: "ok",
                    context: None,
                    alpha: 0.15,
                    dims: 2,
                    now: 10,
                })
                .await
                .unwrap();
        }

        let a = store.concept("a").await.unwrap().unwrap();
        let preds = store.top_successors(a.id, 5).await.unwrap();
        assert_eq!(preds.len(), 2);
        assert_eq!(preds[0].target_key, "b");
        assert_eq!(preds[0].freq, 2);
        assert_eq!(preds[1].target_key, "c");
        assert_eq!(store.stats().await.unwrap().observations, 6);
    }

    #[tokio::test]
    async fn test_unknown_concept_writes_nothing() {
        let (_dir, store) = store().await;
        store.upsert_concept("a", None, &[1.0]).await.unwrap();
        let keys = vec!["a".to_string(), "missing".to_string()];
        let err = store
            .record_observation(&ObservationBatch {
                session_id: "s",
                keys: &keys,
                outcome: "ok",
                context: None,
                alpha: 0.15,
                dims: 1,
                now: 10,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<GraphError>(),
            Some(&GraphError::UnknownConcept("missing".into()))
        );
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.observations, 0);
        assert_eq!(stats.trajectories, 0);
    }

    #[tokio::test]
    async fn test_decay_ages_counters() {
        let (_dir, store) = store().await;
        store.upsert_concept("a", None, &[1.0]).await.unwrap();
        store.upsert_concept("b", None, &[2.0]).await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string()];
        for _ in 0..10 {
            store
                .record_observation(&ObservationBatch {
                    session_id: "s",
                    keys: &keys,
                    outcome: "ok",
                    context: None,
                    alpha: 0.15,
                    dims: 1,
                    now: 0,
                })
                .await
                .unwrap();
        }
        let params = DecayParams {
            alpha: 0.15,
            half_life_days: 45.0,
        };
        let tau = 45 * 86_400;
        let report = store.decay(&params, tau).await.unwrap();
        assert_eq!(report.trajectories_scanned, 1);
        assert_eq!(report.trajectories_updated, 1);

        let a = store.concept("a").await.unwrap().unwrap();
        let b = store.concept("b").await.unwrap().unwrap();
        let t = store.trajectory(a.id, b.id).await.unwrap().unwrap();
        assert_eq!(t.freq, 4);
        assert!((t.weight - weight_for_freq(0.15, 4)).abs() < 1e-12);
        assert_eq!(t.last_seen.timestamp(), 0);
    }

    #[tokio::test]
    async fn test_decay_ages_move_edges() {
        let (_dir, store) = store().await;
        let first = link(&store, None, 0).await;
        let second = link(&store, Some(first), 0).await;

        let report = store.decay(&PARAMS, 2 * TAU).await.unwrap();
        assert_eq!(report.edges_scanned, 1);
        assert_eq!(report.edges_updated, 1);

        let edge = store.edge(first, second, "c").await.unwrap().unwrap();
        assert_eq!(edge.freq, 0);
        assert_eq!(edge.weight, 0.0);
        assert_eq!(edge.last_seen.timestamp(), 0);

        // Nothing left to age.
        let again = store.decay(&PARAMS, 3 * TAU).await.unwrap();
        assert_eq!(again.edges_updated, 0);
    }

    #[tokio::test]
    async fn test_decay_keeps_counters_reobserved_after_scan() {
        let (_dir, store) = store().await;
        store.upsert_concept("a", None, &[1.0]).await.unwrap();
        store.upsert_concept("b", None, &[2.0]).await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string()];
        for _ in 0..10 {
            observe(&store, &keys, 0).await;
        }
        let first = link(&store, None, 0).await;
        let second = link(&store, Some(first), 0).await;

        let trajectories = store.scan_decay(DecayTable::Trajectory).await.unwrap();
        let edges = store.scan_decay(DecayTable::MoveEdge).await.unwrap();

        // Both rows are observed again between the scan and the write.
        observe(&store, &keys, TAU).await;
        sqlx::query("UPDATE move_edge SET freq = freq + 1, last_seen = ?")
            .bind(TAU)
            .execute(&store.pool)
            .await
            .unwrap();

        let updated = store
            .apply_decay(DecayTable::Trajectory, &trajectories, &PARAMS, TAU)
            .await
            .unwrap();
        assert_eq!(updated, 0);
        let updated = store
            .apply_decay(DecayTable::MoveEdge, &edges, &PARAMS, TAU)
            .await
            .unwrap();
        assert_eq!(updated, 0);

        let a = store.concept("a").await.unwrap().unwrap();
        let b = store.concept("b").await.unwrap().unwrap();
        let t = store.trajectory(a.id, b.id).await.unwrap().unwrap();
        assert_eq!(t.freq, 11);
        assert_eq!(t.last_seen.timestamp(), TAU);
        assert!((t.weight - weight_for_freq(0.15, 11)).abs() < 1e-12);

        let edge = store.edge(first, second, "c").await.unwrap().unwrap();
        assert_eq!(edge.freq, 2);
        assert_eq!(edge.last_seen.timestamp(), TAU);
    }

    #[tokio::test]
    async fn test_concurrent_links_and_decay_all_commit() {
        let (_dir, store) = store_with_connections(4).await;
        let store = Arc::new(store);
        let root = link(&store, None, 0).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                link(&store, Some(root), i).await;
                store.decay(&PARAMS, TAU).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.edges_from(root).await.unwrap().len(), 8);
        assert_eq!(store.stats().await.unwrap().moves, 9);
    }

    #[tokio::test]
    async fn test_corpus_roundtrip_and_filter() {
        let (_dir, store) = store().await;
        let mut meta = JsonMap::new();
        meta.insert("session_hint".into(), json!("hint"));
        for (domain, key) in [("bible", "prov"), ("bible", "ps"), ("film", "f1")] {
            store
                .put_corpus(&CorpusDocument {
                    domain: domain.into(),
                    doc_key: key.into(),
                    format: CorpusFormat::Markup,
                    payload: "<a/>".into(),
                    meta: meta.clone(),
                })
                .await
                .unwrap();
        }
        let filter = CorpusFilter {
            domain: Some("bible".into()),
            ..CorpusFilter::default()
        };
        let docs = store.list_corpus(&filter).await.unwrap();
        let keys: Vec<&str> = docs.iter().map(|d| d.doc_key.as_str()).collect();
        assert_eq!(keys, vec!["prov", "ps"]);
        assert_eq!(docs[0].session_hint(), Some("hint"));
        assert!(store
            .get_corpus("film", "f1", CorpusFormat::Records)
            .await
            .unwrap()
            .is_none());
    }
}
