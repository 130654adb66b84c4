//! Idempotent schema creation.
//!
//! Every statement uses `IF NOT EXISTS`, so `trj init` can run any number
//! of times against the same database.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS corpus (
        domain TEXT NOT NULL,
        doc_key TEXT NOT NULL,
        format TEXT NOT NULL,
        payload TEXT NOT NULL,
        meta_json TEXT NOT NULL DEFAULT '{}',
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (domain, doc_key, format)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS doc_unit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        domain TEXT NOT NULL,
        doc_key TEXT NOT NULL,
        kind TEXT NOT NULL,
        label TEXT,
        path TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        text TEXT,
        meta_json TEXT NOT NULL DEFAULT '{}',
        parent_id INTEGER REFERENCES doc_unit(id) ON DELETE CASCADE,
        UNIQUE(domain, doc_key, path)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_doc_unit_path ON doc_unit(path)",
    "CREATE INDEX IF NOT EXISTS idx_doc_unit_kind ON doc_unit(kind)",
    r#"
    CREATE TABLE IF NOT EXISTS move (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        domain TEXT NOT NULL,
        channel TEXT NOT NULL,
        span_json TEXT NOT NULL DEFAULT '{}',
        features BLOB NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_move_session ON move(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_move_domain_channel ON move(domain, channel)",
    r#"
    CREATE TABLE IF NOT EXISTS move_edge (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_move INTEGER NOT NULL REFERENCES move(id) ON DELETE CASCADE,
        target_move INTEGER NOT NULL REFERENCES move(id) ON DELETE CASCADE,
        channel TEXT NOT NULL,
        delta BLOB NOT NULL,
        weight REAL NOT NULL DEFAULT 0.0,
        freq INTEGER NOT NULL DEFAULT 0,
        last_seen INTEGER NOT NULL,
        context_json TEXT NOT NULL DEFAULT '{}',
        UNIQUE(source_move, target_move, channel)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_move_edge_channel ON move_edge(channel)",
    r#"
    CREATE TABLE IF NOT EXISTS concept (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL UNIQUE,
        label TEXT,
        embedding BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS observation (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        concept_id INTEGER NOT NULL REFERENCES concept(id) ON DELETE CASCADE,
        outcome TEXT NOT NULL,
        context_json TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trajectory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL REFERENCES concept(id) ON DELETE CASCADE,
        target_id INTEGER NOT NULL REFERENCES concept(id) ON DELETE CASCADE,
        delta BLOB NOT NULL,
        weight REAL NOT NULL DEFAULT 0.0,
        freq INTEGER NOT NULL DEFAULT 0,
        last_seen INTEGER NOT NULL,
        context_json TEXT,
        UNIQUE(source_id, target_id)
    )
    "#,
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("migration failed: {}", statement.trim()))?;
    }
    Ok(())
}
