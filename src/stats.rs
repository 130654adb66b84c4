//! Database statistics overview.
//!
//! Prints row counts per table plus per-domain unit and per-channel edge
//! breakdowns. Used by `trj stats` to confirm that explode and ingest runs
//! landed where expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// Per-channel breakdown of the move graph.
struct ChannelStats {
    channel: String,
    edge_count: i64,
    total_freq: i64,
    avg_weight: f64,
    last_seen: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let totals = store.stats().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Trajectory Harness — Database Stats");
    println!("===================================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Corpus docs:   {}", totals.corpus_documents);
    println!("  Units:         {}", totals.units);
    println!("  Moves:         {}", totals.moves);
    println!("  Edges:         {}", totals.edges);
    println!("  Concepts:      {}", totals.concepts);
    println!("  Observations:  {}", totals.observations);
    println!("  Trajectories:  {}", totals.trajectories);

    let domain_rows = sqlx::query(
        r#"
        SELECT domain,
               COUNT(DISTINCT doc_key) AS doc_count,
               COUNT(*) AS unit_count
        FROM doc_unit
        GROUP BY domain
        ORDER BY unit_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !domain_rows.is_empty() {
        println!();
        println!("  Units by domain:");
        println!("  {:<24} {:>6} {:>8}", "DOMAIN", "DOCS", "UNITS");
        println!("  {}", "-".repeat(40));
        for row in &domain_rows {
            let domain: String = row.get("domain");
            let docs: i64 = row.get("doc_count");
            let units: i64 = row.get("unit_count");
            println!("  {:<24} {:>6} {:>8}", domain, docs, units);
        }
    }

    let channel_rows = sqlx::query(
        r#"
        SELECT channel,
               COUNT(*) AS edge_count,
               COALESCE(SUM(freq), 0) AS total_freq,
               COALESCE(AVG(weight), 0.0) AS avg_weight,
               MAX(last_seen) AS last_seen
        FROM move_edge
        GROUP BY channel
        ORDER BY edge_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let channel_stats: Vec<ChannelStats> = channel_rows
        .iter()
        .map(|row| ChannelStats {
            channel: row.get("channel"),
            edge_count: row.get("edge_count"),
            total_freq: row.get("total_freq"),
            avg_weight: row.get("avg_weight"),
            last_seen: row.get("last_seen"),
        })
        .collect();

    if !channel_stats.is_empty() {
        println!();
        println!("  Edges by channel:");
        println!(
            "  {:<18} {:>7} {:>8} {:>10}   {}",
            "CHANNEL", "EDGES", "FREQ", "AVG WEIGHT", "LAST SEEN"
        );
        println!("  {}", "-".repeat(64));

        for s in &channel_stats {
            let seen_display = match s.last_seen {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<18} {:>7} {:>8} {:>10.4}   {}",
                s.channel, s.edge_count, s.total_freq, s.avg_weight, seen_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
