//! # Trajectory Harness CLI (`trj`)
//!
//! The `trj` binary drives the whole pipeline: loading raw corpus documents,
//! exploding them into units, turning unit text into channel moves and
//! weighted edges, recording concept trajectories, and running decay.
//!
//! ## Usage
//!
//! ```bash
//! trj --config ./config/trj.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trj init` | Create the SQLite database and run schema migrations |
//! | `trj load` | Store a raw markup or record-stream document |
//! | `trj explode markup` | Decompose stored markup with a ruleset |
//! | `trj explode records` | Segment a stored record stream into scenes |
//! | `trj process-corpus` | Generic extraction plus move ingestion for stored markup |
//! | `trj ingest text` | Sentence-split raw text into a move chain |
//! | `trj ingest units` | Ingest stored units selected by path |
//! | `trj concept add/observe/predict` | Concept-level trajectories |
//! | `trj decay once/run` | Age edge and trajectory counters |
//! | `trj units` | List units matching a path selector |
//! | `trj stats` | Row counts and per-channel breakdown |
//!
//! ## Examples
//!
//! ```bash
//! trj init
//! trj load bible proverbs ./proverbs.xml --format markup
//! trj explode markup bible proverbs --rules ./rules/proverbs.json
//! trj ingest units 'PRV.*' --kind verse --channel rhetoric
//! trj concept observe s1 greet ask thank --outcome resolved
//! trj decay run
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use trajectory_harness::channels::ChannelRegistry;
use trajectory_harness::concepts::ConceptTracker;
use trajectory_harness::config::{self, Config};
use trajectory_harness::decay::DecayMaintainer;
use trajectory_harness::explode::rules::{MarkupRules, RecordRules};
use trajectory_harness::explode::{explode_markup, explode_records};
use trajectory_harness::graph::MoveGraphBuilder;
use trajectory_harness::ingest;
use trajectory_harness::models::{CorpusDocument, CorpusFormat, JsonMap};
use trajectory_harness::path::{is_wildcard, PathPattern};
use trajectory_harness::store::sqlite::SqliteStore;
use trajectory_harness::store::{CorpusFilter, Store};
use trajectory_harness::{db, migrate, stats};

/// Trajectory Harness CLI: document units, channel moves, and decaying
/// transition graphs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/trj.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "trj",
    about = "Trajectory Harness — document units, channel moves, and decaying transition graphs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trj.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Markup,
    Records,
}

impl From<FormatArg> for CorpusFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Markup => CorpusFormat::Markup,
            FormatArg::Records => CorpusFormat::Records,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Store a raw corpus document for later decomposition.
    Load {
        domain: String,
        doc_key: String,
        /// File holding the markup or line-delimited JSON payload.
        file: PathBuf,
        #[arg(long, value_enum, default_value = "markup")]
        format: FormatArg,
        /// Session name used by `process-corpus` instead of the doc key.
        #[arg(long)]
        session_hint: Option<String>,
    },

    /// Decompose a stored document into units, replacing prior units.
    Explode {
        #[command(subcommand)]
        action: ExplodeAction,
    },

    /// Run the generic extractor over stored markup and ingest every unit.
    ProcessCorpus {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        doc_key: Option<String>,
        #[arg(long, default_value = "CORPUS")]
        session_prefix: String,
    },

    /// Turn text into moves and edges.
    Ingest {
        #[command(subcommand)]
        action: IngestAction,
    },

    /// Concept registration, observation, and prediction.
    Concept {
        #[command(subcommand)]
        action: ConceptAction,
    },

    /// Age edge and trajectory frequencies.
    Decay {
        #[command(subcommand)]
        action: DecayAction,
    },

    /// List stored units matching a path or path pattern.
    Units {
        selector: String,
        #[arg(long)]
        kind: Option<String>,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum ExplodeAction {
    /// Rule-driven decomposition of a stored markup document.
    Markup {
        domain: String,
        doc_key: String,
        /// JSON ruleset file.
        #[arg(long)]
        rules: PathBuf,
    },
    /// Scene segmentation of a stored record stream.
    Records {
        domain: String,
        doc_key: String,
        /// JSON ruleset file; defaults apply when omitted.
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum IngestAction {
    /// Sentence-split raw text and chain one move set per sentence.
    Text {
        domain: String,
        text: String,
        #[arg(long)]
        session: Option<String>,
        /// Channel to run; repeatable. Defaults to the configured channels.
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
    /// Ingest stored units selected by exact path, prefix, or pattern.
    Units {
        selector: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConceptAction {
    /// Register or update a concept.
    Add {
        key: String,
        /// Comma-separated embedding values.
        embedding: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Record an observed sequence of concept keys.
    Observe {
        session: String,
        #[arg(required = true)]
        keys: Vec<String>,
        #[arg(long, default_value = "observed")]
        outcome: String,
        /// JSON object stored with each observation.
        #[arg(long)]
        context: Option<String>,
    },
    /// Most likely successors of a concept.
    Predict {
        key: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
    },
}

#[derive(Subcommand)]
enum DecayAction {
    /// Run a single decay pass.
    Once,
    /// Run decay passes every `decay.interval_secs` until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("trajectory_harness=info")),
        1 => EnvFilter::new("trajectory_harness=info"),
        2 => EnvFilter::new("trajectory_harness=debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Load {
            domain,
            doc_key,
            file,
            format,
            session_hint,
        } => {
            let payload = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mut meta = JsonMap::new();
            if let Some(hint) = session_hint {
                meta.insert("session_hint".into(), Value::String(hint));
            }
            let doc = CorpusDocument {
                domain,
                doc_key,
                format: format.into(),
                payload,
                meta,
            };
            let store = open_store(&cfg).await?;
            store.put_corpus(&doc).await?;
            println!("loaded: {}/{}", doc.domain, doc.doc_key);
            println!("format: {}", doc.format.as_str());
            println!("bytes: {}", doc.payload.len());
            println!("ok");
        }
        Commands::Explode { action } => {
            let store = open_store(&cfg).await?;
            match action {
                ExplodeAction::Markup {
                    domain,
                    doc_key,
                    rules,
                } => {
                    let rules = MarkupRules::from_json(&read_file(&rules)?)?;
                    let summary = explode_markup(store.as_ref(), &domain, &doc_key, &rules).await?;
                    println!("inserted: {}", summary.inserted_count);
                    for (kind, count) in &summary.counts_by_kind {
                        println!("  {}: {}", kind, count);
                    }
                }
                ExplodeAction::Records {
                    domain,
                    doc_key,
                    rules,
                } => {
                    let rules = match rules {
                        Some(path) => RecordRules::from_json(&read_file(&path)?)?,
                        None => RecordRules::default(),
                    };
                    let summary =
                        explode_records(store.as_ref(), &domain, &doc_key, &rules).await?;
                    println!("scenes: {}", summary.scene_count);
                    println!("units: {}", summary.unit_count);
                    println!("skipped_lines: {}", summary.skipped_lines);
                }
            }
            println!("ok");
        }
        Commands::ProcessCorpus {
            domain,
            doc_key,
            session_prefix,
        } => {
            let builder = graph_builder(&cfg, open_store(&cfg).await?)?;
            let filter = CorpusFilter {
                domain,
                doc_key,
                format: None,
            };
            let summary = ingest::process_corpus(&builder, &filter, &session_prefix).await?;
            println!("processed_units: {}", summary.processed_units);
            println!("documents_seen: {}", summary.documents_seen);
            println!("documents_failed: {}", summary.documents_failed);
            println!("ok");
        }
        Commands::Ingest { action } => {
            let builder = graph_builder(&cfg, open_store(&cfg).await?)?;
            match action {
                IngestAction::Text {
                    domain,
                    text,
                    session,
                    channels,
                } => {
                    let summary = ingest::ingest_text(
                        &builder,
                        &text,
                        &domain,
                        session.as_deref(),
                        channel_filter(&channels),
                    )
                    .await?;
                    println!("session_id: {}", summary.session_id);
                    println!("sentences: {}", summary.sentence_count);
                    println!("moves: {}", summary.move_count);
                    println!("edges: {}", summary.edge_count);
                }
                IngestAction::Units {
                    selector,
                    kind,
                    channels,
                } => {
                    let summary = ingest::ingest_units_by_selector(
                        &builder,
                        &selector,
                        kind.as_deref(),
                        channel_filter(&channels),
                    )
                    .await?;
                    println!("units: {}", summary.unit_count);
                    println!("moves: {}", summary.move_count);
                    println!("edges: {}", summary.edge_count);
                }
            }
            println!("ok");
        }
        Commands::Concept { action } => {
            let tracker =
                ConceptTracker::new(open_store(&cfg).await?, cfg.graph.dims, cfg.graph.alpha);
            match action {
                ConceptAction::Add {
                    key,
                    embedding,
                    label,
                } => {
                    let id = tracker
                        .register_concept(&key, label.as_deref(), parse_floats(&embedding)?)
                        .await?;
                    println!("concept: {} (id {})", key, id);
                }
                ConceptAction::Observe {
                    session,
                    keys,
                    outcome,
                    context,
                } => {
                    let context: Option<JsonMap> = context
                        .map(|c| serde_json::from_str(&c))
                        .transpose()
                        .context("--context must be a JSON object")?;
                    let result = tracker
                        .observe(&session, &keys, &outcome, context.as_ref())
                        .await?;
                    println!("observations: {}", result.observations);
                    println!("transitions: {}", result.transitions);
                }
                ConceptAction::Predict { key, k } => {
                    let predictions = tracker.predict_next(&key, k).await?;
                    for p in &predictions {
                        println!("  {:<24} weight {:.4}  freq {}", p.target_key, p.weight, p.freq);
                    }
                    println!("predictions: {}", predictions.len());
                }
            }
            println!("ok");
        }
        Commands::Decay { action } => {
            let maintainer = DecayMaintainer::new(
                open_store(&cfg).await?,
                cfg.decay_params(),
                Duration::from_secs(cfg.decay.interval_secs),
            );
            match action {
                DecayAction::Once => {
                    let report = maintainer.run_pass().await?;
                    println!("edges_scanned: {}", report.edges_scanned);
                    println!("edges_updated: {}", report.edges_updated);
                    println!("trajectories_scanned: {}", report.trajectories_scanned);
                    println!("trajectories_updated: {}", report.trajectories_updated);
                }
                DecayAction::Run => {
                    let passes = maintainer
                        .run(async {
                            let _ = tokio::signal::ctrl_c().await;
                        })
                        .await;
                    println!("passes: {}", passes);
                }
            }
            println!("ok");
        }
        Commands::Units { selector, kind } => {
            let store = open_store(&cfg).await?;
            let units = if is_wildcard(&selector) {
                store
                    .units_matching(&PathPattern::parse(&selector)?, kind.as_deref())
                    .await?
            } else {
                store.units_under(&selector, kind.as_deref()).await?
            };
            for u in &units {
                println!(
                    "{}\t{}\t{}\t{}",
                    u.doc_key,
                    u.path,
                    u.kind,
                    u.label.as_deref().unwrap_or("")
                );
            }
            println!("units: {}", units.len());
            println!("ok");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    let pool = db::connect(cfg).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn graph_builder(cfg: &Config, store: Arc<dyn Store>) -> Result<MoveGraphBuilder> {
    let registry = ChannelRegistry::with_builtin(cfg.graph.dims);
    let builder = MoveGraphBuilder::new(store, registry, cfg.graph.alpha);
    Ok(match &cfg.channels.enabled {
        Some(enabled) => builder.with_default_channels(enabled.clone())?,
        None => builder,
    })
}

fn channel_filter(channels: &[String]) -> Option<&[String]> {
    if channels.is_empty() {
        None
    } else {
        Some(channels)
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn parse_floats(s: &str) -> Result<Vec<f32>> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<f32>()
                .with_context(|| format!("invalid embedding value '{}'", v))
        })
        .collect()
}
