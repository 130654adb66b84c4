//! # Trajectory Harness
//!
//! Decomposes marked-up documents and record streams into addressable
//! units, turns their text into per-channel feature vectors ("moves"), and
//! links consecutive moves into a frequency-weighted transition graph that
//! decays with time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Corpus    │──▶│   Explode   │──▶│  Move Graph  │──▶│  SQLite  │
//! │ markup/JSONL│   │ rules/generic│  │ channels+edges│   │  Store   │
//! └─────────────┘   └─────────────┘   └──────────────┘   └────┬─────┘
//!                                                             │
//!                                       ┌─────────────────────┤
//!                                       ▼                     ▼
//!                                 ┌──────────┐          ┌──────────┐
//!                                 │  Decay   │          │   CLI    │
//!                                 │  loop    │          │  (trj)   │
//!                                 └──────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! trj init
//! trj load bible proverbs ./proverbs.xml --format markup
//! trj explode markup bible proverbs --rules ./rules/proverbs.json
//! trj ingest units 'PRV.*' --kind verse
//! trj decay once
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`xml`] | Arena markup tree and path selectors |
//! | [`explode`] | Rule-driven, generic, and record-stream extraction |
//! | [`path`] | Path sanitizing, templates, and patterns |
//! | [`chunk`] | Sentence splitting |
//! | [`channels`] | Channel registry and built-in channelizers |
//! | [`vector`] | Vector fitting, deltas, and BLOB encoding |
//! | [`graph`] | Move graph builder |
//! | [`ingest`] | Ingestion entry points |
//! | [`concepts`] | Concept-level trajectories |
//! | [`decay`] | Weight curve and decay maintainer |
//! | [`store`] | Storage trait and backends |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Database statistics |

pub mod channels;
pub mod chunk;
pub mod concepts;
pub mod config;
pub mod db;
pub mod decay;
pub mod explode;
pub mod graph;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod path;
pub mod stats;
pub mod store;
pub mod vector;
pub mod xml;
