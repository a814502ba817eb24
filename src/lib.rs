//! # Issues KB
//!
//! An incremental index builder and ranked query engine for a knowledge
//! base of issue records.
//!
//! Collectors drop one JSON file per issue under
//! `<root>/<source>/<language>/<issue_id>.json`. A build detects what
//! changed since the last successful run (by modification time), applies
//! upserts and deletes in memory-checked batches, maintains the FTS5
//! index, verifies integrity, and only then records the new index state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ JSON files  │──▶│ Build        │──▶│  SQLite   │
//! │ source/lang │   │ diff+batches │   │ rows+FTS5 │
//! └─────────────┘   └──────┬───────┘   └─────┬─────┘
//!                          │                 │
//!                          ▼                 ▼
//!                   ┌─────────────┐   ┌────────────┐
//!                   │ index_state │   │ QueryEngine│
//!                   │   .json     │   │ bm25 + LRU │
//!                   └─────────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ikb init                      # create the store
//! ikb build                     # index new and changed issues
//! ikb search "sql injec"        # ranked prefix search
//! ikb health                    # FTS5 + SQLite integrity check
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and env overrides |
//! | [`models`] | Issue document and search result types |
//! | [`source`] | Document tree scan, load and write |
//! | [`state`] | Persisted key → mtime map |
//! | [`changes`] | Change detection |
//! | [`memory`] | RSS sampling and adaptive batch sizing |
//! | [`indexer`] | Batched upserts and deletes |
//! | [`lifecycle`] | FTS5 merge/optimize and integrity checks |
//! | [`ingest`] | Build orchestration |
//! | [`search`] | Ranked full-text queries with caching |
//! | [`monitor`] | Metrics and alert sinks |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod changes;
pub mod config;
pub mod db;
pub mod error;
pub mod get;
pub mod indexer;
pub mod ingest;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod monitor;
pub mod progress;
pub mod search;
pub mod source;
pub mod state;
pub mod stats;
