//! # Issues KB CLI (`ikb`)
//!
//! ## Usage
//!
//! ```bash
//! ikb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ikb init` | Create the SQLite store and run schema migrations |
//! | `ikb build` | Incrementally index new, changed and removed issues |
//! | `ikb search "<query>"` | Ranked search over indexed issues |
//! | `ikb get <issue_id>` | Print a full issue as JSON |
//! | `ikb stats` | Store counts and per-source breakdown |
//! | `ikb health` | FTS5 and SQLite integrity check |
//!
//! Settings resolve as CLI flag, then environment
//! (`ISSUES_KB_BATCH_SIZE`, `ISSUES_KB_MEMORY_WARN_MB`,
//! `ISSUES_KB_MEMORY_LIMIT_MB`, `METRICS_ENABLED`), then config file, then
//! built-in defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use issues_kb::config::{self, Config, MAX_BATCH_SIZE};
use issues_kb::progress::ProgressMode;
use issues_kb::{get, ingest, lifecycle, logging, migrate, monitor, search, stats};

/// Issues KB CLI: incremental indexing and ranked search for issue records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, paths default to `./issuesdb/...` relative to the
/// working directory.
#[derive(Parser)]
#[command(
    name = "ikb",
    about = "Issues KB: incremental index builder and ranked query engine for issue records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kb.toml`; built-in defaults apply if it does
    /// not exist.
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema. Safe to run repeatedly.
    Init,

    /// Index new and changed issues, delete removed ones.
    ///
    /// Only files whose modification time differs from the last successful
    /// build are read. The index state is saved only when the whole build,
    /// including the integrity check, succeeds.
    Build {
        /// Starting batch size (documents per transaction).
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_BATCH_SIZE as u64))]
        batch_size: Option<u64>,

        /// Soft RSS threshold in MB; crossing it only logs a warning.
        #[arg(long)]
        memory_warn_mb: Option<f64>,

        /// Hard RSS limit in MB; batches shrink to stay under it.
        #[arg(long)]
        memory_limit_mb: Option<f64>,

        /// Progress output on stderr. Defaults to `human` on a terminal,
        /// `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Ranked full-text search.
    Search {
        /// Query text. Operators are ignored; the last word matches as a prefix.
        query: String,

        /// Maximum number of results (clamped to `search.max_limit`).
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a full issue by id.
    Get {
        /// 40-character issue id.
        issue_id: String,
    },

    /// Show store statistics.
    Stats,

    /// Verify store integrity. Exits non-zero on failure.
    Health {
        /// Check this database instead of the configured one.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    let mut cfg: Config = config::load_config_or_default(&cli.config)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Build {
            batch_size,
            memory_warn_mb,
            memory_limit_mb,
            progress,
        } => {
            if let Some(n) = batch_size {
                cfg.build.batch_size = n as usize;
            }
            if let Some(mb) = memory_warn_mb {
                cfg.build.memory_warn_mb = mb;
            }
            if let Some(mb) = memory_limit_mb {
                cfg.build.memory_limit_mb = Some(mb);
            }
            cfg.validate()?;

            let mode = progress.unwrap_or_else(ProgressMode::detect);
            ingest::run_build_command(&cfg, mode).await?;
        }
        Commands::Search { query, limit, json } => {
            search::run_search(&cfg, &query, limit, json).await?;
        }
        Commands::Get { issue_id } => {
            get::run_get(&cfg, &issue_id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Health { db_path } => {
            if let Some(path) = db_path {
                cfg.db.path = path;
            }
            let sink = monitor::sink_from_config(&cfg.monitoring);
            lifecycle::run_health_command(&cfg, sink.as_ref()).await?;
        }
    }

    Ok(())
}
