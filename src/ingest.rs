//! Incremental index build.
//!
//! Runs the build state machine:
//!
//! ```text
//! SCAN → DIFF ─┬─▶ UP_TO_DATE
//!              └─▶ SETUP → WRITE_BATCHES* → DELETE_REMOVED → MERGE
//!                  → OPTIMIZE → INTEGRITY_CHECK → COMMIT_STATE
//! (any step) ──▶ ABORT   (index state left untouched)
//! ```
//!
//! The index state file is the commit point. Batches written before an
//! abort stay in the store; the unchanged state makes the next run redo them.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::changes::{self, ChangeSet};
use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::indexer::{BatchIndexer, IndexStats};
use crate::lifecycle::{self, IndexLifecycle};
use crate::memory::MemoryMonitor;
use crate::migrate;
use crate::monitor::{self, Event, EventSink, EventStatus};
use crate::progress::{BuildProgressEvent, BuildProgressReporter, ProgressMode};
use crate::source;
use crate::state::IndexState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Scan,
    Diff,
    UpToDate,
    Setup,
    WriteBatches,
    DeleteRemoved,
    Merge,
    Optimize,
    IntegrityCheck,
    CommitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    UpToDate,
    Built,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub correlation_id: String,
    pub outcome: BuildOutcome,
    pub scanned: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped_deletes: usize,
    pub batch_sizes: Vec<usize>,
    pub elapsed: Duration,
}

/// Run one incremental build against `config`.
///
/// `config.build.batch_size` is the starting batch size; the memory
/// monitor may shrink it during the run.
pub async fn run_build(
    config: &Config,
    monitor: &MemoryMonitor,
    progress: &dyn BuildProgressReporter,
    sink: &dyn EventSink,
) -> Result<BuildReport> {
    let cid = correlation_id();
    let span = tracing::info_span!("build", cid = %cid);

    let mut build = Build {
        config,
        monitor,
        progress,
        cid,
        phase: BuildPhase::Scan,
        started: Instant::now(),
    };

    let result = build.execute().instrument(span.clone()).await;
    let _entered = span.enter();

    match &result {
        Ok(report) => {
            sink.record(
                &Event::new("index_build", EventStatus::Success)
                    .with("cid", report.correlation_id.clone())
                    .with("outcome", serde_json::to_value(report.outcome).unwrap_or_default())
                    .with("updated", report.updated)
                    .with("removed", report.removed)
                    .with("duration_ms", report.elapsed.as_millis() as u64),
            );
        }
        Err(e) => {
            error!(phase = ?build.phase, error = %e, "build aborted, index state not committed");
            sink.record(
                &Event::new("index_build", EventStatus::Failure)
                    .with("cid", build.cid.clone())
                    .with("phase", serde_json::to_value(build.phase).unwrap_or_default())
                    .with("error", e.to_string()),
            );
            sink.critical(&format!("index build failed during {:?}: {}", build.phase, e));
        }
    }

    result
}

struct Build<'a> {
    config: &'a Config,
    monitor: &'a MemoryMonitor,
    progress: &'a dyn BuildProgressReporter,
    cid: String,
    phase: BuildPhase,
    started: Instant,
}

impl Build<'_> {
    fn enter(&mut self, phase: BuildPhase) {
        debug!(from = ?self.phase, to = ?phase, "build phase");
        self.phase = phase;
    }

    async fn execute(&mut self) -> Result<BuildReport> {
        let config = self.config;

        self.enter(BuildPhase::Scan);
        self.progress.report(BuildProgressEvent::Scanning);
        let store_exists = config.db.path.exists();
        let old_state = if store_exists {
            IndexState::load(&config.state.path)?
        } else {
            if config.state.path.exists() {
                warn!(db = %config.db.path.display(), "store missing, ignoring index state and rebuilding");
            }
            IndexState::new()
        };
        let scan = source::scan_documents(&config.documents.root)?;

        self.enter(BuildPhase::Diff);
        let changes = changes::detect_changes(&scan, &old_state);
        info!(
            total = scan.len(),
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            "scan complete"
        );

        if changes.is_empty() && store_exists {
            self.enter(BuildPhase::UpToDate);
            info!(seconds = self.started.elapsed().as_secs_f64(), "index up to date");
            return Ok(self.report(BuildOutcome::UpToDate, scan.len(), IndexStats::default()));
        }

        self.enter(BuildPhase::Setup);
        let pool = db::connect(config).await?;
        let result = self.apply(&pool, &scan, changes).await;
        pool.close().await;

        let stats = result?;
        info!(
            updated = stats.upserted,
            removed = stats.deleted,
            seconds = self.started.elapsed().as_secs_f64(),
            "index build complete"
        );
        Ok(self.report(BuildOutcome::Built, scan.len(), stats))
    }

    async fn apply(
        &mut self,
        pool: &SqlitePool,
        scan: &[source::ScanEntry],
        changes: ChangeSet,
    ) -> Result<IndexStats> {
        let config = self.config;
        migrate::ensure_schema(pool).await?;
        let lifecycle = IndexLifecycle::from_config(&config.index);
        lifecycle.prepare(pool).await?;

        let mut indexer = BatchIndexer::new(
            pool,
            self.monitor,
            self.progress,
            config.build.batch_size,
            config.documents.max_document_bytes,
        );

        self.enter(BuildPhase::WriteBatches);
        indexer.write_batches(&changes.changed).await?;

        self.enter(BuildPhase::DeleteRemoved);
        let live_ids: HashSet<String> = scan
            .iter()
            .map(|e| source::issue_id_for_key(&e.key).to_string())
            .collect();
        indexer.delete_removed(&changes.removed, &live_ids).await?;

        self.enter(BuildPhase::Merge);
        lifecycle.merge(pool).await?;

        self.enter(BuildPhase::Optimize);
        lifecycle.optimize(pool).await?;

        self.enter(BuildPhase::IntegrityCheck);
        lifecycle::check_integrity(pool).await?;

        self.enter(BuildPhase::CommitState);
        changes.new_state.save(&config.state.path)?;

        Ok(indexer.into_stats())
    }

    fn report(&self, outcome: BuildOutcome, scanned: usize, stats: IndexStats) -> BuildReport {
        BuildReport {
            correlation_id: self.cid.clone(),
            outcome,
            scanned,
            updated: stats.upserted,
            removed: stats.deleted,
            skipped_deletes: stats.skipped_deletes,
            batch_sizes: stats.batch_sizes,
            elapsed: self.started.elapsed(),
        }
    }
}

/// CLI entry point for `ikb build`.
pub async fn run_build_command(config: &Config, progress: ProgressMode) -> anyhow::Result<()> {
    let memory = MemoryMonitor::from_config(&config.build);
    let reporter = progress.reporter();
    let sink = monitor::sink_from_config(&config.monitoring);

    let report = run_build(config, &memory, reporter.as_ref(), sink.as_ref()).await?;

    match report.outcome {
        BuildOutcome::UpToDate => {
            println!("Index up to date ({} files).", report.scanned);
        }
        BuildOutcome::Built => {
            println!("Build {} complete:", report.correlation_id);
            println!("  scanned:  {}", report.scanned);
            println!("  updated:  {}", report.updated);
            println!("  removed:  {}", report.removed);
            if report.skipped_deletes > 0 {
                println!("  kept:     {} (moved)", report.skipped_deletes);
            }
            println!("  batches:  {}", report.batch_sizes.len());
            println!("  elapsed:  {:.2}s", report.elapsed.as_secs_f64());
        }
    }
    Ok(())
}

fn correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KbError;
    use crate::memory::testing::ScriptedSampler;
    use crate::models::{IssueDocument, Signal};
    use crate::monitor::NoopSink;
    use crate::progress::NoProgress;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn id(n: u32) -> String {
        format!("{:040x}", n)
    }

    fn write_doc(config: &Config, n: u32, title: &str) -> PathBuf {
        let mut doc = IssueDocument::new(id(n), "src", title);
        doc.language = Some("py".into());
        doc.signals = vec![Signal { kind: "rule".into(), value: "S1".into() }];
        source::write_issue(&config.documents.root, &doc).unwrap()
    }

    fn config_with(root: &Path, batch_size: usize) -> Config {
        let mut config = Config::rooted_at(root);
        config.build.batch_size = batch_size;
        config.monitoring.enabled = false;
        config
    }

    fn quiet_monitor() -> MemoryMonitor {
        MemoryMonitor::new(1.0e9, None, 64)
    }

    async fn build(config: &Config, monitor: &MemoryMonitor) -> Result<BuildReport> {
        run_build(config, monitor, &NoProgress, &NoopSink).await
    }

    async fn issue_count(config: &Config) -> i64 {
        let pool = db::connect(config).await.unwrap();
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM issues")
            .fetch_one(&pool)
            .await
            .unwrap();
        pool.close().await;
        n
    }

    #[tokio::test]
    async fn second_build_without_changes_is_up_to_date() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(tmp.path(), 3);
        for n in 0..10 {
            write_doc(&config, n, &format!("Issue {}", n));
        }

        let first = build(&config, &quiet_monitor()).await.unwrap();
        assert_eq!(first.outcome, BuildOutcome::Built);
        assert_eq!(first.updated, 10);
        assert_eq!(first.batch_sizes, vec![3, 3, 3, 1]);

        let second = build(&config, &quiet_monitor()).await.unwrap();
        assert_eq!(second.outcome, BuildOutcome::UpToDate);
        assert_eq!(second.updated, 0);
        assert_eq!(issue_count(&config).await, 10);
    }

    #[tokio::test]
    async fn memory_pressure_halves_following_batches() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(tmp.path(), 4);
        for n in 0..10 {
            write_doc(&config, n, "Issue");
        }

        // before batch 1, after batch 1 (over limit), then calm
        let monitor = MemoryMonitor::new(1000.0, Some(500.0), 1)
            .with_sampler(Box::new(ScriptedSampler::new(&[100.0, 900.0, 100.0])));
        let report = build(&config, &monitor).await.unwrap();
        assert_eq!(report.batch_sizes, vec![4, 2, 2, 2]);
        assert_eq!(issue_count(&config).await, 10);
    }

    #[tokio::test]
    async fn projected_breach_fails_before_any_write() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(tmp.path(), 4);
        for n in 0..3 {
            write_doc(&config, n, "Issue");
        }

        let monitor = MemoryMonitor::new(10.0, Some(50.0), 64)
            .with_sampler(Box::new(ScriptedSampler::new(&[100.0])));
        let err = build(&config, &monitor).await.unwrap_err();
        assert!(matches!(err, KbError::MemoryBudget { .. }));
        assert!(err.to_string().contains("projected memory"));
        assert_eq!(issue_count(&config).await, 0);
        assert!(!config.state.path.exists());
    }

    #[tokio::test]
    async fn malformed_document_aborts_but_keeps_committed_batches() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(tmp.path(), 2);
        let mut paths = Vec::new();
        for n in 0..5 {
            paths.push(write_doc(&config, n, "Issue"));
        }
        fs::write(&paths[2], "{ not json").unwrap();

        let err = build(&config, &quiet_monitor()).await.unwrap_err();
        assert!(matches!(err, KbError::Validation { .. }));
        assert_eq!(issue_count(&config).await, 2);
        assert!(!config.state.path.exists());

        write_doc(&config, 2, "Issue fixed");
        let report = build(&config, &quiet_monitor()).await.unwrap();
        assert_eq!(report.updated, 5);
        assert_eq!(issue_count(&config).await, 5);
    }

    #[tokio::test]
    async fn removed_file_is_deleted_and_moved_file_is_kept() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(tmp.path(), 10);
        let gone = write_doc(&config, 1, "Going away");
        let moved = write_doc(&config, 2, "Moving");
        write_doc(&config, 3, "Staying");
        build(&config, &quiet_monitor()).await.unwrap();

        fs::remove_file(&gone).unwrap();
        let new_dir = config.documents.root.join("src/python");
        fs::create_dir_all(&new_dir).unwrap();
        fs::rename(&moved, new_dir.join(format!("{}.json", id(2)))).unwrap();

        let report = build(&config, &quiet_monitor()).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.skipped_deletes, 1);
        assert_eq!(issue_count(&config).await, 2);

        let state = IndexState::load(&config.state.path).unwrap();
        assert_eq!(state.len(), 2);
        lifecycle::run_health_check(&config).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_store_triggers_full_rebuild() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(tmp.path(), 10);
        for n in 0..4 {
            write_doc(&config, n, "Issue");
        }
        build(&config, &quiet_monitor()).await.unwrap();
        fs::remove_file(&config.db.path).unwrap();

        let report = build(&config, &quiet_monitor()).await.unwrap();
        assert_eq!(report.outcome, BuildOutcome::Built);
        assert_eq!(report.updated, 4);
        assert_eq!(issue_count(&config).await, 4);
    }
}
