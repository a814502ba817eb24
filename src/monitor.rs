//! Fire-and-forget notifications to the metrics/alerting collaborator.
//!
//! Sinks never fail the operation that notifies them: write errors are
//! logged and swallowed.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::config::MonitoringConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failure,
}

/// One metrics record, e.g. `index_build` / `success` with counts.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: String,
    pub event_type: String,
    pub status: EventStatus,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, status: EventStatus) -> Self {
        Self {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            event_type: event_type.into(),
            status,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &Event);

    /// Publish the latest health-check outcome.
    fn health_status(&self, _ok: bool, _detail: Option<&str>) {}

    /// Raise an operator alert.
    fn critical(&self, message: &str) {
        error!(target: "alerts", "{}", message);
    }
}

/// Discards everything except alerts, which still reach the log.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &Event) {}
}

/// Appends events as JSON lines to `<dir>/daily/YYYY-MM-DD.json` and keeps
/// `<dir>/health_status.json` current.
pub struct DailyMetricsSink {
    dir: PathBuf,
}

impl DailyMetricsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn daily_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join("daily").join(format!("{}.json", day.format("%Y-%m-%d")))
    }

    pub fn health_path(&self) -> PathBuf {
        self.dir.join("health_status.json")
    }

    pub fn record_on(&self, day: NaiveDate, event: &Event) {
        if let Err(e) = append_line(&self.daily_path(day), event) {
            warn!(error = %e, event_type = %event.event_type, "failed to record metrics event");
        }
    }
}

impl EventSink for DailyMetricsSink {
    fn record(&self, event: &Event) {
        self.record_on(Utc::now().date_naive(), event);
    }

    fn health_status(&self, ok: bool, detail: Option<&str>) {
        let status = serde_json::json!({
            "status": if ok { "ok" } else { "error" },
            "checked_at": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "detail": detail,
        });
        let path = self.health_path();
        let written = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&path, status.to_string()));
        if let Err(e) = written {
            warn!(error = %e, path = %path.display(), "failed to write health status");
        }
    }
}

fn append_line(path: &Path, event: &Event) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(event)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

pub fn sink_from_config(config: &MonitoringConfig) -> Box<dyn EventSink> {
    if config.enabled {
        Box::new(DailyMetricsSink::new(&config.metrics_dir))
    } else {
        Box::new(NoopSink)
    }
}
