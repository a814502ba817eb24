use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const ENV_BATCH_SIZE: &str = "ISSUES_KB_BATCH_SIZE";
pub const ENV_MEMORY_WARN_MB: &str = "ISSUES_KB_MEMORY_WARN_MB";
pub const ENV_MEMORY_LIMIT_MB: &str = "ISSUES_KB_MEMORY_LIMIT_MB";
pub const ENV_METRICS_ENABLED: &str = "METRICS_ENABLED";

pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("issuesdb/issues.sqlite")
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_documents_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_documents_root(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_documents_root() -> PathBuf {
    PathBuf::from("issuesdb/issues")
}
fn default_max_document_bytes() -> u64 {
    5 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("issuesdb/index_state.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_memory_warn_mb")]
    pub memory_warn_mb: f64,
    #[serde(default)]
    pub memory_limit_mb: Option<f64>,
    /// Fixed per-document cost used when projecting batch memory.
    #[serde(default = "default_doc_overhead_kb")]
    pub doc_overhead_kb: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            memory_warn_mb: default_memory_warn_mb(),
            memory_limit_mb: None,
            doc_overhead_kb: default_doc_overhead_kb(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_memory_warn_mb() -> f64 {
    512.0
}
fn default_doc_overhead_kb() -> u64 {
    64
}

/// FTS5 merge tuning. Magnitudes are performance knobs, not semantics.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_automerge")]
    pub automerge: u32,
    #[serde(default = "default_merge_pages")]
    pub merge_pages: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            automerge: default_automerge(),
            merge_pages: default_merge_pages(),
        }
    }
}

fn default_automerge() -> u32 {
    4
}
fn default_merge_pages() -> u32 {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub prefix_all_tokens: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
            cache_capacity: default_cache_capacity(),
            prefix_all_tokens: false,
        }
    }
}

fn default_max_limit() -> usize {
    100
}
fn default_cache_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_dir")]
    pub metrics_dir: PathBuf,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_dir: default_metrics_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_metrics_dir() -> PathBuf {
    PathBuf::from("metrics")
}

impl Config {
    /// Defaults used when no config file is present.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig::default(),
            documents: DocumentsConfig::default(),
            state: StateConfig::default(),
            build: BuildConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Config rooted at a single knowledge-base directory, laid out like
    /// the defaults (`<root>/issues`, `<root>/issues.sqlite`, ...).
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::minimal();
        config.db.path = root.join("issues.sqlite");
        config.documents.root = root.join("issues");
        config.state.path = root.join("index_state.json");
        config.monitoring.metrics_dir = root.join("metrics");
        config
    }

    /// Apply environment fallbacks through `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            self.build.batch_size = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer, got '{}'", ENV_BATCH_SIZE, raw))?;
        }
        if let Some(raw) = lookup(ENV_MEMORY_WARN_MB) {
            self.build.memory_warn_mb = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number, got '{}'", ENV_MEMORY_WARN_MB, raw))?;
        }
        if let Some(raw) = lookup(ENV_MEMORY_LIMIT_MB) {
            let limit: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number, got '{}'", ENV_MEMORY_LIMIT_MB, raw))?;
            self.build.memory_limit_mb = Some(limit);
        }
        if let Some(raw) = lookup(ENV_METRICS_ENABLED) {
            self.monitoring.enabled = !raw.trim().eq_ignore_ascii_case("false");
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.build.batch_size) {
            bail!(
                "build.batch_size must be in [1, {}], got {}",
                MAX_BATCH_SIZE,
                self.build.batch_size
            );
        }
        if self.build.memory_warn_mb <= 0.0 || !self.build.memory_warn_mb.is_finite() {
            bail!("build.memory_warn_mb must be > 0");
        }
        if let Some(limit) = self.build.memory_limit_mb {
            if limit <= 0.0 || !limit.is_finite() {
                bail!("build.memory_limit_mb must be > 0");
            }
        }
        if self.documents.max_document_bytes == 0 {
            bail!("documents.max_document_bytes must be > 0");
        }
        if self.index.automerge == 0 || self.index.merge_pages == 0 {
            bail!("index.automerge and index.merge_pages must be > 0");
        }
        if self.search.max_limit == 0 {
            bail!("search.max_limit must be >= 1");
        }
        if self.search.cache_capacity == 0 {
            bail!("search.cache_capacity must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to [`Config::minimal`].
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_limit_overrides_file() {
        let mut config = Config::minimal();
        config
            .apply_env_overrides(lookup_from(&[(ENV_MEMORY_LIMIT_MB, "123")]))
            .unwrap();
        assert_eq!(config.build.memory_limit_mb, Some(123.0));
    }

    #[test]
    fn env_batch_size_out_of_range_rejected() {
        let mut config = Config::minimal();
        let err = config
            .apply_env_overrides(lookup_from(&[(ENV_BATCH_SIZE, "10001")]))
            .unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn metrics_disabled_by_env() {
        let mut config = Config::minimal();
        config
            .apply_env_overrides(lookup_from(&[(ENV_METRICS_ENABLED, "FALSE")]))
            .unwrap();
        assert!(!config.monitoring.enabled);
    }

    #[test]
    fn parses_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [build]
            batch_size = 3
            memory_limit_mb = 2048

            [search]
            prefix_all_tokens = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.build.batch_size, 3);
        assert_eq!(config.build.memory_limit_mb, Some(2048.0));
        assert_eq!(config.index.automerge, 4);
        assert!(config.search.prefix_all_tokens);
    }

    #[test]
    fn rejects_zero_warn_threshold() {
        let mut config = Config::minimal();
        config.build.memory_warn_mb = 0.0;
        assert!(config.validate().is_err());
    }
}
