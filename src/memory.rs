//! Process memory monitoring and adaptive batch sizing.
//!
//! The build never lets a batch grow the resident set without bound. Two
//! checks drive [`AdaptiveBatch`]:
//!
//! - **proactive**, before a batch runs: the projected footprint is compared
//!   to the thresholds. If even a single document would breach the hard
//!   limit the build fails with [`KbError::MemoryBudget`].
//! - **reactive**, after a batch commits: a resident set above the hard
//!   limit halves the batch size for the rest of the run.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::config::BuildConfig;
use crate::error::{KbError, Result};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Parsed JSON, bound parameters and FTS tokens cost a multiple of the raw
/// file size while a document is in flight.
const DOC_EXPANSION_FACTOR: f64 = 4.0;

/// Source of resident-set samples. `None` when the platform gives no reading.
pub trait MemorySampler: Send + Sync {
    fn resident_mb(&self) -> Option<f64>;
}

/// Physical memory of the current process via `memory-stats` (Linux, macOS,
/// Windows, FreeBSD).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSampler;

impl MemorySampler for ProcessSampler {
    fn resident_mb(&self) -> Option<f64> {
        memory_stats::memory_stats().map(|stats| stats.physical_mem as f64 / BYTES_PER_MB)
    }
}

/// Memory thresholds plus the sampler that measures against them.
pub struct MemoryMonitor {
    pub warn_mb: f64,
    pub limit_mb: Option<f64>,
    doc_overhead_bytes: u64,
    sampler: Box<dyn MemorySampler>,
    unavailable_warned: AtomicBool,
}

impl MemoryMonitor {
    pub fn new(warn_mb: f64, limit_mb: Option<f64>, doc_overhead_kb: u64) -> Self {
        Self {
            warn_mb,
            limit_mb,
            doc_overhead_bytes: doc_overhead_kb * 1024,
            sampler: Box::new(ProcessSampler),
            unavailable_warned: AtomicBool::new(false),
        }
    }

    pub fn from_config(build: &BuildConfig) -> Self {
        Self::new(build.memory_warn_mb, build.memory_limit_mb, build.doc_overhead_kb)
    }

    pub fn with_sampler(mut self, sampler: Box<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Current resident set size in MB.
    ///
    /// Without a reading, a configured hard limit cannot be enforced and the
    /// build fails; with only the soft threshold it warns once and reports 0.
    pub fn sample(&self) -> Result<f64> {
        if let Some(mb) = self.sampler.resident_mb() {
            return Ok(mb);
        }
        if let Some(limit_mb) = self.limit_mb {
            return Err(KbError::MemoryUnavailable { limit_mb });
        }
        if !self.unavailable_warned.swap(true, Ordering::Relaxed) {
            warn!("resident memory cannot be sampled on this platform, memory checks disabled");
        }
        Ok(0.0)
    }

    /// Estimated resident size after processing `batch_size` documents of
    /// `avg_doc_bytes` each.
    pub fn project(&self, batch_size: usize, avg_doc_bytes: u64) -> Result<f64> {
        Ok(self.project_from(self.sample()?, batch_size, avg_doc_bytes))
    }

    fn project_from(&self, resident_mb: f64, batch_size: usize, avg_doc_bytes: u64) -> f64 {
        resident_mb + batch_size as f64 * self.per_document_mb(avg_doc_bytes)
    }

    fn per_document_mb(&self, avg_doc_bytes: u64) -> f64 {
        (self.doc_overhead_bytes as f64 + avg_doc_bytes as f64 * DOC_EXPANSION_FACTOR) / BYTES_PER_MB
    }
}

/// Result of the reactive check after a batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    /// Above the soft threshold; batch size unchanged.
    Warn,
    /// Above the hard limit; batch size halved.
    OverLimit,
}

/// Current batch size, changed only by the memory checks below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveBatch {
    current: usize,
}

impl AdaptiveBatch {
    pub fn new(initial: usize) -> Self {
        Self {
            current: initial.max(1),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Proactive check. Returns the batch size to use for the next batch,
    /// shrinking it when the projection would cross the hard limit.
    pub fn before_batch(&mut self, monitor: &MemoryMonitor, avg_doc_bytes: u64) -> Result<usize> {
        let resident_mb = monitor.sample()?;
        let projected_mb = monitor.project_from(resident_mb, self.current, avg_doc_bytes);

        if projected_mb > monitor.warn_mb {
            warn!(
                projected_mb,
                warn_mb = monitor.warn_mb,
                batch_size = self.current,
                "projected memory usage above warning threshold"
            );
        }

        let Some(limit_mb) = monitor.limit_mb else {
            return Ok(self.current);
        };
        if projected_mb <= limit_mb {
            return Ok(self.current);
        }

        let minimum_mb = monitor.project_from(resident_mb, 1, avg_doc_bytes);
        if minimum_mb > limit_mb {
            return Err(KbError::MemoryBudget {
                projected_mb: minimum_mb,
                limit_mb,
                resident_mb,
            });
        }

        let per_doc = monitor.per_document_mb(avg_doc_bytes);
        let fits = ((limit_mb - resident_mb) / per_doc).floor() as usize;
        let shrunk = fits.clamp(1, self.current);
        warn!(
            projected_mb,
            limit_mb,
            from = self.current,
            to = shrunk,
            "projected memory usage above limit, shrinking batch"
        );
        self.current = shrunk;
        Ok(self.current)
    }

    /// Reactive check after a batch committed.
    pub fn after_commit(&mut self, monitor: &MemoryMonitor) -> Result<Pressure> {
        let resident_mb = monitor.sample()?;

        if let Some(limit_mb) = monitor.limit_mb {
            if resident_mb > limit_mb {
                let next = (self.current / 2).max(1);
                warn!(
                    resident_mb,
                    limit_mb,
                    from = self.current,
                    to = next,
                    "memory limit exceeded, halving batch size"
                );
                self.current = next;
                return Ok(Pressure::OverLimit);
            }
        }

        if resident_mb > monitor.warn_mb {
            warn!(resident_mb, warn_mb = monitor.warn_mb, "memory usage above warning threshold");
            return Ok(Pressure::Warn);
        }

        Ok(Pressure::Normal)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::MemorySampler;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Never produces a reading, like a platform without RSS support.
    pub struct UnavailableSampler;

    impl MemorySampler for UnavailableSampler {
        fn resident_mb(&self) -> Option<f64> {
            None
        }
    }

    /// Replays a fixed sequence of samples; the last one repeats forever.
    pub struct ScriptedSampler {
        samples: Mutex<VecDeque<f64>>,
        last: Mutex<f64>,
    }

    impl ScriptedSampler {
        pub fn new(samples: &[f64]) -> Self {
            Self {
                samples: Mutex::new(samples.iter().copied().collect()),
                last: Mutex::new(samples.last().copied().unwrap_or(0.0)),
            }
        }
    }

    impl MemorySampler for ScriptedSampler {
        fn resident_mb(&self) -> Option<f64> {
            let sample = match self.samples.lock().unwrap().pop_front() {
                Some(v) => {
                    *self.last.lock().unwrap() = v;
                    v
                }
                None => *self.last.lock().unwrap(),
            };
            Some(sample)
        }
    }
}
