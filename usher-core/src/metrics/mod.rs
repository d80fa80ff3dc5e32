//! Latency and outcome metrics with a low-contention write path.
//!
//! Samples are appended to one of several shards picked round-robin, so
//! concurrent `record` calls rarely touch the same lock and never block the
//! admission path for long. Aggregation is computed on read over the samples
//! falling inside the requested time window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use usher_common::MetricsConfig;

/// A single latency/outcome observation. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Free-form operation tag, e.g. "query".
    pub operation: String,
    /// Wall-clock time the sample was recorded.
    pub timestamp: DateTime<Utc>,
    /// Observed duration in milliseconds.
    pub duration_ms: f64,
    /// Whether the operation succeeded.
    pub success: bool,
}

/// Aggregated statistics over a window of samples.
///
/// Every field has an explicit zero default; an empty window yields
/// `AggregateStats::default()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregateStats {
    /// Samples in the window.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub avg_ms: f64,
    /// Median duration in milliseconds.
    pub p50_ms: f64,
    /// 95th percentile duration in milliseconds.
    pub p95_ms: f64,
    /// 99th percentile duration in milliseconds.
    pub p99_ms: f64,
    /// Fraction of samples that succeeded, in `[0, 1]`.
    pub success_rate: f64,
}

struct Shard {
    samples: Mutex<Vec<MetricSample>>,
}

/// Append-only metrics recorder.
///
/// Writes go to a round-robin shard under a short per-shard lock; reads merge
/// all shards. Samples are pruned by age and per-shard count on the write
/// path so the recorder's memory stays bounded without a maintenance thread.
pub struct MetricsRecorder {
    shards: Vec<Shard>,
    next_shard: AtomicUsize,
    retention: Duration,
    max_samples_per_shard: usize,
}

impl MetricsRecorder {
    /// Create a recorder from configuration.
    pub fn new(config: &MetricsConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| Shard {
                    samples: Mutex::new(Vec::new()),
                })
                .collect(),
            next_shard: AtomicUsize::new(0),
            retention: config.retention(),
            max_samples_per_shard: config.max_samples_per_shard.max(1),
        }
    }

    /// Record one observation.
    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        let sample = MetricSample {
            operation: operation.to_string(),
            timestamp: Utc::now(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            success,
        };

        let index = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let mut samples = self.shards[index]
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        samples.push(sample);

        if samples.len() > self.max_samples_per_shard {
            Self::prune_shard(&mut samples, Utc::now(), self.retention, self.max_samples_per_shard);
        }
    }

    /// Aggregate samples recorded within `window` of now, optionally
    /// restricted to one operation tag.
    pub fn get_stats(&self, operation: Option<&str>, window: Duration) -> AggregateStats {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut durations = Vec::new();
        let mut successes = 0usize;
        for shard in &self.shards {
            let samples = shard
                .samples
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for sample in samples.iter() {
                if sample.timestamp < cutoff {
                    continue;
                }
                if let Some(op) = operation {
                    if sample.operation != op {
                        continue;
                    }
                }
                durations.push(sample.duration_ms);
                if sample.success {
                    successes += 1;
                }
            }
        }

        if durations.is_empty() {
            return AggregateStats::default();
        }

        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = durations.len();
        AggregateStats {
            count,
            avg_ms: durations.iter().sum::<f64>() / count as f64,
            p50_ms: percentile(&durations, 0.50),
            p95_ms: percentile(&durations, 0.95),
            p99_ms: percentile(&durations, 0.99),
            success_rate: successes as f64 / count as f64,
        }
    }

    /// Remove samples, optionally restricted to one operation tag.
    ///
    /// Returns the number of samples removed.
    pub fn clear(&self, operation: Option<&str>) -> usize {
        let mut cleared = 0;
        for shard in &self.shards {
            let mut samples = shard
                .samples
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match operation {
                Some(op) => {
                    let before = samples.len();
                    samples.retain(|s| s.operation != op);
                    cleared += before - samples.len();
                }
                None => {
                    cleared += samples.len();
                    samples.clear();
                }
            }
        }
        debug!(cleared, "cleared metric samples");
        cleared
    }

    /// Drop samples older than the configured retention.
    ///
    /// Returns the number of samples removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        for shard in &self.shards {
            let mut samples = shard
                .samples
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = samples.len();
            Self::prune_shard(&mut samples, now, self.retention, self.max_samples_per_shard);
            pruned += before - samples.len();
        }
        pruned
    }

    /// Total samples currently held across all shards.
    pub fn sample_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.samples
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len()
            })
            .sum()
    }

    fn prune_shard(
        samples: &mut Vec<MetricSample>,
        now: DateTime<Utc>,
        retention: Duration,
        max_len: usize,
    ) {
        let cutoff = now
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        samples.retain(|s| s.timestamp >= cutoff);
        if samples.len() > max_len {
            let excess = samples.len() - max_len;
            samples.drain(..excess);
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
