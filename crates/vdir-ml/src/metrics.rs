//! Operation metrics and completion callbacks.
//!
//! Tracks operation counts, error rates and per-phase latencies by operation
//! kind and origin, and fans each completed operation out to registered
//! observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

use crate::error::ResultCode;
use crate::types::{OpKind, OpOrigin, Usn};

/// Time spent in each phase of one operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTimings {
    /// Pre-mutation plugin phase.
    pub pre_plugin: Duration,
    /// Waiting for the write-queue head.
    pub wq_wait: Duration,
    /// Beginning backend transactions (all attempts).
    pub be_begin: Duration,
    /// Committing the backend transaction.
    pub be_commit: Duration,
    /// Post-commit plugin phase.
    pub post_plugin: Duration,
    /// Whole operation.
    pub total: Duration,
}

/// One completed operation, as handed to observers.
#[derive(Clone, Debug, Serialize)]
pub struct OpRecord {
    /// Operation kind.
    pub kind: OpKind,
    /// Operation origin.
    pub origin: OpOrigin,
    /// Normalized target DN.
    pub dn: String,
    /// Bind DN of the requester.
    pub requester: String,
    /// USN assigned to the operation, if any.
    pub usn: Usn,
    /// Result code.
    #[serde(skip)]
    pub code: ResultCode,
    /// Phase timings.
    pub timings: PhaseTimings,
}

/// Callback invoked once per completed operation.
pub trait OpObserver: Send + Sync {
    /// Called after the operation finished, successful or not.
    fn on_op_complete(&self, record: &OpRecord);
}

/// Aggregated metrics for one (kind, origin) pair.
#[derive(Clone, Debug, Default, Serialize)]
pub struct OpMetrics {
    /// Number of operations.
    pub count: u64,
    /// Number of errors.
    pub errors: u64,
    /// Total duration in microseconds.
    pub total_duration_us: u64,
    /// Maximum duration in microseconds.
    pub max_duration_us: u64,
    /// Total write-queue wait in microseconds.
    pub wq_wait_us: u64,
    /// Total plugin time (pre + post) in microseconds.
    pub plugin_us: u64,
    /// Total backend begin + commit time in microseconds.
    pub backend_us: u64,
}

impl OpMetrics {
    /// Returns the average duration in microseconds.
    pub fn avg_duration_us(&self) -> u64 {
        if self.count > 0 {
            self.total_duration_us / self.count
        } else {
            0
        }
    }

    /// Returns the error rate (errors / total operations).
    pub fn error_rate(&self) -> f64 {
        if self.count > 0 {
            self.errors as f64 / self.count as f64
        } else {
            0.0
        }
    }
}

/// Point-in-time view of all counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Per kind/origin metrics, keyed as `"<kind>/<origin>"`.
    pub ops: HashMap<String, OpMetrics>,
    /// Total number of operations.
    pub total_ops: u64,
    /// Total number of errors.
    pub total_errors: u64,
    /// Operations slower than the configured thresholds.
    pub slow_ops: u64,
    /// Deadlock retries performed.
    pub deadlock_retries: u64,
}

/// Metrics collector for the directory service.
pub struct MetricsCollector {
    op_metrics: RwLock<HashMap<(OpKind, OpOrigin), OpMetrics>>,
    slow_ops: AtomicU64,
    deadlock_retries: AtomicU64,
}

impl MetricsCollector {
    /// Creates a new MetricsCollector.
    pub fn new() -> Self {
        Self {
            op_metrics: RwLock::new(HashMap::new()),
            slow_ops: AtomicU64::new(0),
            deadlock_retries: AtomicU64::new(0),
        }
    }

    /// Records a completed operation.
    pub fn record(&self, record: &OpRecord) {
        let t = &record.timings;
        let total_us = t.total.as_micros() as u64;
        let mut metrics = self.op_metrics.write().unwrap_or_else(|e| e.into_inner());
        let entry = metrics.entry((record.kind, record.origin)).or_default();
        entry.count += 1;
        if record.code != ResultCode::Success {
            entry.errors += 1;
        }
        entry.total_duration_us += total_us;
        entry.max_duration_us = entry.max_duration_us.max(total_us);
        entry.wq_wait_us += t.wq_wait.as_micros() as u64;
        entry.plugin_us += (t.pre_plugin + t.post_plugin).as_micros() as u64;
        entry.backend_us += (t.be_begin + t.be_commit).as_micros() as u64;
    }

    /// Increments the slow-operation counter.
    pub fn record_slow_op(&self) {
        self.slow_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the deadlock retry counter.
    pub fn record_deadlock_retry(&self) {
        self.deadlock_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets metrics for one kind and origin.
    pub fn get_op_metrics(&self, kind: OpKind, origin: OpOrigin) -> OpMetrics {
        let metrics = self.op_metrics.read().unwrap_or_else(|e| e.into_inner());
        metrics.get(&(kind, origin)).cloned().unwrap_or_default()
    }

    /// Creates a point-in-time snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let op_metrics = self.op_metrics.read().unwrap_or_else(|e| e.into_inner());
        let mut total_ops = 0u64;
        let mut total_errors = 0u64;
        let ops = op_metrics
            .iter()
            .map(|((kind, origin), v)| {
                total_ops += v.count;
                total_errors += v.errors;
                (format!("{}/{}", kind, origin), v.clone())
            })
            .collect();
        MetricsSnapshot {
            ops,
            total_ops,
            total_errors,
            slow_ops: self.slow_ops.load(Ordering::Relaxed),
            deadlock_retries: self.deadlock_retries.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        self.op_metrics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.slow_ops.store(0, Ordering::Relaxed);
        self.deadlock_retries.store(0, Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: OpKind, code: ResultCode, total_ms: u64) -> OpRecord {
        OpRecord {
            kind,
            origin: OpOrigin::External,
            dn: "cn=a,dc=x".into(),
            requester: "cn=admin".into(),
            usn: Usn::new(1),
            code,
            timings: PhaseTimings {
                total: Duration::from_millis(total_ms),
                wq_wait: Duration::from_millis(1),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_record_success_and_error() {
        let collector = MetricsCollector::new();
        collector.record(&record(OpKind::Add, ResultCode::Success, 2));
        collector.record(&record(OpKind::Add, ResultCode::Busy, 4));
        let m = collector.get_op_metrics(OpKind::Add, OpOrigin::External);
        assert_eq!(m.count, 2);
        assert_eq!(m.errors, 1);
        assert_eq!(m.avg_duration_us(), 3000);
        assert_eq!(m.max_duration_us, 4000);
        assert_eq!(m.wq_wait_us, 2000);
        assert!((m.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let collector = MetricsCollector::new();
        collector.record(&record(OpKind::Modify, ResultCode::Success, 1));
        collector.record(&record(OpKind::Delete, ResultCode::Success, 1));
        collector.record_slow_op();
        let snap = collector.snapshot();
        assert_eq!(snap.total_ops, 2);
        assert_eq!(snap.slow_ops, 1);
        assert!(snap.ops.contains_key("modify/external"));
        collector.reset();
        assert_eq!(collector.snapshot().total_ops, 0);
    }
}
