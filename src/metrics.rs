//! Operational metrics: atomic counters with a Prometheus text exporter.
//! Background-job failures surface here and in logs; they are never
//! reported synchronously to ingestion callers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::RejectReason;

#[derive(Debug)]
pub struct MetricsCollector {
    pub readings_accepted: AtomicU64,
    pub readings_rejected: AtomicU64,
    rejected_by_reason: RwLock<HashMap<&'static str, u64>>,

    pub rollup_cycles: AtomicU64,
    pub rollup_buckets_upserted: AtomicU64,
    pub rollup_unit_failures: AtomicU64,
    pub rollup_lag_warnings: AtomicU64,

    pub retention_chunks_dropped: AtomicU64,
    pub retention_chunks_archived: AtomicU64,
    pub retention_buckets_dropped: AtomicU64,
    pub retention_violations: AtomicU64,

    pub alerts_opened: AtomicU64,
    pub alerts_fired: AtomicU64,
    pub alerts_escalated: AtomicU64,
    pub alerts_resolved: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,

    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            readings_accepted: AtomicU64::new(0),
            readings_rejected: AtomicU64::new(0),
            rejected_by_reason: RwLock::new(HashMap::new()),
            rollup_cycles: AtomicU64::new(0),
            rollup_buckets_upserted: AtomicU64::new(0),
            rollup_unit_failures: AtomicU64::new(0),
            rollup_lag_warnings: AtomicU64::new(0),
            retention_chunks_dropped: AtomicU64::new(0),
            retention_chunks_archived: AtomicU64::new(0),
            retention_buckets_dropped: AtomicU64::new(0),
            retention_violations: AtomicU64::new(0),
            alerts_opened: AtomicU64::new(0),
            alerts_fired: AtomicU64::new(0),
            alerts_escalated: AtomicU64::new(0),
            alerts_resolved: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_accepted(&self, count: u64) {
        self.readings_accepted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason: RejectReason, count: u64) {
        self.readings_rejected.fetch_add(count, Ordering::Relaxed);
        *self
            .rejected_by_reason
            .write()
            .entry(reason.as_str())
            .or_insert(0) += count;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::with_capacity(2_048);

        let gauge = |out: &mut String, name: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        };

        gauge(
            &mut out,
            "telemetry_readings_accepted_total",
            "Readings accepted by ingestion",
            self.readings_accepted.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            out,
            "# HELP telemetry_readings_rejected_total Readings rejected, by reason"
        );
        let _ = writeln!(out, "# TYPE telemetry_readings_rejected_total counter");
        for (reason, count) in self.rejected_by_reason.read().iter() {
            let _ = writeln!(
                out,
                "telemetry_readings_rejected_total{{reason=\"{reason}\"}} {count}"
            );
        }

        gauge(
            &mut out,
            "telemetry_rollup_cycles_total",
            "Completed rollup refresh cycles",
            self.rollup_cycles.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_rollup_buckets_upserted_total",
            "Rollup buckets written",
            self.rollup_buckets_upserted.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_rollup_unit_failures_total",
            "Failed or timed-out refresh units",
            self.rollup_unit_failures.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_rollup_lag_warnings_total",
            "Refresh cycles that overran their cadence",
            self.rollup_lag_warnings.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_retention_chunks_dropped_total",
            "Raw chunks dropped by retention",
            self.retention_chunks_dropped.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_retention_chunks_archived_total",
            "Raw chunks archived by retention",
            self.retention_chunks_archived.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_retention_buckets_dropped_total",
            "Rollup buckets removed by retention",
            self.retention_buckets_dropped.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_retention_violations_total",
            "Retention jobs aborted by consistency guard",
            self.retention_violations.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_alerts_opened_total",
            "Alert states opened",
            self.alerts_opened.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_alerts_fired_total",
            "Alerts confirmed past debounce",
            self.alerts_fired.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_alerts_escalated_total",
            "Escalation steps fired",
            self.alerts_escalated.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_alerts_resolved_total",
            "Alert states resolved",
            self.alerts_resolved.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_notifications_sent_total",
            "Notifications dispatched",
            self.notifications_sent.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_notifications_failed_total",
            "Notifications that exhausted retries",
            self.notifications_failed.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "telemetry_uptime_seconds",
            "Process uptime",
            self.uptime_seconds(),
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_includes_reason_labels() {
        let metrics = MetricsCollector::new();
        metrics.record_accepted(10);
        metrics.record_rejected(RejectReason::RateExceeded, 3);
        metrics.record_rejected(RejectReason::SchemaMismatch, 1);

        let text = metrics.export_prometheus();
        assert!(text.contains("telemetry_readings_accepted_total 10"));
        assert!(text.contains("telemetry_readings_rejected_total{reason=\"rate_exceeded\"} 3"));
        assert!(text.contains("telemetry_readings_rejected_total{reason=\"schema_mismatch\"} 1"));
    }
}
