//! Ingestion and partition management.
//!
//! Admission runs first (batch-level), then each reading is validated and
//! routed into the chunk whose time range contains its timestamp. Chunk
//! assignment is a pure function of the timestamp, never of arrival order,
//! so out-of-order readings land in the correct historical chunk.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::error::{RejectReason, Result, TelemetryError};
use crate::metrics::MetricsCollector;
use crate::quota::{AdmitDecision, QuotaEnforcer};
use crate::store::{bucket_start, Reading, TelemetryStore};
use crate::tenant::{Tenant, TenantRegistry};

/// One reading as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingInput {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum IngestOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// Batch result: per-reading rejections are reported positionally, the way
/// the caller submitted them.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Accepted replays of readings already stored (not double-counted).
    pub duplicates: usize,
    pub errors: Vec<String>,
}

/// Hook invoked after every accepted write; replaces hidden storage-side
/// side effects with an explicit seam.
pub type WriteHook = Arc<dyn Fn(&Reading) + Send + Sync>;

pub struct IngestionManager {
    store: Arc<dyn TelemetryStore>,
    registry: Arc<TenantRegistry>,
    quota: Arc<QuotaEnforcer>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: IngestConfig,
    schema: HashSet<String>,
    hooks: RwLock<Vec<WriteHook>>,
}

impl IngestionManager {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        registry: Arc<TenantRegistry>,
        quota: Arc<QuotaEnforcer>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: IngestConfig,
    ) -> Self {
        let schema = config.schema_fields.iter().cloned().collect();
        Self {
            store,
            registry,
            quota,
            clock,
            metrics,
            config,
            schema,
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register an on-write hook, called after each accepted new reading.
    pub fn on_write(&self, hook: WriteHook) {
        self.hooks.write().push(hook);
    }

    fn validate(
        &self,
        tenant: &Tenant,
        input: &ReadingInput,
        now: DateTime<Utc>,
    ) -> Option<RejectReason> {
        let skew = Duration::seconds(self.config.max_future_skew_secs as i64);
        if input.timestamp > now + skew {
            return Some(RejectReason::TimestampOutOfBounds);
        }

        let horizon_days = self
            .config
            .default_retention_days
            .min(tenant.quota.max_retention_days);
        let horizon = Duration::days(horizon_days as i64);
        if input.timestamp < now - horizon {
            return Some(RejectReason::TimestampOutOfBounds);
        }

        if input.fields.is_empty() {
            return Some(RejectReason::SchemaMismatch);
        }
        for (name, value) in &input.fields {
            if !self.schema.contains(name) || !value.is_finite() {
                return Some(RejectReason::SchemaMismatch);
            }
        }
        if input.source_id.trim().is_empty() {
            return Some(RejectReason::SchemaMismatch);
        }
        None
    }

    /// Ingest a batch for one tenant. Admission (quota) rejections fail the
    /// whole batch with an `Admission` error; per-reading validation
    /// failures are reported in the result and never retried automatically.
    pub async fn ingest_batch(
        &self,
        tenant_id: &str,
        inputs: Vec<ReadingInput>,
    ) -> Result<IngestReport> {
        let tenant = self.registry.get(tenant_id).await?;

        match self.quota.admit(tenant_id, inputs.len() as u64).await? {
            AdmitDecision::Allow => {}
            AdmitDecision::Reject(reason) => {
                self.metrics.record_rejected(reason, inputs.len() as u64);
                return Err(TelemetryError::Admission(reason));
            }
        }

        let now = self.clock.now();
        let mut report = IngestReport {
            accepted: 0,
            rejected: 0,
            duplicates: 0,
            errors: Vec::new(),
        };

        for (index, input) in inputs.into_iter().enumerate() {
            if let Some(reason) = self.validate(&tenant, &input, now) {
                report.rejected += 1;
                report.errors.push(format!("reading {index}: {reason}"));
                self.quota.refund(tenant_id, 1);
                self.metrics.record_rejected(reason, 1);
                continue;
            }

            if let Some(reason) = self.quota.check_source(&tenant, &input.source_id).await? {
                report.rejected += 1;
                report.errors.push(format!("reading {index}: {reason}"));
                self.quota.refund(tenant_id, 1);
                self.metrics.record_rejected(reason, 1);
                continue;
            }

            let reading = Reading {
                tenant_id: tenant.id.clone(),
                source_id: input.source_id,
                timestamp: input.timestamp,
                fields: input.fields,
                tags: input.tags,
            };
            let chunk = bucket_start(reading.timestamp, self.config.chunk_width_secs);

            let inserted = self
                .store
                .insert_reading(chunk, self.config.chunk_width_secs, reading.clone())
                .await?;

            report.accepted += 1;
            if inserted {
                self.metrics.record_accepted(1);
                let hooks = self.hooks.read().clone();
                for hook in hooks {
                    hook(&reading);
                }
            } else {
                // Duplicate delivery: idempotent accept, capacity returned.
                report.duplicates += 1;
                self.quota.refund(tenant_id, 1);
                debug!(tenant_id, source_id = %reading.source_id, "duplicate reading replayed");
            }
        }

        if report.rejected > 0 {
            warn!(
                tenant_id,
                rejected = report.rejected,
                "batch completed with rejected readings"
            );
        }
        Ok(report)
    }

    /// Single-reading convenience wrapper over the batch path.
    pub async fn ingest(&self, tenant_id: &str, input: ReadingInput) -> Result<IngestOutcome> {
        match self.ingest_batch(tenant_id, vec![input]).await {
            Ok(report) if report.rejected == 0 => Ok(IngestOutcome::Accepted),
            Ok(report) => {
                let reason = report
                    .errors
                    .first()
                    .and_then(|e| e.rsplit(": ").next())
                    .and_then(|code| serde_json::from_value(serde_json::json!(code)).ok())
                    .unwrap_or(RejectReason::SchemaMismatch);
                Ok(IngestOutcome::Rejected(reason))
            }
            Err(TelemetryError::Admission(reason)) => Ok(IngestOutcome::Rejected(reason)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QuotaConfig;
    use crate::store::MemoryStore;
    use crate::tenant::PlanTier;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        manager: IngestionManager,
        tenant_id: String,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(TenantRegistry::new(clock.clone()));
        let tenant = registry.create_tenant("ingest-test", PlanTier::Standard).await.unwrap();
        let metrics = Arc::new(MetricsCollector::new());
        let quota = Arc::new(QuotaEnforcer::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            QuotaConfig::default(),
        ));
        let manager = IngestionManager::new(
            store.clone(),
            registry,
            quota,
            clock.clone(),
            metrics,
            IngestConfig::default(),
        );
        Fixture {
            clock,
            store,
            manager,
            tenant_id: tenant.id,
        }
    }

    fn input(source: &str, ts: DateTime<Utc>, temp: f64) -> ReadingInput {
        ReadingInput {
            source_id: source.to_string(),
            timestamp: ts,
            fields: BTreeMap::from([("temperature".to_string(), temp)]),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn accepts_valid_reading_and_fires_hook() {
        let fx = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        fx.manager.on_write(Arc::new(move |_reading| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let now = fx.clock.now();
        let outcome = fx.manager.ingest(&fx.tenant_id, input("s1", now, 21.0)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_field_names() {
        let fx = fixture().await;
        let now = fx.clock.now();
        let mut bad = input("s1", now, 21.0);
        bad.fields.insert("unexpected_metric".to_string(), 1.0);

        let outcome = fx.manager.ingest(&fx.tenant_id, bad).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Rejected(RejectReason::SchemaMismatch));
    }

    #[tokio::test]
    async fn rejects_future_and_ancient_timestamps() {
        let fx = fixture().await;
        let now = fx.clock.now();

        let future = fx
            .manager
            .ingest(&fx.tenant_id, input("s1", now + Duration::hours(1), 21.0))
            .await
            .unwrap();
        assert_eq!(
            future,
            IngestOutcome::Rejected(RejectReason::TimestampOutOfBounds)
        );

        let ancient = fx
            .manager
            .ingest(&fx.tenant_id, input("s1", now - Duration::days(120), 21.0))
            .await
            .unwrap();
        assert_eq!(
            ancient,
            IngestOutcome::Rejected(RejectReason::TimestampOutOfBounds)
        );
    }

    #[tokio::test]
    async fn out_of_order_reading_lands_in_historical_chunk() {
        let fx = fixture().await;
        let now = fx.clock.now();

        fx.manager
            .ingest_batch(
                &fx.tenant_id,
                vec![input("s1", now, 20.0), input("s1", now - Duration::days(2), 18.0)],
            )
            .await
            .unwrap();

        let chunks = fx.store.list_chunks(&fx.tenant_id, None).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].start < chunks[1].start);
        assert_eq!(chunks[0].reading_count, 1);
    }

    #[tokio::test]
    async fn duplicate_batch_reports_replays() {
        let fx = fixture().await;
        let now = fx.clock.now();
        let reading = input("s1", now, 20.0);

        let first = fx
            .manager
            .ingest_batch(&fx.tenant_id, vec![reading.clone()])
            .await
            .unwrap();
        assert_eq!((first.accepted, first.duplicates), (1, 0));

        let second = fx
            .manager
            .ingest_batch(&fx.tenant_id, vec![reading])
            .await
            .unwrap();
        assert_eq!((second.accepted, second.duplicates), (1, 1));

        let stored = fx
            .store
            .scan_readings(&fx.tenant_id, None, now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }
}
