//! Retention and archival engine.
//!
//! Runs on its own schedule, independent of ingestion and aggregation. Each
//! pass walks the registered retention policies, enumerates whole chunks or
//! buckets strictly older than the policy's horizon, and drops or archives
//! them unit by unit. Every unit is a single atomic store operation, so an
//! interrupted pass resumes safely by re-scanning still-eligible units.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{RetentionConfig, RollupConfig};
use crate::error::{Result, TelemetryError};
use crate::metrics::MetricsCollector;
use crate::store::{ArchiveSink, TelemetryStore};
use crate::tenant::TenantRegistry;

/// What a retention policy governs: raw chunks or one rollup family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "family")]
pub enum RetentionTarget {
    Raw,
    Rollup(String),
}

impl RetentionTarget {
    fn label(&self) -> String {
        match self {
            RetentionTarget::Raw => "raw".to_string(),
            RetentionTarget::Rollup(family) => format!("rollup:{family}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    Drop,
    Archive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    pub tenant_id: String,
    pub target: RetentionTarget,
    pub max_age_secs: u64,
    pub action: RetentionAction,
}

/// Index entry recording where an archived range went, so the data stays
/// discoverable after removal from the live store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub entry_id: String,
    pub tenant_id: String,
    pub target: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub location: String,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PassStats {
    pub policies_run: usize,
    pub policies_failed: usize,
    pub chunks_dropped: u64,
    pub chunks_archived: u64,
    pub buckets_dropped: u64,
    pub buckets_archived: u64,
    /// Units that would have been removed, counted but untouched (dry run).
    pub units_skipped_dry_run: u64,
}

pub struct RetentionEngine {
    store: Arc<dyn TelemetryStore>,
    registry: Arc<TenantRegistry>,
    sink: Arc<dyn ArchiveSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: RetentionConfig,
    rollup: RollupConfig,
    policies: RwLock<HashMap<String, RetentionPolicy>>,
    archive_index: RwLock<HashMap<String, ArchiveEntry>>,
}

impl RetentionEngine {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        registry: Arc<TenantRegistry>,
        sink: Arc<dyn ArchiveSink>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: RetentionConfig,
        rollup: RollupConfig,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
            clock,
            metrics,
            config,
            rollup,
            policies: RwLock::new(HashMap::new()),
            archive_index: RwLock::new(HashMap::new()),
        }
    }

    // Policy CRUD, consumed by the admin API.

    pub async fn create_policy(
        &self,
        tenant_id: &str,
        target: RetentionTarget,
        max_age_secs: u64,
        action: RetentionAction,
    ) -> Result<RetentionPolicy> {
        self.registry.get(tenant_id).await?;
        if let RetentionTarget::Rollup(family) = &target {
            if !self.rollup.families.iter().any(|f| &f.name == family) {
                return Err(TelemetryError::validation(format!(
                    "unknown rollup family '{family}'"
                )));
            }
        }
        self.validate_horizon(max_age_secs)?;

        let policy = RetentionPolicy {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            target,
            max_age_secs,
            action,
        };
        self.policies
            .write()
            .await
            .insert(policy.id.clone(), policy.clone());
        info!(tenant_id, policy_id = %policy.id, target = %policy.target.label(), "retention policy created");
        Ok(policy)
    }

    pub async fn get_policy(&self, policy_id: &str) -> Result<RetentionPolicy> {
        self.policies
            .read()
            .await
            .get(policy_id)
            .cloned()
            .ok_or_else(|| TelemetryError::not_found(format!("retention policy {policy_id}")))
    }

    pub async fn list_policies(&self, tenant_id: &str) -> Vec<RetentionPolicy> {
        self.policies
            .read()
            .await
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn delete_policy(&self, policy_id: &str) -> Result<()> {
        self.policies
            .write()
            .await
            .remove(policy_id)
            .map(|_| ())
            .ok_or_else(|| TelemetryError::not_found(format!("retention policy {policy_id}")))
    }

    pub async fn archive_entries(&self, tenant_id: &str) -> Vec<ArchiveEntry> {
        self.archive_index
            .read()
            .await
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    /// A policy whose horizon reaches inside any family's lag window could
    /// delete data a refresh cycle still depends on.
    fn validate_horizon(&self, max_age_secs: u64) -> Result<()> {
        let max_lag = self
            .rollup
            .families
            .iter()
            .map(|f| f.lag_window_secs)
            .max()
            .unwrap_or(0);
        if max_age_secs <= max_lag {
            return Err(TelemetryError::consistency(format!(
                "retention max_age ({max_age_secs}s) must exceed the largest rollup lag window ({max_lag}s)"
            )));
        }
        Ok(())
    }

    /// One retention pass over every policy. Failures are isolated per
    /// policy; a cancelled pass stops cleanly between units.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> PassStats {
        let policies: Vec<RetentionPolicy> =
            self.policies.read().await.values().cloned().collect();
        let mut stats = PassStats::default();

        for policy in policies {
            if cancel.is_cancelled() {
                info!("retention pass cancelled");
                break;
            }
            stats.policies_run += 1;
            if let Err(e) = self.run_policy(&policy, cancel, &mut stats).await {
                stats.policies_failed += 1;
                self.metrics.retention_violations.fetch_add(1, Ordering::Relaxed);
                error!(policy_id = %policy.id, tenant_id = %policy.tenant_id, error = %e, "retention policy failed");
            }
        }
        stats
    }

    async fn run_policy(
        &self,
        policy: &RetentionPolicy,
        cancel: &CancellationToken,
        stats: &mut PassStats,
    ) -> Result<()> {
        // Re-checked every pass so a config change cannot smuggle an unsafe
        // horizon past create-time validation.
        self.validate_horizon(policy.max_age_secs)?;

        let tenant = self.registry.get(&policy.tenant_id).await?;
        let cutoff = self.clock.now() - Duration::seconds(policy.max_age_secs as i64);

        match &policy.target {
            RetentionTarget::Raw => {
                let chunks = self
                    .store
                    .list_chunks(&tenant.id, Some(cutoff))
                    .await?;
                for chunk in chunks {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    if self.config.dry_run {
                        stats.units_skipped_dry_run += 1;
                        debug!(tenant_id = %tenant.id, chunk_start = %chunk.start, "dry run: chunk eligible");
                        continue;
                    }
                    if policy.action == RetentionAction::Archive {
                        self.archive_chunk(policy, &chunk.source_id, chunk.start, chunk.end)
                            .await?;
                        stats.chunks_archived += 1;
                        self.metrics
                            .retention_chunks_archived
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    let dropped = self
                        .store
                        .drop_chunk(&tenant.id, &chunk.source_id, chunk.start)
                        .await?;
                    stats.chunks_dropped += 1;
                    self.metrics
                        .retention_chunks_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(tenant_id = %tenant.id, chunk_start = %chunk.start, readings = dropped, "chunk removed");
                }
            }
            RetentionTarget::Rollup(family) => {
                let buckets = self
                    .store
                    .buckets_older_than(family, &tenant.id, cutoff)
                    .await?;
                for bucket in buckets {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    if self.config.dry_run {
                        stats.units_skipped_dry_run += 1;
                        continue;
                    }
                    if policy.action == RetentionAction::Archive {
                        let entry_id = self.entry_id(
                            &policy.tenant_id,
                            &policy.target.label(),
                            bucket.bucket_start,
                            bucket.bucket_end(),
                        );
                        let location = self
                            .sink
                            .export_buckets(&entry_id, std::slice::from_ref(&bucket))
                            .await?;
                        self.record_entry(policy, bucket.bucket_start, bucket.bucket_end(), location)
                            .await;
                        stats.buckets_archived += 1;
                    }
                    self.store
                        .drop_bucket(family, &tenant.id, &bucket.source_id, bucket.bucket_start)
                        .await?;
                    stats.buckets_dropped += 1;
                    self.metrics
                        .retention_buckets_dropped
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    async fn archive_chunk(
        &self,
        policy: &RetentionPolicy,
        source_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        let readings = self
            .store
            .chunk_readings(&policy.tenant_id, source_id, start)
            .await?;
        let entry_id = self.entry_id(&policy.tenant_id, &policy.target.label(), start, end);
        // Re-export overwrites the same location, so a pass that archived
        // but failed to delete converges on retry without duplicate entries.
        let location = self.sink.export_readings(&entry_id, &readings).await?;
        self.record_entry(policy, start, end, location).await;
        Ok(())
    }

    /// Deterministic id over (tenant, target, range): retrying an archive of
    /// the same range lands on the same entry.
    fn entry_id(
        &self,
        tenant_id: &str,
        target: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"|");
        hasher.update(target.as_bytes());
        hasher.update(b"|");
        hasher.update(&start.timestamp_micros().to_le_bytes());
        hasher.update(&end.timestamp_micros().to_le_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }

    async fn record_entry(
        &self,
        policy: &RetentionPolicy,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        location: String,
    ) {
        let entry_id = self.entry_id(&policy.tenant_id, &policy.target.label(), start, end);
        let entry = ArchiveEntry {
            entry_id: entry_id.clone(),
            tenant_id: policy.tenant_id.clone(),
            target: policy.target.label(),
            range_start: start,
            range_end: end,
            location,
            archived_at: self.clock.now(),
        };
        self.archive_index.write().await.insert(entry_id, entry);
    }

    /// Spawn the periodic retention scheduler.
    pub fn spawn_scheduler(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(engine.config.check_interval_secs.max(1));
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("retention scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let stats = engine.run_pass(&shutdown).await;
                        if stats.policies_failed > 0 {
                            warn!(?stats, "retention pass finished with failures");
                        } else {
                            debug!(?stats, "retention pass finished");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{bucket_start, MemoryArchiveSink, MemoryStore, Reading};
    use crate::tenant::PlanTier;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        sink: Arc<MemoryArchiveSink>,
        engine: Arc<RetentionEngine>,
        tenant_id: String,
    }

    async fn fixture(dry_run: bool) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryArchiveSink::new());
        let registry = Arc::new(TenantRegistry::new(clock.clone()));
        let tenant = registry
            .create_tenant("retention-test", PlanTier::Standard)
            .await
            .unwrap();
        let config = RetentionConfig {
            dry_run,
            ..RetentionConfig::default()
        };
        let engine = Arc::new(RetentionEngine::new(
            store.clone(),
            registry,
            sink.clone(),
            clock.clone(),
            Arc::new(MetricsCollector::new()),
            config,
            RollupConfig::default(),
        ));
        Fixture {
            clock,
            store,
            sink,
            engine,
            tenant_id: tenant.id,
        }
    }

    async fn seed_reading(fx: &Fixture, age_days: i64) {
        let ts = fx.clock.now() - Duration::days(age_days);
        let reading = Reading {
            tenant_id: fx.tenant_id.clone(),
            source_id: "s1".to_string(),
            timestamp: ts,
            fields: BTreeMap::from([("temperature".to_string(), 20.0)]),
            tags: BTreeMap::new(),
        };
        fx.store
            .insert_reading(bucket_start(ts, 86_400), 86_400, reading)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_horizon_inside_lag_window() {
        let fx = fixture(false).await;
        let err = fx
            .engine
            .create_policy(&fx.tenant_id, RetentionTarget::Raw, 3_600, RetentionAction::Drop)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::ConsistencyViolation(_)));
    }

    #[tokio::test]
    async fn drops_only_chunks_older_than_horizon() {
        let fx = fixture(false).await;
        seed_reading(&fx, 40).await;
        seed_reading(&fx, 1).await;

        fx.engine
            .create_policy(
                &fx.tenant_id,
                RetentionTarget::Raw,
                30 * 86_400,
                RetentionAction::Drop,
            )
            .await
            .unwrap();

        let stats = fx.engine.run_pass(&CancellationToken::new()).await;
        assert_eq!(stats.chunks_dropped, 1);
        assert_eq!(stats.policies_failed, 0);

        let remaining = fx
            .store
            .list_chunks(&fx.tenant_id, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn archive_then_drop_is_idempotent() {
        let fx = fixture(false).await;
        seed_reading(&fx, 40).await;

        fx.engine
            .create_policy(
                &fx.tenant_id,
                RetentionTarget::Raw,
                30 * 86_400,
                RetentionAction::Archive,
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let first = fx.engine.run_pass(&cancel).await;
        assert_eq!(first.chunks_archived, 1);
        assert_eq!(fx.sink.reading_entry_count(), 1);
        assert_eq!(fx.engine.archive_entries(&fx.tenant_id).await.len(), 1);

        // Nothing eligible remains; a re-run neither drops nor duplicates.
        let second = fx.engine.run_pass(&cancel).await;
        assert_eq!(second.chunks_dropped, 0);
        assert_eq!(fx.sink.reading_entry_count(), 1);
        assert_eq!(fx.engine.archive_entries(&fx.tenant_id).await.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_counts_without_deleting() {
        let fx = fixture(true).await;
        seed_reading(&fx, 40).await;

        fx.engine
            .create_policy(
                &fx.tenant_id,
                RetentionTarget::Raw,
                30 * 86_400,
                RetentionAction::Drop,
            )
            .await
            .unwrap();

        let stats = fx.engine.run_pass(&CancellationToken::new()).await;
        assert_eq!(stats.units_skipped_dry_run, 1);
        assert_eq!(stats.chunks_dropped, 0);
        assert_eq!(
            fx.store.list_chunks(&fx.tenant_id, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn cancelled_pass_stops_between_units() {
        let fx = fixture(false).await;
        seed_reading(&fx, 40).await;

        fx.engine
            .create_policy(
                &fx.tenant_id,
                RetentionTarget::Raw,
                30 * 86_400,
                RetentionAction::Drop,
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = fx.engine.run_pass(&cancel).await;
        assert_eq!(stats.chunks_dropped, 0);
        assert_eq!(stats.policies_run, 0);
    }
}
