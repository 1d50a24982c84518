//! Quota enforcement: gates ingestion (and rollup refresh) by current usage
//! against the tenant's quota set.
//!
//! Rate usage is tracked in a sliding window of fixed slots, rolled forward
//! lazily when the window is next consulted. The admission check and the
//! usage reservation happen under one per-tenant lock, so concurrent writers
//! for the same tenant cannot both squeeze through the last slice of quota;
//! across separate batches the overshoot is bounded by one in-flight batch,
//! which is a documented capacity margin, not a correctness violation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::config::QuotaConfig;
use crate::error::{RejectReason, Result};
use crate::store::TelemetryStore;
use crate::tenant::{Tenant, TenantRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Allow,
    Reject(RejectReason),
}

#[derive(Debug)]
struct UsageWindow {
    slots: Vec<u64>,
    last_slot: i64,
}

impl UsageWindow {
    fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![0; slot_count.max(1)],
            last_slot: i64::MIN,
        }
    }

    fn slot_index(&self, slot: i64) -> usize {
        slot.rem_euclid(self.slots.len() as i64) as usize
    }

    /// Lazily zero every slot the window has slid past since last use.
    fn roll(&mut self, now_slot: i64) {
        if self.last_slot == i64::MIN {
            self.last_slot = now_slot;
            return;
        }
        if now_slot <= self.last_slot {
            return;
        }
        let steps = (now_slot - self.last_slot).min(self.slots.len() as i64);
        for step in 1..=steps {
            let idx = self.slot_index(self.last_slot + step);
            self.slots[idx] = 0;
        }
        self.last_slot = now_slot;
    }

    fn add(&mut self, count: u64) {
        let idx = self.slot_index(self.last_slot);
        self.slots[idx] += count;
    }

    fn refund(&mut self, count: u64) {
        let idx = self.slot_index(self.last_slot);
        self.slots[idx] = self.slots[idx].saturating_sub(count);
    }

    fn total(&self) -> u64 {
        self.slots.iter().sum()
    }
}

pub struct QuotaEnforcer {
    registry: Arc<TenantRegistry>,
    store: Arc<dyn TelemetryStore>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
    usage: DashMap<String, Mutex<UsageWindow>>,
}

impl QuotaEnforcer {
    pub fn new(
        registry: Arc<TenantRegistry>,
        store: Arc<dyn TelemetryStore>,
        clock: Arc<dyn Clock>,
        config: QuotaConfig,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            config,
            usage: DashMap::new(),
        }
    }

    fn slot_count(&self) -> usize {
        (self.config.window_secs / self.config.slot_secs.max(1)).max(1) as usize
    }

    fn current_slot(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.config.slot_secs.max(1) as i64)
    }

    /// Admit or reject a batch of `estimated_volume` readings for a tenant.
    /// On `Allow` the volume is already reserved against the rate window;
    /// call [`refund`](Self::refund) for readings that later fail validation.
    pub async fn admit(&self, tenant_id: &str, estimated_volume: u64) -> Result<AdmitDecision> {
        let tenant = self.registry.get(tenant_id).await?;
        if !tenant.status.is_writable() {
            return Ok(AdmitDecision::Reject(RejectReason::TenantSuspended));
        }

        let stored = self.store.storage_usage(tenant_id).await?;
        let incoming = estimated_volume * self.config.estimated_reading_bytes;
        if stored + incoming > tenant.quota.max_storage_bytes {
            debug!(tenant_id, stored, "storage quota exceeded");
            return Ok(AdmitDecision::Reject(RejectReason::StorageExceeded));
        }

        let now_slot = self.current_slot(self.clock.now());
        let slot_count = self.slot_count();
        let entry = self
            .usage
            .entry(tenant_id.to_string())
            .or_insert_with(|| Mutex::new(UsageWindow::new(slot_count)));
        let mut window = entry.lock();
        window.roll(now_slot);

        if window.total() + estimated_volume > tenant.quota.max_readings_per_window {
            return Ok(AdmitDecision::Reject(RejectReason::RateExceeded));
        }
        window.add(estimated_volume);
        Ok(AdmitDecision::Allow)
    }

    /// Reject a reading for a source the tenant has not used before when the
    /// distinct-source quota is already met.
    pub async fn check_source(
        &self,
        tenant: &Tenant,
        source_id: &str,
    ) -> Result<Option<RejectReason>> {
        let sources = self.store.list_sources(&tenant.id).await?;
        if sources.iter().any(|s| s == source_id) {
            return Ok(None);
        }
        if sources.len() >= tenant.quota.max_sources {
            return Ok(Some(RejectReason::SourceCountExceeded));
        }
        Ok(None)
    }

    /// Give back reserved volume for readings the partition manager refused
    /// (validation failures and duplicate replays).
    pub fn refund(&self, tenant_id: &str, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(entry) = self.usage.get(tenant_id) {
            entry.lock().refund(count);
        }
    }

    /// Current usage inside the sliding window.
    pub fn window_usage(&self, tenant_id: &str) -> u64 {
        let now_slot = self.current_slot(self.clock.now());
        match self.usage.get(tenant_id) {
            Some(entry) => {
                let mut window = entry.lock();
                window.roll(now_slot);
                window.total()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::tenant::PlanTier;
    use chrono::{Duration, TimeZone};

    async fn setup() -> (Arc<ManualClock>, Arc<TenantRegistry>, QuotaEnforcer, String) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let store: Arc<dyn TelemetryStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(TenantRegistry::new(clock.clone()));
        let tenant = registry.create_tenant("quota-test", PlanTier::Trial).await.unwrap();
        let enforcer = QuotaEnforcer::new(
            registry.clone(),
            store,
            clock.clone(),
            QuotaConfig {
                window_secs: 3_600,
                slot_secs: 60,
                estimated_reading_bytes: 256,
            },
        );
        (clock, registry, enforcer, tenant.id)
    }

    #[tokio::test]
    async fn rate_limit_rejects_until_window_rolls() {
        let (clock, _registry, enforcer, tenant_id) = setup().await;

        // Trial quota is 10_000 readings per window.
        assert_eq!(
            enforcer.admit(&tenant_id, 10_000).await.unwrap(),
            AdmitDecision::Allow
        );
        assert_eq!(
            enforcer.admit(&tenant_id, 1).await.unwrap(),
            AdmitDecision::Reject(RejectReason::RateExceeded)
        );

        // A full window later the usage has slid out.
        clock.advance(Duration::seconds(3_601));
        assert_eq!(
            enforcer.admit(&tenant_id, 1).await.unwrap(),
            AdmitDecision::Allow
        );
    }

    #[tokio::test]
    async fn refund_restores_window_capacity() {
        let (_clock, _registry, enforcer, tenant_id) = setup().await;

        assert_eq!(
            enforcer.admit(&tenant_id, 10_000).await.unwrap(),
            AdmitDecision::Allow
        );
        enforcer.refund(&tenant_id, 500);
        assert_eq!(enforcer.window_usage(&tenant_id), 9_500);
        assert_eq!(
            enforcer.admit(&tenant_id, 500).await.unwrap(),
            AdmitDecision::Allow
        );
    }

    #[tokio::test]
    async fn suspended_tenant_is_rejected() {
        let (_clock, registry, enforcer, tenant_id) = setup().await;
        registry
            .update_status(&tenant_id, crate::tenant::TenantStatus::Suspended)
            .await
            .unwrap();

        assert_eq!(
            enforcer.admit(&tenant_id, 1).await.unwrap(),
            AdmitDecision::Reject(RejectReason::TenantSuspended)
        );
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let (_clock, _registry, enforcer, _tenant_id) = setup().await;
        assert!(enforcer.admit("nope", 1).await.is_err());
    }
}
