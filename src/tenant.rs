//! Tenant registry: identity, plan, quota configuration, and status
//! transitions. Tenant ids are immutable once assigned, and tenants are
//! never hard-deleted while dependent data exists — suspension and the
//! terminal `inactive` status are the only ways out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, TelemetryError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Trial,
    Inactive,
}

impl TenantStatus {
    /// Whether ingestion and rollup refresh are permitted.
    pub fn is_writable(&self) -> bool {
        matches!(self, TenantStatus::Active | TenantStatus::Trial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Trial,
    Standard,
    Enterprise,
}

/// Typed per-tenant feature flags with a sealed extension map. The map is
/// validated when the flags are updated, not on every read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub derived_scores: bool,
    #[serde(default)]
    pub archival: bool,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl FeatureFlags {
    pub fn validate(&self) -> Result<()> {
        for key in self.extensions.keys() {
            let well_formed = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !well_formed {
                return Err(TelemetryError::validation(format!(
                    "invalid feature extension key '{key}'"
                )));
            }
        }
        Ok(())
    }
}

/// Resource limits applied to one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSet {
    /// Accepted readings allowed inside the sliding usage window.
    pub max_readings_per_window: u64,
    pub max_storage_bytes: u64,
    pub max_retention_days: u32,
    pub max_sources: usize,
    pub features: FeatureFlags,
}

impl QuotaSet {
    pub fn for_plan(plan: PlanTier) -> Self {
        match plan {
            PlanTier::Trial => Self {
                max_readings_per_window: 10_000,
                max_storage_bytes: 64 * 1024 * 1024,
                max_retention_days: 14,
                max_sources: 5,
                features: FeatureFlags::default(),
            },
            PlanTier::Standard => Self {
                max_readings_per_window: 500_000,
                max_storage_bytes: 8 * 1024 * 1024 * 1024,
                max_retention_days: 90,
                max_sources: 200,
                features: FeatureFlags {
                    derived_scores: true,
                    ..FeatureFlags::default()
                },
            },
            PlanTier::Enterprise => Self {
                max_readings_per_window: 10_000_000,
                max_storage_bytes: 256 * 1024 * 1024 * 1024,
                max_retention_days: 365,
                max_sources: 10_000,
                features: FeatureFlags {
                    derived_scores: true,
                    archival: true,
                    ..FeatureFlags::default()
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub status: TenantStatus,
    pub plan: PlanTier,
    pub quota: QuotaSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Explicit marker for cross-tenant access. Surfaces that enumerate every
/// tenant's records must pass it; ordinary paths are tenant-scoped by
/// signature, never by ambient session state.
#[derive(Debug, Clone, Copy)]
pub struct SystemScope;

/// Registry of all tenants, guarded by an async RwLock. Reads vastly
/// outnumber writes (every admission consults it).
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, Tenant>>,
    clock: Arc<dyn Clock>,
}

impl TenantRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn create_tenant(&self, name: &str, plan: PlanTier) -> Result<Tenant> {
        if name.trim().is_empty() {
            return Err(TelemetryError::validation("tenant name cannot be empty"));
        }

        let now = self.clock.now();
        let status = match plan {
            PlanTier::Trial => TenantStatus::Trial,
            _ => TenantStatus::Active,
        };
        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            status,
            plan,
            quota: QuotaSet::for_plan(plan),
            created_at: now,
            updated_at: now,
        };

        let mut tenants = self.tenants.write().await;
        tenants.insert(tenant.id.clone(), tenant.clone());
        info!(tenant_id = %tenant.id, plan = ?plan, "created tenant");
        Ok(tenant)
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Tenant> {
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| TelemetryError::not_found(format!("tenant '{tenant_id}'")))
    }

    pub async fn get_quota(&self, tenant_id: &str) -> Result<QuotaSet> {
        Ok(self.get(tenant_id).await?.quota)
    }

    /// Transition a tenant's status. `inactive` is terminal: a churned
    /// tenant cannot be reactivated.
    pub async fn update_status(&self, tenant_id: &str, status: TenantStatus) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TelemetryError::not_found(format!("tenant '{tenant_id}'")))?;

        if tenant.status == TenantStatus::Inactive && status != TenantStatus::Inactive {
            return Err(TelemetryError::invalid_state(format!(
                "tenant '{tenant_id}' is permanently churned"
            )));
        }

        tenant.status = status;
        tenant.updated_at = self.clock.now();
        info!(tenant_id, status = ?status, "updated tenant status");
        Ok(())
    }

    /// Plan changes swap the quota set immediately; in-flight ingestion
    /// re-checks on its next admission call, there is no retroactive
    /// enforcement on data already accepted.
    pub async fn update_plan(&self, tenant_id: &str, plan: PlanTier) -> Result<QuotaSet> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TelemetryError::not_found(format!("tenant '{tenant_id}'")))?;

        let previous_features = tenant.quota.features.clone();
        tenant.plan = plan;
        tenant.quota = QuotaSet::for_plan(plan);
        tenant.quota.features = previous_features;
        tenant.updated_at = self.clock.now();
        info!(tenant_id, plan = ?plan, "updated tenant plan");
        Ok(tenant.quota.clone())
    }

    pub async fn update_features(&self, tenant_id: &str, features: FeatureFlags) -> Result<()> {
        features.validate()?;
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TelemetryError::not_found(format!("tenant '{tenant_id}'")))?;
        tenant.quota.features = features;
        tenant.updated_at = self.clock.now();
        Ok(())
    }

    pub async fn list(&self, _scope: SystemScope) -> Vec<Tenant> {
        let tenants = self.tenants.read().await;
        let mut all: Vec<Tenant> = tenants.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn count(&self, _scope: SystemScope) -> usize {
        self.tenants.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn registry() -> TenantRegistry {
        TenantRegistry::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn create_and_fetch_tenant() {
        let reg = registry();
        let tenant = reg.create_tenant("Acme Sensors", PlanTier::Standard).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);

        let fetched = reg.get(&tenant.id).await.unwrap();
        assert_eq!(fetched.name, "Acme Sensors");
        assert_eq!(fetched.quota.max_retention_days, 90);

        assert!(matches!(
            reg.get("missing").await,
            Err(TelemetryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn trial_plan_starts_in_trial_status() {
        let reg = registry();
        let tenant = reg.create_tenant("newbie", PlanTier::Trial).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Trial);
        assert!(tenant.status.is_writable());
    }

    #[tokio::test]
    async fn churned_tenant_cannot_reactivate() {
        let reg = registry();
        let tenant = reg.create_tenant("gone", PlanTier::Standard).await.unwrap();
        reg.update_status(&tenant.id, TenantStatus::Inactive).await.unwrap();

        let err = reg
            .update_status(&tenant.id, TenantStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidState(_)));
    }

    #[tokio::test]
    async fn plan_change_swaps_quota_but_keeps_features() {
        let reg = registry();
        let tenant = reg.create_tenant("upgrader", PlanTier::Trial).await.unwrap();

        let mut features = FeatureFlags::default();
        features
            .extensions
            .insert("beta_export".to_string(), serde_json::json!(true));
        reg.update_features(&tenant.id, features.clone()).await.unwrap();

        let quota = reg.update_plan(&tenant.id, PlanTier::Enterprise).await.unwrap();
        assert_eq!(quota.max_retention_days, 365);
        assert_eq!(quota.features.extensions, features.extensions);
    }

    #[tokio::test]
    async fn feature_extension_keys_are_validated() {
        let reg = registry();
        let tenant = reg.create_tenant("flagged", PlanTier::Standard).await.unwrap();

        let mut features = FeatureFlags::default();
        features
            .extensions
            .insert("Not Valid!".to_string(), serde_json::json!(1));
        assert!(reg.update_features(&tenant.id, features).await.is_err());
    }
}
