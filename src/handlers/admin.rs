//! Admin endpoints: tenant lifecycle, retention policies, alert rules,
//! escalation policies, and alert acknowledgment.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::alerts::{
    AggregateFn, AlertRule, AlertState, CompareOp, EscalationPolicy, EscalationStep, Severity,
};
use crate::error::Result;
use crate::retention::{ArchiveEntry, RetentionAction, RetentionPolicy, RetentionTarget};
use crate::state::AppState;
use crate::tenant::{FeatureFlags, PlanTier, QuotaSet, SystemScope, Tenant, TenantStatus};

// Tenants

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub plan: PlanTier,
}

pub async fn create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<Json<Tenant>> {
    let tenant = state.registry.create_tenant(&req.name, req.plan).await?;
    Ok(Json(tenant))
}

pub async fn list_tenants(State(state): State<AppState>) -> Json<Vec<Tenant>> {
    Json(state.registry.list(SystemScope).await)
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Tenant>> {
    Ok(Json(state.registry.get(&tenant_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: TenantStatus,
}

pub async fn update_tenant_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Tenant>> {
    state.registry.update_status(&tenant_id, req.status).await?;
    Ok(Json(state.registry.get(&tenant_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlanRequest {
    pub plan: PlanTier,
}

pub async fn update_tenant_plan(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<UpdatePlanRequest>,
) -> Result<Json<QuotaSet>> {
    Ok(Json(state.registry.update_plan(&tenant_id, req.plan).await?))
}

pub async fn update_tenant_features(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(features): Json<FeatureFlags>,
) -> Result<Json<Tenant>> {
    state.registry.update_features(&tenant_id, features).await?;
    Ok(Json(state.registry.get(&tenant_id).await?))
}

pub async fn tenant_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let tenant = state.registry.get(&tenant_id).await?;
    let storage_bytes = state.store.storage_usage(&tenant_id).await?;
    let sources = state.store.list_sources(&tenant_id).await?;
    Ok(Json(json!({
        "tenant_id": tenant.id,
        "window_readings": state.quota.window_usage(&tenant_id),
        "max_readings_per_window": tenant.quota.max_readings_per_window,
        "storage_bytes": storage_bytes,
        "max_storage_bytes": tenant.quota.max_storage_bytes,
        "source_count": sources.len(),
        "max_sources": tenant.quota.max_sources,
    })))
}

// Retention policies

#[derive(Debug, Deserialize)]
pub struct CreateRetentionPolicyRequest {
    pub target: RetentionTarget,
    pub max_age_secs: u64,
    pub action: RetentionAction,
}

pub async fn create_retention_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreateRetentionPolicyRequest>,
) -> Result<Json<RetentionPolicy>> {
    let policy = state
        .retention
        .create_policy(&tenant_id, req.target, req.max_age_secs, req.action)
        .await?;
    Ok(Json(policy))
}

pub async fn list_retention_policies(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<RetentionPolicy>>> {
    state.registry.get(&tenant_id).await?;
    Ok(Json(state.retention.list_policies(&tenant_id).await))
}

pub async fn delete_retention_policy(
    State(state): State<AppState>,
    Path((_tenant_id, policy_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    state.retention.delete_policy(&policy_id).await?;
    Ok(Json(json!({"deleted": policy_id})))
}

pub async fn list_archive_entries(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<ArchiveEntry>>> {
    state.registry.get(&tenant_id).await?;
    Ok(Json(state.retention.archive_entries(&tenant_id).await))
}

// Escalation policies

#[derive(Debug, Deserialize)]
pub struct CreateEscalationPolicyRequest {
    pub name: String,
    pub steps: Vec<EscalationStep>,
}

pub async fn create_escalation_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreateEscalationPolicyRequest>,
) -> Result<Json<EscalationPolicy>> {
    let policy = state
        .alerts
        .create_escalation_policy(&tenant_id, &req.name, req.steps)
        .await?;
    Ok(Json(policy))
}

pub async fn list_escalation_policies(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<EscalationPolicy>>> {
    state.registry.get(&tenant_id).await?;
    Ok(Json(
        state.alerts.list_escalation_policies(&tenant_id).await,
    ))
}

pub async fn delete_escalation_policy(
    State(state): State<AppState>,
    Path((_tenant_id, policy_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    state.alerts.delete_escalation_policy(&policy_id).await?;
    Ok(Json(json!({"deleted": policy_id})))
}

// Alert rules

#[derive(Debug, Deserialize)]
pub struct CreateAlertRuleRequest {
    pub name: String,
    pub field: String,
    /// Rollup family to evaluate; raw readings when absent.
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub aggregate: AggregateFn,
    #[serde(default)]
    pub eval_window_secs: Option<u64>,
    pub op: CompareOp,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_debounce")]
    pub debounce_cycles: u32,
    pub sla_secs: Option<u64>,
    pub escalation_policy_id: Option<String>,
}

fn default_debounce() -> u32 {
    1
}

pub async fn create_alert_rule(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreateAlertRuleRequest>,
) -> Result<Json<AlertRule>> {
    let rule = state
        .alerts
        .create_rule(AlertRule {
            id: String::new(),
            tenant_id,
            name: req.name,
            field: req.field,
            family: req.family,
            aggregate: req.aggregate,
            eval_window_secs: req.eval_window_secs,
            op: req.op,
            threshold: req.threshold,
            severity: req.severity,
            debounce_cycles: req.debounce_cycles,
            sla_secs: req.sla_secs,
            escalation_policy_id: req.escalation_policy_id,
        })
        .await?;
    Ok(Json(rule))
}

pub async fn list_alert_rules(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<AlertRule>>> {
    state.registry.get(&tenant_id).await?;
    Ok(Json(state.alerts.list_rules(&tenant_id).await))
}

pub async fn delete_alert_rule(
    State(state): State<AppState>,
    Path((_tenant_id, rule_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    state.alerts.delete_rule(&rule_id).await?;
    Ok(Json(json!({"deleted": rule_id})))
}

// Alerts

#[derive(Debug, Deserialize, Serialize)]
pub struct ListAlertsQuery {
    #[serde(default)]
    pub include_resolved: bool,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<ListAlertsQuery>,
) -> Result<Json<Vec<AlertState>>> {
    state.registry.get(&tenant_id).await?;
    Ok(Json(
        state
            .alerts
            .list_alerts(&tenant_id, params.include_resolved)
            .await,
    ))
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path((tenant_id, alert_id)): Path<(String, String)>,
) -> Result<Json<AlertState>> {
    Ok(Json(state.alerts.acknowledge(&tenant_id, &alert_id).await?))
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    Path((tenant_id, alert_id)): Path<(String, String)>,
) -> Result<Json<AlertState>> {
    Ok(Json(state.alerts.resolve(&tenant_id, &alert_id).await?))
}
