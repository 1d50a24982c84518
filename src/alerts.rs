//! Alert lifecycle manager.
//!
//! Rules are evaluated on a fixed cadence, each against raw readings or a
//! rollup family combined over the rule's evaluation window. A source with
//! no data inside the window yields no observation and its open alert is
//! left untouched; only an observed false condition (or a manual close)
//! resolves it, so sparse sensors keep their debounce and SLA state across
//! reporting gaps. Each open alert walks the state machine
//! `Pending -> Firing -> Acknowledged / Escalated -> Resolved`. SLA
//! deadlines live in one time-ordered heap rather than one task per alert,
//! with stale entries discarded lazily when popped.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{AlertingConfig, RollupConfig, RollupFamilyConfig};
use crate::error::{Result, TelemetryError};
use crate::metrics::MetricsCollector;
use crate::notify::{dispatch_fire_and_forget, Notification, Notifier};
use crate::store::{bucket_start, FieldAggregate, TelemetryStore};
use crate::tenant::TenantRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Gte => value >= threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Lte => value <= threshold,
        }
    }
}

/// How observations inside a rule's evaluation window combine into the
/// value compared against the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    /// Most recent value (mean of the most recent bucket for rollup rules).
    #[default]
    Latest,
    Avg,
    Min,
    Max,
}

/// Threshold rule over one field, evaluated against raw readings or a
/// rollup family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub field: String,
    /// Rollup family to evaluate; raw readings when absent.
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub aggregate: AggregateFn,
    /// How far back each cycle looks for observations. Defaults to the
    /// eval interval for raw rules and two bucket widths for rollup rules.
    #[serde(default)]
    pub eval_window_secs: Option<u64>,
    pub op: CompareOp,
    pub threshold: f64,
    pub severity: Severity,
    /// Consecutive evaluation cycles the condition must hold before firing.
    pub debounce_cycles: u32,
    /// Ack window once firing; the configured default applies when absent.
    pub sla_secs: Option<u64>,
    pub escalation_policy_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationStep {
    pub wait_secs: u64,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub steps: Vec<EscalationStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Firing,
    Acknowledged,
    Escalated,
    Resolved,
}

impl AlertStatus {
    pub fn is_open(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertState {
    pub id: String,
    pub tenant_id: String,
    pub rule_id: String,
    pub source_id: String,
    pub status: AlertStatus,
    pub severity: Severity,
    pub first_triggered: DateTime<Utc>,
    pub last_transition: DateTime<Utc>,
    /// Consecutive cycles the condition has held, for debounce.
    pub consecutive_cycles: u32,
    pub sla_deadline: Option<DateTime<Utc>>,
    /// Number of SLA breaches so far; 0 until the first escalation.
    pub escalation_step: usize,
    pub last_observed_value: f64,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct EvalStats {
    pub rules_evaluated: usize,
    pub opened: u64,
    pub fired: u64,
    pub resolved: u64,
    pub escalated: u64,
}

/// Open alerts, addressable both by id (for ack) and by the
/// (tenant, rule, source) key that enforces single-open-alert semantics.
#[derive(Default)]
struct OpenAlerts {
    by_id: HashMap<String, AlertState>,
    by_key: HashMap<(String, String, String), String>,
}

impl OpenAlerts {
    fn insert(&mut self, state: AlertState) {
        let key = (
            state.tenant_id.clone(),
            state.rule_id.clone(),
            state.source_id.clone(),
        );
        self.by_key.insert(key, state.id.clone());
        self.by_id.insert(state.id.clone(), state);
    }

    fn remove(&mut self, alert_id: &str) -> Option<AlertState> {
        let state = self.by_id.remove(alert_id)?;
        self.by_key.remove(&(
            state.tenant_id.clone(),
            state.rule_id.clone(),
            state.source_id.clone(),
        ));
        Some(state)
    }
}

const RESOLVED_HISTORY_CAP: usize = 4_096;

pub struct AlertEngine {
    store: Arc<dyn TelemetryStore>,
    registry: Arc<TenantRegistry>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: AlertingConfig,
    families: Vec<RollupFamilyConfig>,
    rules: RwLock<HashMap<String, AlertRule>>,
    policies: RwLock<HashMap<String, EscalationPolicy>>,
    open: RwLock<OpenAlerts>,
    resolved: RwLock<Vec<AlertState>>,
    deadlines: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, String)>>>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        registry: Arc<TenantRegistry>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: AlertingConfig,
        rollup: RollupConfig,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            clock,
            metrics,
            config,
            families: rollup.families,
            rules: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            open: RwLock::new(OpenAlerts::default()),
            resolved: RwLock::new(Vec::new()),
            deadlines: Mutex::new(BinaryHeap::new()),
        }
    }

    // Rule and policy CRUD, consumed by the admin API.

    pub async fn create_rule(&self, mut rule: AlertRule) -> Result<AlertRule> {
        self.registry.get(&rule.tenant_id).await?;
        if rule.field.is_empty() {
            return Err(TelemetryError::validation("alert rule field must not be empty"));
        }
        if rule.debounce_cycles == 0 {
            return Err(TelemetryError::validation(
                "debounce_cycles must be at least 1",
            ));
        }
        if let Some(family) = &rule.family {
            if !self.families.iter().any(|f| &f.name == family) {
                return Err(TelemetryError::validation(format!(
                    "unknown rollup family '{family}'"
                )));
            }
        }
        if let Some(policy_id) = &rule.escalation_policy_id {
            let policies = self.policies.read().await;
            let policy = policies
                .get(policy_id)
                .ok_or_else(|| TelemetryError::not_found(format!("escalation policy {policy_id}")))?;
            if policy.tenant_id != rule.tenant_id {
                return Err(TelemetryError::validation(
                    "escalation policy belongs to another tenant",
                ));
            }
        }
        rule.id = Uuid::new_v4().to_string();
        self.rules.write().await.insert(rule.id.clone(), rule.clone());
        info!(tenant_id = %rule.tenant_id, rule_id = %rule.id, name = %rule.name, "alert rule created");
        Ok(rule)
    }

    pub async fn list_rules(&self, tenant_id: &str) -> Vec<AlertRule> {
        self.rules
            .read()
            .await
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        self.rules
            .write()
            .await
            .remove(rule_id)
            .map(|_| ())
            .ok_or_else(|| TelemetryError::not_found(format!("alert rule {rule_id}")))
    }

    pub async fn create_escalation_policy(
        &self,
        tenant_id: &str,
        name: &str,
        steps: Vec<EscalationStep>,
    ) -> Result<EscalationPolicy> {
        self.registry.get(tenant_id).await?;
        if steps.is_empty() {
            return Err(TelemetryError::validation(
                "escalation policy needs at least one step",
            ));
        }
        let policy = EscalationPolicy {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            steps,
        };
        self.policies
            .write()
            .await
            .insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    pub async fn list_escalation_policies(&self, tenant_id: &str) -> Vec<EscalationPolicy> {
        self.policies
            .read()
            .await
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn delete_escalation_policy(&self, policy_id: &str) -> Result<()> {
        let in_use = self
            .rules
            .read()
            .await
            .values()
            .any(|r| r.escalation_policy_id.as_deref() == Some(policy_id));
        if in_use {
            return Err(TelemetryError::invalid_state(
                "escalation policy is referenced by an alert rule",
            ));
        }
        self.policies
            .write()
            .await
            .remove(policy_id)
            .map(|_| ())
            .ok_or_else(|| TelemetryError::not_found(format!("escalation policy {policy_id}")))
    }

    pub async fn list_alerts(&self, tenant_id: &str, include_resolved: bool) -> Vec<AlertState> {
        let mut out: Vec<AlertState> = self
            .open
            .read()
            .await
            .by_id
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect();
        if include_resolved {
            out.extend(
                self.resolved
                    .read()
                    .await
                    .iter()
                    .filter(|a| a.tenant_id == tenant_id)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.first_triggered.cmp(&b.first_triggered));
        out
    }

    pub async fn get_alert(&self, tenant_id: &str, alert_id: &str) -> Result<AlertState> {
        if let Some(state) = self.open.read().await.by_id.get(alert_id) {
            if state.tenant_id == tenant_id {
                return Ok(state.clone());
            }
        }
        if let Some(state) = self
            .resolved
            .read()
            .await
            .iter()
            .find(|a| a.id == alert_id && a.tenant_id == tenant_id)
        {
            return Ok(state.clone());
        }
        Err(TelemetryError::not_found(format!("alert {alert_id}")))
    }

    /// External acknowledgment. Cancels the SLA timer for the current step.
    pub async fn acknowledge(&self, tenant_id: &str, alert_id: &str) -> Result<AlertState> {
        let mut open = self.open.write().await;
        let state = open
            .by_id
            .get_mut(alert_id)
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| TelemetryError::not_found(format!("alert {alert_id}")))?;
        match state.status {
            AlertStatus::Firing | AlertStatus::Escalated => {
                state.status = AlertStatus::Acknowledged;
                state.last_transition = self.clock.now();
                state.sla_deadline = None;
                info!(tenant_id, alert_id, "alert acknowledged");
                Ok(state.clone())
            }
            other => Err(TelemetryError::invalid_state(format!(
                "cannot acknowledge an alert in state {other:?}"
            ))),
        }
    }

    /// Explicit manual close from any open state.
    pub async fn resolve(&self, tenant_id: &str, alert_id: &str) -> Result<AlertState> {
        let mut open = self.open.write().await;
        let exists = open
            .by_id
            .get(alert_id)
            .map_or(false, |a| a.tenant_id == tenant_id);
        if !exists {
            return Err(TelemetryError::not_found(format!("alert {alert_id}")));
        }
        let state = self.close(&mut open, alert_id).await;
        state.ok_or_else(|| TelemetryError::not_found(format!("alert {alert_id}")))
    }

    async fn close(&self, open: &mut OpenAlerts, alert_id: &str) -> Option<AlertState> {
        let mut state = open.remove(alert_id)?;
        state.status = AlertStatus::Resolved;
        state.last_transition = self.clock.now();
        state.sla_deadline = None;
        self.metrics.alerts_resolved.fetch_add(1, Ordering::Relaxed);

        let mut resolved = self.resolved.write().await;
        if resolved.len() >= RESOLVED_HISTORY_CAP {
            resolved.remove(0);
        }
        resolved.push(state.clone());
        Some(state)
    }

    /// One evaluation cycle: judge every rule against its observed values
    /// per source, walk debounce/clear transitions, then process due SLA
    /// deadlines. A rule whose scan fails is skipped and retried next cycle,
    /// never aborting the other rules.
    pub async fn run_eval_cycle(&self) -> Result<EvalStats> {
        let now = self.clock.now();
        let rules: Vec<AlertRule> = self.rules.read().await.values().cloned().collect();
        let mut stats = EvalStats::default();

        for rule in &rules {
            stats.rules_evaluated += 1;
            let observed = match self.observe_rule(rule, now).await {
                Ok(observed) => observed,
                Err(e) => {
                    error!(rule_id = %rule.id, error = %e, "rule evaluation failed");
                    continue;
                }
            };

            let mut false_sources = Vec::new();
            for (source_id, value) in &observed {
                if rule.op.holds(*value, rule.threshold) {
                    self.observe_true(rule, source_id, *value, now, &mut stats)
                        .await;
                } else {
                    false_sources.push(source_id.clone());
                }
            }
            // Sources absent from `observed` had no data in the window and
            // are deliberately not in this list; a gap is not a clear.
            self.clear_rule_sources(rule, &false_sources, now, &mut stats)
                .await;
        }

        stats.escalated = self.process_deadlines().await;
        Ok(stats)
    }

    /// Observed value per source for one rule, combining raw readings or
    /// rollup buckets over the rule's evaluation window. Sources with no
    /// data in the window are absent from the result.
    async fn observe_rule(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        let mut aggs: HashMap<String, FieldAggregate> = HashMap::new();
        let mut latest: HashMap<String, f64> = HashMap::new();

        match &rule.family {
            None => {
                let window = rule
                    .eval_window_secs
                    .unwrap_or(self.config.eval_interval_secs)
                    .max(1);
                let from = now - Duration::seconds(window as i64);
                let readings = self
                    .store
                    .scan_readings(&rule.tenant_id, None, from, now + Duration::seconds(1))
                    .await?;
                for reading in readings {
                    if let Some(value) = reading.fields.get(&rule.field) {
                        aggs.entry(reading.source_id.clone()).or_default().observe(*value);
                        // scan order is (source, timestamp), so later wins.
                        latest.insert(reading.source_id, *value);
                    }
                }
            }
            Some(family) => {
                let width = self
                    .families
                    .iter()
                    .find(|f| &f.name == family)
                    .map(|f| f.bucket_width_secs)
                    .ok_or_else(|| {
                        TelemetryError::not_found(format!("rollup family {family}"))
                    })?;
                let window = rule.eval_window_secs.unwrap_or(2 * width).max(width);
                let from = bucket_start(now - Duration::seconds(window as i64), width);
                let buckets = self
                    .store
                    .scan_buckets(
                        family,
                        &rule.tenant_id,
                        None,
                        from,
                        now + Duration::seconds(1),
                        usize::MAX,
                        None,
                    )
                    .await?;
                for bucket in buckets {
                    if let Some(agg) = bucket.fields.get(&rule.field) {
                        aggs.entry(bucket.source_id.clone()).or_default().merge(agg);
                        // scan order is (source, bucket start), so the most
                        // recent bucket wins.
                        latest.insert(bucket.source_id, agg.mean());
                    }
                }
            }
        }

        let observed = match rule.aggregate {
            AggregateFn::Latest => latest,
            AggregateFn::Avg => aggs.into_iter().map(|(s, a)| (s, a.mean())).collect(),
            AggregateFn::Min => aggs.into_iter().map(|(s, a)| (s, a.min)).collect(),
            AggregateFn::Max => aggs.into_iter().map(|(s, a)| (s, a.max)).collect(),
        };
        Ok(observed)
    }

    /// Condition observed true for (rule, source): open or advance.
    async fn observe_true(
        &self,
        rule: &AlertRule,
        source_id: &str,
        value: f64,
        now: DateTime<Utc>,
        stats: &mut EvalStats,
    ) {
        let mut open = self.open.write().await;
        let key = (
            rule.tenant_id.clone(),
            rule.id.clone(),
            source_id.to_string(),
        );

        if let Some(alert_id) = open.by_key.get(&key).cloned() {
            let fire = {
                let Some(state) = open.by_id.get_mut(&alert_id) else {
                    return;
                };
                state.consecutive_cycles += 1;
                state.last_transition = now;
                state.last_observed_value = value;
                state.status == AlertStatus::Pending
                    && state.consecutive_cycles >= rule.debounce_cycles
            };
            if fire {
                self.fire(&mut open, &alert_id, rule, now).await;
                stats.fired += 1;
            }
            return;
        }

        let mut state = AlertState {
            id: Uuid::new_v4().to_string(),
            tenant_id: rule.tenant_id.clone(),
            rule_id: rule.id.clone(),
            source_id: source_id.to_string(),
            status: AlertStatus::Pending,
            severity: rule.severity,
            first_triggered: now,
            last_transition: now,
            consecutive_cycles: 1,
            sla_deadline: None,
            escalation_step: 0,
            last_observed_value: value,
        };
        self.metrics.alerts_opened.fetch_add(1, Ordering::Relaxed);
        stats.opened += 1;
        debug!(tenant_id = %rule.tenant_id, rule_id = %rule.id, source_id, "alert opened pending");

        if state.consecutive_cycles >= rule.debounce_cycles {
            let alert_id = state.id.clone();
            open.insert(state);
            self.fire(&mut open, &alert_id, rule, now).await;
            stats.fired += 1;
        } else {
            open.insert(state);
        }
    }

    /// Resolve open alerts of `rule` whose source reported an observed
    /// false condition this cycle. Sources with no observation keep their
    /// open alerts, debounce counters, and SLA deadlines intact.
    async fn clear_rule_sources(
        &self,
        rule: &AlertRule,
        false_sources: &[String],
        _now: DateTime<Utc>,
        stats: &mut EvalStats,
    ) {
        let mut open = self.open.write().await;
        let cleared: Vec<String> = open
            .by_id
            .values()
            .filter(|a| a.rule_id == rule.id && false_sources.contains(&a.source_id))
            .map(|a| a.id.clone())
            .collect();
        for alert_id in cleared {
            if self.close(&mut open, &alert_id).await.is_some() {
                stats.resolved += 1;
                debug!(rule_id = %rule.id, alert_id, "alert resolved, condition cleared");
            }
        }
    }

    /// Pending -> Firing: arm the SLA timer and send the initial
    /// notification.
    async fn fire(
        &self,
        open: &mut OpenAlerts,
        alert_id: &str,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) {
        let sla = rule.sla_secs.unwrap_or(self.config.default_sla_secs);
        let deadline = now + Duration::seconds(sla as i64);
        let Some(state) = open.by_id.get_mut(alert_id) else {
            return;
        };
        state.status = AlertStatus::Firing;
        state.last_transition = now;
        state.sla_deadline = Some(deadline);
        self.metrics.alerts_fired.fetch_add(1, Ordering::Relaxed);
        info!(tenant_id = %state.tenant_id, alert_id, rule = %rule.name, %deadline, "alert firing");

        self.deadlines
            .lock()
            .await
            .push(Reverse((deadline, alert_id.to_string())));

        let target = self
            .step_target(rule, 0)
            .await
            .unwrap_or_else(|| self.config.fallback_target.clone());
        self.notify(state, 0, target);
    }

    /// Pop due deadlines and escalate the alerts that are still unacked.
    /// Heap entries for acknowledged or resolved alerts are stale and
    /// discarded.
    pub async fn process_deadlines(&self) -> u64 {
        let now = self.clock.now();
        let mut escalated = 0u64;
        loop {
            let due = {
                let mut heap = self.deadlines.lock().await;
                match heap.peek() {
                    Some(Reverse((deadline, _))) if *deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(Reverse((deadline, alert_id))) = due else {
                break;
            };

            let rule = {
                let open = self.open.read().await;
                let Some(state) = open.by_id.get(&alert_id) else {
                    continue;
                };
                if state.sla_deadline != Some(deadline)
                    || !matches!(state.status, AlertStatus::Firing | AlertStatus::Escalated)
                {
                    continue;
                }
                self.rules.read().await.get(&state.rule_id).cloned()
            };
            let Some(rule) = rule else {
                // Rule deleted while the alert was open; close it out.
                let mut open = self.open.write().await;
                self.close(&mut open, &alert_id).await;
                continue;
            };

            self.escalate(&alert_id, &rule, now).await;
            escalated += 1;
        }
        escalated
    }

    /// SLA breach: advance the escalation step, re-arm the timer from the
    /// next step's wait (or the repeat interval once the chain is
    /// exhausted), and notify the step's target. Never goes silent.
    async fn escalate(&self, alert_id: &str, rule: &AlertRule, now: DateTime<Utc>) {
        let steps = match &rule.escalation_policy_id {
            Some(policy_id) => self
                .policies
                .read()
                .await
                .get(policy_id)
                .map(|p| p.steps.clone())
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let mut open = self.open.write().await;
        let Some(state) = open.by_id.get_mut(alert_id) else {
            return;
        };

        state.status = AlertStatus::Escalated;
        state.escalation_step += 1;
        state.last_transition = now;
        self.metrics.alerts_escalated.fetch_add(1, Ordering::Relaxed);

        let step = state.escalation_step;
        let target = steps
            .get((step - 1).min(steps.len().saturating_sub(1)))
            .map(|s| s.target.clone())
            .filter(|_| !steps.is_empty())
            .unwrap_or_else(|| self.config.fallback_target.clone());

        // Next deadline: the following step's wait, or the repeat interval
        // once past the last step.
        let next_wait = steps
            .get(step)
            .map(|s| s.wait_secs)
            .unwrap_or(self.config.repeat_interval_secs);
        let next_deadline = now + Duration::seconds(next_wait.max(1) as i64);
        state.sla_deadline = Some(next_deadline);
        self.deadlines
            .lock()
            .await
            .push(Reverse((next_deadline, alert_id.to_string())));

        info!(
            tenant_id = %state.tenant_id,
            alert_id,
            step,
            %target,
            %next_deadline,
            "alert escalated"
        );
        let state_snapshot = state.clone();
        drop(open);
        self.notify(&state_snapshot, step, target);
    }

    async fn step_target(&self, rule: &AlertRule, step: usize) -> Option<String> {
        let policy_id = rule.escalation_policy_id.as_ref()?;
        let policies = self.policies.read().await;
        let policy = policies.get(policy_id)?;
        policy.steps.get(step).map(|s| s.target.clone())
    }

    fn notify(&self, state: &AlertState, step: usize, target: String) {
        dispatch_fire_and_forget(
            self.notifier.clone(),
            self.metrics.clone(),
            Notification {
                tenant_id: state.tenant_id.clone(),
                alert_id: state.id.clone(),
                severity: state.severity,
                escalation_step: step,
                target,
            },
        );
    }

    pub fn spawn_scheduler(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(engine.config.eval_interval_secs.max(1));
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("alert scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = engine.run_eval_cycle().await {
                            error!(error = %e, "alert evaluation cycle failed");
                        }
                    }
                }
            }
        })
    }
}
