//! Notification dispatch for the alert lifecycle.
//!
//! The dispatcher is a fire-and-forget collaborator: delivery success or
//! failure never feeds back into alert state transitions. Failures are
//! retried locally a bounded number of times, then logged and counted.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::Severity;
use crate::error::{Result, TelemetryError};
use crate::metrics::MetricsCollector;
use crate::util::retry::retry_idempotent;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub tenant_id: String,
    pub alert_id: String,
    pub severity: Severity,
    pub escalation_step: usize,
    pub target: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<()>;
}

/// Logs each notification; the default when no webhook is configured.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn dispatch(&self, n: &Notification) -> Result<()> {
        info!(
            tenant_id = %n.tenant_id,
            alert_id = %n.alert_id,
            severity = ?n.severity,
            step = n.escalation_step,
            target = %n.target,
            "alert notification"
        );
        Ok(())
    }
}

/// Posts notifications as JSON to an external dispatcher endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn dispatch(&self, n: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(n)
            .send()
            .await
            .map_err(|e| TelemetryError::transient(format!("webhook send: {e}")))?;
        if !response.status().is_success() {
            return Err(TelemetryError::transient(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Records notifications in memory for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn dispatch(&self, n: &Notification) -> Result<()> {
        self.sent.lock().push(n.clone());
        Ok(())
    }
}

/// Dispatch in the background with bounded retries. The caller (the alert
/// state machine) does not await delivery.
pub fn dispatch_fire_and_forget(
    notifier: Arc<dyn Notifier>,
    metrics: Arc<MetricsCollector>,
    notification: Notification,
) {
    tokio::spawn(async move {
        let outcome = retry_idempotent(3, || {
            let notifier = notifier.clone();
            let n = notification.clone();
            async move { notifier.dispatch(&n).await }
        })
        .await;

        match outcome {
            Ok(()) => {
                metrics
                    .notifications_sent
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) => {
                metrics
                    .notifications_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(
                    alert_id = %notification.alert_id,
                    target = %notification.target,
                    error = %e,
                    "notification exhausted retries"
                );
            }
        }
    });
}
