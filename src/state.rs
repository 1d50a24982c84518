//! Shared application state handed to every HTTP handler and background
//! worker. Component wiring is explicit (store handle, clock, notifier all
//! passed in), so tests assemble the same state with fakes.

use std::sync::Arc;

use crate::alerts::AlertEngine;
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::ingest::IngestionManager;
use crate::metrics::MetricsCollector;
use crate::notify::{Notifier, TracingNotifier};
use crate::quota::QuotaEnforcer;
use crate::retention::RetentionEngine;
use crate::rollup::RollupEngine;
use crate::store::{ArchiveSink, FsArchiveSink, MemoryStore, TelemetryStore};
use crate::tenant::TenantRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<StoreConfig>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn TelemetryStore>,
    pub registry: Arc<TenantRegistry>,
    pub quota: Arc<QuotaEnforcer>,
    pub ingest: Arc<IngestionManager>,
    pub rollup: Arc<RollupEngine>,
    pub retention: Arc<RetentionEngine>,
    pub alerts: Arc<AlertEngine>,
    pub metrics: Arc<MetricsCollector>,
}

impl AppState {
    /// Production wiring: system clock, in-memory store, filesystem archive
    /// sink, log-based notifier.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn TelemetryStore> = Arc::new(MemoryStore::new());
        let sink: Arc<dyn ArchiveSink> =
            Arc::new(FsArchiveSink::new(config.retention.archive_dir.clone()));
        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
        Self::with_parts(config, clock, store, sink, notifier)
    }

    /// Explicit wiring for tests: fake clock, in-memory sinks.
    pub fn with_parts(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn TelemetryStore>,
        sink: Arc<dyn ArchiveSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(TenantRegistry::new(clock.clone()));
        let quota = Arc::new(QuotaEnforcer::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            config.quota.clone(),
        ));
        let ingest = Arc::new(IngestionManager::new(
            store.clone(),
            registry.clone(),
            quota.clone(),
            clock.clone(),
            metrics.clone(),
            config.ingest.clone(),
        ));
        let rollup = Arc::new(RollupEngine::new(
            store.clone(),
            registry.clone(),
            clock.clone(),
            metrics.clone(),
            config.rollup.clone(),
        ));
        let retention = Arc::new(RetentionEngine::new(
            store.clone(),
            registry.clone(),
            sink,
            clock.clone(),
            metrics.clone(),
            config.retention.clone(),
            config.rollup.clone(),
        ));
        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            registry.clone(),
            notifier,
            clock.clone(),
            metrics.clone(),
            config.alerting.clone(),
            config.rollup.clone(),
        ));
        Ok(Self {
            config,
            clock,
            store,
            registry,
            quota,
            ingest,
            rollup,
            retention,
            alerts,
            metrics,
        })
    }
}
