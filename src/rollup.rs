//! Aggregation engine: maintains independently scheduled rollup families
//! over the raw store (or over a finer family, for multi-level rollups).
//!
//! Each cycle re-scans the trailing lag window, re-buckets by truncated
//! timestamp, and upserts whole buckets — replacement, never incremental
//! merge, so replays and late-arriving data converge to identical output.
//! Buckets wholly outside the lag window are final and never touched again
//! except by retention.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{RollupConfig, RollupFamilyConfig};
use crate::error::{Result, TelemetryError};
use crate::metrics::MetricsCollector;
use crate::store::{bucket_start, FieldAggregate, RollupBucket, TelemetryStore};
use crate::tenant::{SystemScope, TenantRegistry};

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub units: usize,
    pub failed_units: usize,
    pub buckets_upserted: u64,
}

pub struct RollupEngine {
    store: Arc<dyn TelemetryStore>,
    registry: Arc<TenantRegistry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: RollupConfig,
    workers: Arc<Semaphore>,
}

impl RollupEngine {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        registry: Arc<TenantRegistry>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: RollupConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            store,
            registry,
            clock,
            metrics,
            config,
            workers,
        }
    }

    pub fn families(&self) -> &[RollupFamilyConfig] {
        &self.config.families
    }

    /// Run one refresh cycle for one family across all writable tenants.
    /// (tenant, family) units are independent: a failed or slow unit is
    /// logged, counted, and retried on the next cycle without blocking the
    /// rest.
    pub async fn run_family_cycle(&self, family_name: &str) -> Result<CycleStats> {
        let family = self
            .config
            .families
            .iter()
            .find(|f| f.name == family_name)
            .ok_or_else(|| {
                TelemetryError::config(format!("unknown rollup family '{family_name}'"))
            })?;

        let now = self.clock.now();
        // Align the scan start down to a bucket boundary so the bucket
        // straddling the lag horizon is recomputed from its complete input.
        let from = bucket_start(
            now - Duration::seconds(family.lag_window_secs as i64),
            family.bucket_width_secs,
        );

        let started = Instant::now();
        let tenants = self.registry.list(SystemScope).await;
        let unit_timeout = std::time::Duration::from_secs(self.config.unit_timeout_secs.max(1));

        let mut stats = CycleStats::default();
        let units = tenants
            .iter()
            .filter(|t| t.status.is_writable())
            .map(|tenant| {
                let derived = tenant.quota.features.derived_scores;
                let tenant_id = tenant.id.clone();
                async move {
                    let _permit = self.workers.acquire().await;
                    let outcome = tokio::time::timeout(
                        unit_timeout,
                        self.refresh_unit(&tenant_id, family, derived, from, now),
                    )
                    .await;
                    let result = match outcome {
                        Ok(r) => r,
                        Err(_) => Err(TelemetryError::timeout(format!(
                            "refresh unit ({tenant_id}, {family_name}) exceeded {}s",
                            unit_timeout.as_secs()
                        ))),
                    };
                    (tenant_id, result)
                }
            })
            .collect::<Vec<_>>();

        for (tenant_id, result) in join_all(units).await {
            stats.units += 1;
            match result {
                Ok(upserted) => {
                    stats.buckets_upserted += upserted;
                    debug!(tenant_id, family = family_name, upserted, "refresh unit done");
                }
                Err(e) => {
                    stats.failed_units += 1;
                    self.metrics.rollup_unit_failures.fetch_add(1, Ordering::Relaxed);
                    error!(tenant_id, family = family_name, error = %e, "refresh unit failed");
                }
            }
        }

        self.metrics.rollup_cycles.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .rollup_buckets_upserted
            .fetch_add(stats.buckets_upserted, Ordering::Relaxed);

        if started.elapsed().as_secs() > family.cadence_secs {
            self.metrics.rollup_lag_warnings.fetch_add(1, Ordering::Relaxed);
            warn!(
                family = family_name,
                elapsed_secs = started.elapsed().as_secs(),
                cadence_secs = family.cadence_secs,
                "rollup cycle overran its cadence"
            );
        }
        Ok(stats)
    }

    /// Recompute and upsert all buckets of one (tenant, family) inside
    /// `[from, to)`.
    async fn refresh_unit(
        &self,
        tenant_id: &str,
        family: &RollupFamilyConfig,
        derived_scores: bool,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let mut groups: BTreeMap<(String, DateTime<Utc>), BTreeMap<String, FieldAggregate>> =
            BTreeMap::new();

        match &family.input_family {
            None => {
                let readings = self.store.scan_readings(tenant_id, None, from, to).await?;
                for reading in readings {
                    let start = bucket_start(reading.timestamp, family.bucket_width_secs);
                    let fields = groups.entry((reading.source_id.clone(), start)).or_default();
                    for (name, value) in &reading.fields {
                        fields.entry(name.clone()).or_default().observe(*value);
                    }
                }
            }
            Some(finer) => {
                let inputs = self
                    .store
                    .scan_buckets(finer, tenant_id, None, from, to, usize::MAX, None)
                    .await?;
                for input in inputs {
                    let start = bucket_start(input.bucket_start, family.bucket_width_secs);
                    let fields = groups.entry((input.source_id.clone(), start)).or_default();
                    for (name, aggregate) in &input.fields {
                        fields.entry(name.clone()).or_default().merge(aggregate);
                    }
                }
            }
        }

        let refreshed_at = self.clock.now();
        let mut upserted = 0u64;
        for ((source_id, start), fields) in groups {
            let (efficiency, health) = if derived_scores {
                Self::derive_scores(family, &fields)
            } else {
                (None, None)
            };
            self.store
                .upsert_bucket(RollupBucket {
                    tenant_id: tenant_id.to_string(),
                    source_id,
                    family: family.name.clone(),
                    bucket_start: start,
                    bucket_width_secs: family.bucket_width_secs,
                    fields,
                    efficiency_score: efficiency,
                    health_score: health,
                    refreshed_at,
                })
                .await?;
            upserted += 1;
        }
        Ok(upserted)
    }

    /// Derived scores come from the aggregates of the same pass, never from
    /// raw data, so the bucket stays the single source of truth.
    fn derive_scores(
        family: &RollupFamilyConfig,
        fields: &BTreeMap<String, FieldAggregate>,
    ) -> (Option<f64>, Option<f64>) {
        let efficiency = match (&family.efficiency_numerator, &family.efficiency_denominator) {
            (Some(num), Some(den)) => {
                match (fields.get(num.as_str()), fields.get(den.as_str())) {
                    (Some(n), Some(d)) if d.mean().abs() > f64::EPSILON => {
                        Some(n.mean() / d.mean())
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        // Health penalizes relative spread: 100 for perfectly steady fields,
        // trending toward 0 as the mean coefficient of variation grows.
        let mut cv_sum = 0.0;
        let mut cv_count = 0u32;
        for aggregate in fields.values() {
            let mean = aggregate.mean();
            if aggregate.count > 1 && mean.abs() > f64::EPSILON {
                cv_sum += aggregate.stddev() / mean.abs();
                cv_count += 1;
            }
        }
        let health = if cv_count == 0 {
            Some(100.0)
        } else {
            Some(100.0 / (1.0 + cv_sum / cv_count as f64))
        };

        (efficiency, health)
    }

    /// Run one cycle for every family, in configuration order (finer
    /// families are conventionally listed before the families that consume
    /// them).
    pub async fn run_all_families(&self) -> Result<Vec<(String, CycleStats)>> {
        let mut out = Vec::new();
        for family in &self.config.families {
            let stats = self.run_family_cycle(&family.name).await?;
            out.push((family.name.clone(), stats));
        }
        Ok(out)
    }

    /// Spawn one scheduler task per family, each on its own cadence.
    pub fn spawn_schedulers(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.config
            .families
            .iter()
            .map(|family| {
                let engine = Arc::clone(self);
                let name = family.name.clone();
                let cadence = std::time::Duration::from_secs(family.cadence_secs.max(1));
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(cadence);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!(family = %name, "rollup scheduler stopping");
                                break;
                            }
                            _ = ticker.tick() => {
                                if let Err(e) = engine.run_family_cycle(&name).await {
                                    error!(family = %name, error = %e, "rollup cycle failed");
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
