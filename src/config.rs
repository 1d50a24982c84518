//! Configuration for the telemetry store.
//!
//! Loaded from an optional TOML file plus `TELEMETRY__`-prefixed environment
//! overrides; every field carries a serde default so an empty configuration
//! produces a runnable store.

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Result, TelemetryError};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Ingestion window and reading schema configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Names of the numeric fields a reading may carry.
    #[serde(default = "default_schema_fields")]
    pub schema_fields: Vec<String>,
    /// Readings stamped further than this into the future are rejected.
    #[serde(default = "default_future_skew")]
    pub max_future_skew_secs: u64,
    /// Chunk width for the time-partitioned raw store.
    #[serde(default = "default_chunk_width")]
    pub chunk_width_secs: u64,
    /// Lower ingestion bound for tenants without a raw retention policy.
    #[serde(default = "default_retention_days")]
    pub default_retention_days: u32,
}

/// Sliding usage window configuration for admission control
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    #[serde(default = "default_quota_window")]
    pub window_secs: u64,
    #[serde(default = "default_quota_slot")]
    pub slot_secs: u64,
    /// Rough per-reading size estimate used for storage admission.
    #[serde(default = "default_reading_bytes")]
    pub estimated_reading_bytes: u64,
}

/// Aggregation engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RollupConfig {
    #[serde(default = "default_families")]
    pub families: Vec<RollupFamilyConfig>,
    /// Bound on concurrent (tenant, family) refresh units.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Per-unit timeout; a slow tenant is skipped and retried next cycle.
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_secs: u64,
}

/// One rollup family: bucket width, refresh cadence, and lag window.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RollupFamilyConfig {
    pub name: String,
    pub bucket_width_secs: u64,
    #[serde(default = "default_cadence")]
    pub cadence_secs: u64,
    #[serde(default = "default_lag_window")]
    pub lag_window_secs: u64,
    /// Finer family this one rolls up, or raw readings when absent.
    #[serde(default)]
    pub input_family: Option<String>,
    /// Field pair for the efficiency score (numerator avg / denominator avg).
    #[serde(default)]
    pub efficiency_numerator: Option<String>,
    #[serde(default)]
    pub efficiency_denominator: Option<String>,
}

/// Retention engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_interval")]
    pub check_interval_secs: u64,
    /// Count eligible units without deleting anything.
    #[serde(default)]
    pub dry_run: bool,
    /// Directory for the filesystem archive sink.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
}

/// Alert lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertingConfig {
    #[serde(default = "default_eval_interval")]
    pub eval_interval_secs: u64,
    /// SLA applied when a rule does not set one. Never "never".
    #[serde(default = "default_sla")]
    pub default_sla_secs: u64,
    /// Re-notification interval once the escalation chain is exhausted.
    #[serde(default = "default_repeat_interval")]
    pub repeat_interval_secs: u64,
    /// Target notified when a rule has no escalation policy.
    #[serde(default = "default_fallback_target")]
    pub fallback_target: String,
}

fn default_bind_address() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_schema_fields() -> Vec<String> {
    vec![
        "temperature".to_string(),
        "pressure".to_string(),
        "flow_rate".to_string(),
        "power_in".to_string(),
        "power_out".to_string(),
    ]
}

fn default_future_skew() -> u64 {
    300
}

fn default_chunk_width() -> u64 {
    86_400
}

fn default_retention_days() -> u32 {
    90
}

fn default_quota_window() -> u64 {
    3_600
}

fn default_quota_slot() -> u64 {
    60
}

fn default_reading_bytes() -> u64 {
    256
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_unit_timeout() -> u64 {
    60
}

fn default_cadence() -> u64 {
    60
}

fn default_lag_window() -> u64 {
    7_200
}

fn default_families() -> Vec<RollupFamilyConfig> {
    vec![
        RollupFamilyConfig {
            name: "hourly".to_string(),
            bucket_width_secs: 3_600,
            cadence_secs: 60,
            lag_window_secs: 7_200,
            input_family: None,
            efficiency_numerator: Some("power_out".to_string()),
            efficiency_denominator: Some("power_in".to_string()),
        },
        RollupFamilyConfig {
            name: "daily".to_string(),
            bucket_width_secs: 86_400,
            cadence_secs: 300,
            lag_window_secs: 7_200,
            input_family: None,
            efficiency_numerator: Some("power_out".to_string()),
            efficiency_denominator: Some("power_in".to_string()),
        },
    ]
}

fn default_retention_interval() -> u64 {
    3_600
}

fn default_archive_dir() -> String {
    "./archive".to_string()
}

fn default_eval_interval() -> u64 {
    30
}

fn default_sla() -> u64 {
    600
}

fn default_repeat_interval() -> u64 {
    900
}

fn default_fallback_target() -> String {
    "ops-oncall".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            schema_fields: default_schema_fields(),
            max_future_skew_secs: default_future_skew(),
            chunk_width_secs: default_chunk_width(),
            default_retention_days: default_retention_days(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_secs: default_quota_window(),
            slot_secs: default_quota_slot(),
            estimated_reading_bytes: default_reading_bytes(),
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            families: default_families(),
            worker_concurrency: default_worker_concurrency(),
            unit_timeout_secs: default_unit_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_retention_interval(),
            dry_run: false,
            archive_dir: default_archive_dir(),
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            eval_interval_secs: default_eval_interval(),
            default_sla_secs: default_sla(),
            repeat_interval_secs: default_repeat_interval(),
            fallback_target: default_fallback_target(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides (`TELEMETRY__SERVER__BIND_ADDRESS` style).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            let path_str = path.to_string_lossy();
            builder = builder.add_source(File::new(&path_str, FileFormat::Toml));
        }

        builder = builder.add_source(Environment::with_prefix("TELEMETRY").separator("__"));

        let raw = builder
            .build()
            .map_err(|e| TelemetryError::config(format!("failed to build config: {e}")))?;

        let cfg: StoreConfig = raw
            .try_deserialize()
            .map_err(|e| TelemetryError::config(format!("failed to deserialize config: {e}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.schema_fields.is_empty() {
            return Err(TelemetryError::config("schema_fields must not be empty"));
        }
        if self.quota.slot_secs == 0 || self.quota.window_secs < self.quota.slot_secs {
            return Err(TelemetryError::config(
                "quota window must span at least one slot",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for family in &self.rollup.families {
            if family.bucket_width_secs == 0 {
                return Err(TelemetryError::config(format!(
                    "rollup family '{}' has zero bucket width",
                    family.name
                )));
            }
            if !seen.insert(family.name.clone()) {
                return Err(TelemetryError::config(format!(
                    "duplicate rollup family '{}'",
                    family.name
                )));
            }
        }
        for family in &self.rollup.families {
            if let Some(input) = &family.input_family {
                let finer = self
                    .rollup
                    .families
                    .iter()
                    .find(|f| &f.name == input)
                    .ok_or_else(|| {
                        TelemetryError::config(format!(
                            "rollup family '{}' references unknown input '{}'",
                            family.name, input
                        ))
                    })?;
                if family.bucket_width_secs % finer.bucket_width_secs != 0 {
                    return Err(TelemetryError::config(format!(
                        "family '{}' width must be a multiple of input '{}' width",
                        family.name, input
                    )));
                }
            }
        }
        Ok(())
    }

    /// Largest lag window across all families. Retention must never reach
    /// inside this horizon.
    pub fn max_lag_window_secs(&self) -> u64 {
        self.rollup
            .families
            .iter()
            .map(|f| f.lag_window_secs)
            .max()
            .unwrap_or(0)
    }

    pub fn family(&self, name: &str) -> Option<&RollupFamilyConfig> {
        self.rollup.families.iter().find(|f| f.name == name)
    }
}
