//! Multi-tenant time-series telemetry store.
//!
//! Readings are admitted per tenant quota, partitioned into time chunks,
//! rolled up into configurable bucket families by a background aggregation
//! engine, aged out by retention policies, and watched by a threshold alert
//! state machine. All external access goes through the HTTP API.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod quota;
pub mod retention;
pub mod rollup;
pub mod router;
pub mod state;
pub mod store;
pub mod tenant;
pub mod util;

pub use config::StoreConfig;
pub use error::{RejectReason, Result, TelemetryError};
pub use state::AppState;
