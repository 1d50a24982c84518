//! HTTP handlers. Thin translation layers over the engines: extract, call,
//! serialize. All error mapping happens in `TelemetryError::into_response`.

pub mod admin;
pub mod ingest;
pub mod query;

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::AppState;
use crate::tenant::SystemScope;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.metrics.uptime_seconds(),
        "tenants": state.registry.count(SystemScope).await,
    }))
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.export_prometheus()
}
