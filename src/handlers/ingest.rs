//! Ingestion endpoints.

use axum::extract::{Path, State};
use axum::Json;
use tracing::debug;

use crate::error::Result;
use crate::ingest::{IngestOutcome, IngestReport, ReadingInput};
use crate::state::AppState;

/// `POST /api/v1/ingest/{tenant_id}` with a JSON array of readings.
/// Admission is all-or-nothing per batch; per-reading validation failures
/// are itemized in the report.
pub async fn ingest_batch(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(readings): Json<Vec<ReadingInput>>,
) -> Result<Json<IngestReport>> {
    let report = state.ingest.ingest_batch(&tenant_id, readings).await?;
    debug!(
        tenant_id,
        accepted = report.accepted,
        rejected = report.rejected,
        duplicates = report.duplicates,
        "batch ingested"
    );
    Ok(Json(report))
}

/// `POST /api/v1/ingest/{tenant_id}/reading` for a single reading.
pub async fn ingest_one(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(reading): Json<ReadingInput>,
) -> Result<Json<IngestOutcome>> {
    let outcome = state.ingest.ingest(&tenant_id, reading).await?;
    Ok(Json(outcome))
}
