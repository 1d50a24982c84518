//! Range query endpoints, consumed by dashboards. Rollup queries are
//! cursor-paginated on (source, bucket start) so callers can restart
//! mid-range without losing buckets at a source boundary.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::state::AppState;
use crate::store::{BucketCursor, Reading, RollupBucket};

const DEFAULT_PAGE_SIZE: usize = 500;
const MAX_PAGE_SIZE: usize = 5_000;

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    /// `raw` or a rollup family name.
    pub family: String,
    pub source: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: Option<usize>,
    /// Opaque resumption token from a prior page's `next_cursor`.
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RangeResponse {
    Buckets {
        buckets: Vec<RollupBucket>,
        next_cursor: Option<String>,
    },
    Readings {
        readings: Vec<Reading>,
    },
}

/// `GET /api/v1/query/{tenant_id}/range`
pub async fn query_range(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<RangeResponse>> {
    state.registry.get(&tenant_id).await?;
    if params.to <= params.from {
        return Err(TelemetryError::validation("`to` must be after `from`"));
    }
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

    if params.family == "raw" {
        let readings = state
            .store
            .scan_readings(
                &tenant_id,
                params.source.as_deref(),
                params.from,
                params.to,
            )
            .await?;
        return Ok(Json(RangeResponse::Readings { readings }));
    }

    if state.config.family(&params.family).is_none() {
        return Err(TelemetryError::not_found(format!(
            "rollup family {}",
            params.family
        )));
    }

    let cursor = params
        .cursor
        .as_deref()
        .map(|s| s.parse::<BucketCursor>())
        .transpose()
        .map_err(TelemetryError::validation)?;
    let buckets = state
        .store
        .scan_buckets(
            &params.family,
            &tenant_id,
            params.source.as_deref(),
            params.from,
            params.to,
            limit,
            cursor,
        )
        .await?;
    let next_cursor = if buckets.len() == limit {
        buckets.last().map(|b| BucketCursor::after(b).to_string())
    } else {
        None
    };
    Ok(Json(RangeResponse::Buckets {
        buckets,
        next_cursor,
    }))
}

/// `GET /api/v1/query/{tenant_id}/sources`
pub async fn list_sources(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<String>>> {
    state.registry.get(&tenant_id).await?;
    Ok(Json(state.store.list_sources(&tenant_id).await?))
}
