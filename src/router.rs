//! HTTP route table and middleware stack.

use axum::routing::{get, post, put};
use axum::Router;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/ingest/:tenant_id", post(handlers::ingest::ingest_batch))
        .route(
            "/api/v1/ingest/:tenant_id/reading",
            post(handlers::ingest::ingest_one),
        )
        .route(
            "/api/v1/query/:tenant_id/range",
            get(handlers::query::query_range),
        )
        .route(
            "/api/v1/query/:tenant_id/sources",
            get(handlers::query::list_sources),
        )
        .route(
            "/api/v1/admin/tenants",
            post(handlers::admin::create_tenant).get(handlers::admin::list_tenants),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id",
            get(handlers::admin::get_tenant),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/status",
            put(handlers::admin::update_tenant_status),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/plan",
            put(handlers::admin::update_tenant_plan),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/features",
            put(handlers::admin::update_tenant_features),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/usage",
            get(handlers::admin::tenant_usage),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/retention",
            post(handlers::admin::create_retention_policy)
                .get(handlers::admin::list_retention_policies),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/retention/:policy_id",
            axum::routing::delete(handlers::admin::delete_retention_policy),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/archive",
            get(handlers::admin::list_archive_entries),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/escalation-policies",
            post(handlers::admin::create_escalation_policy)
                .get(handlers::admin::list_escalation_policies),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/escalation-policies/:policy_id",
            axum::routing::delete(handlers::admin::delete_escalation_policy),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/alert-rules",
            post(handlers::admin::create_alert_rule).get(handlers::admin::list_alert_rules),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/alert-rules/:rule_id",
            axum::routing::delete(handlers::admin::delete_alert_rule),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/alerts",
            get(handlers::admin::list_alerts),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/alerts/:alert_id/ack",
            post(handlers::admin::acknowledge_alert),
        )
        .route(
            "/api/v1/admin/tenants/:tenant_id/alerts/:alert_id/resolve",
            post(handlers::admin::resolve_alert),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(timeout)),
        )
        .with_state(state)
}
