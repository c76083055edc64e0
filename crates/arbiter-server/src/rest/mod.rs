mod handlers;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use arbiter_storage::{SnapshotSource, StoreFactory};

use crate::metrics::Metrics;
use crate::service::AuthzService;

pub struct AppState<F: StoreFactory + SnapshotSource> {
    pub service: Arc<AuthzService<F>>,
    pub metrics: Arc<Metrics>,
}

impl<F: StoreFactory + SnapshotSource> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

async fn metrics_middleware<F: StoreFactory + SnapshotSource>(
    State(state): State<AppState<F>>,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    // scrapes would otherwise count themselves
    if request.uri().path() == "/metrics" {
        return next.run(request).await;
    }

    state.metrics.record_request();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    if response.status().is_success() {
        state.metrics.record_success();
    } else {
        state.metrics.record_error();
    }
    tracing::debug!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request handled"
    );

    response
}

pub fn create_router<F>(state: AppState<F>, max_body_bytes: usize) -> Router
where
    F: StoreFactory + SnapshotSource,
{
    Router::new()
        .route("/v1/permissions/check", post(handlers::check))
        .route("/v1/permissions/expand", post(handlers::expand))
        .route(
            "/v1/permissions/lookup-entity",
            post(handlers::lookup_entity),
        )
        .route(
            "/v1/permissions/lookup-subject",
            post(handlers::lookup_subject),
        )
        .route(
            "/v1/permissions/subject-permission",
            post(handlers::subject_permission),
        )
        .route(
            "/v1/relationships/write",
            post(handlers::write_relationships),
        )
        .route("/v1/relationships/read", post(handlers::read_relationships))
        .route(
            "/v1/relationships/delete",
            post(handlers::delete_relationships),
        )
        .route("/v1/attributes/write", post(handlers::write_attributes))
        .route("/v1/attributes/read", post(handlers::read_attributes))
        .route(
            "/v1/schema",
            post(handlers::write_schema).get(handlers::read_schema),
        )
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .with_state(state)
}
