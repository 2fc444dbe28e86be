//! Route table for the HTTP control surface.

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{auth, handlers, state::AppState};

/// Full application router. `/health` stays outside the API key check so
/// probes work without credentials.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .merge(create_api_router(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

pub fn create_api_router(state: AppState) -> Router<AppState> {
    Router::new().nest("/api/v1", create_v1_router(state))
}

fn create_v1_router(state: AppState) -> Router<AppState> {
    Router::new()
        // Stage operations
        .route("/dedup/run", post(handlers::run_dedup))
        .route("/dedup/status", get(handlers::dedup_status))
        .route(
            "/batches",
            post(handlers::create_batch).get(handlers::list_batches),
        )
        .route("/batches/{id}", get(handlers::get_batch))
        .route("/batches/{id}/retry", post(handlers::retry_batch))
        .route(
            "/batches/{id}/sync",
            post(handlers::start_sync).get(handlers::sync_status),
        )
        .route("/batches/{id}/sort", post(handlers::sort_batch))
        .route("/sync/refresh", post(handlers::refresh_sync))
        .route("/cleanup/run", post(handlers::run_cleanup))
        // Orchestration
        .route("/pipeline/run", post(handlers::run_pipeline))
        .route("/pipeline/status", get(handlers::pipeline_status))
        .route("/overview", get(handlers::overview))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_key,
        ))
}
