//! API route definitions.

use crate::api::{handlers, sse};
use crate::manager::SessionManager;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

/// Build the complete API router.
pub fn create_router(manager: Arc<SessionManager>) -> Router {
    let state = AppState { manager };

    Router::new()
        .route("/health", get(handlers::health_probe))
        .route(
            "/api/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route(
            "/api/sessions/:sid",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/api/sessions/:sid/worker",
            post(handlers::load_worker).delete(handlers::unload_worker),
        )
        .route("/api/sessions/:sid/trigger", post(handlers::trigger))
        .route("/api/sessions/:sid/inject", post(handlers::inject))
        .route("/api/sessions/:sid/chat", post(handlers::chat))
        .route("/api/sessions/:sid/stop", post(handlers::stop))
        .route("/api/sessions/:sid/cancel", post(handlers::cancel))
        .route("/api/sessions/:sid/resume", post(handlers::resume))
        .route("/api/sessions/:sid/replay", post(handlers::replay))
        .route(
            "/api/sessions/:sid/checkpoints",
            get(handlers::list_checkpoints),
        )
        .route("/api/sessions/:sid/events", get(sse::events))
        .route(
            "/api/sessions/:sid/graphs/:gid/nodes",
            get(handlers::graph_nodes),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
