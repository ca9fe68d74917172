//! API Router configuration

use super::metrics_handler::metrics_handler;
use super::user_handler::{health_check, login, register, AppState};
use super::webrtc_signaling::signaling_router;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP + WebSocket router
pub fn build_router(state: AppState, prometheus_handle: PrometheusHandle) -> Router {
    // Health check route (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    // Registration routes
    let user_routes = Router::new()
        .route("/register", post(register))
        .route("/login", post(login));

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    // WebSocket route (separate state)
    let ws_routes = signaling_router(state.relay.clone());

    // Combine routes with state
    Router::new()
        .merge(health_routes)
        .merge(user_routes)
        .with_state(state)
        .merge(metrics_routes)
        .merge(ws_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
