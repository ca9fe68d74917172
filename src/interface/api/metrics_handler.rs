//! Prometheus metrics handler

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics exporter
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // Describe metrics
    describe_gauge!(
        "webphone_sessions_active",
        "Number of currently connected signaling sessions"
    );
    describe_counter!(
        "webphone_calls_offered_total",
        "Total number of offers accepted from clients"
    );
    describe_counter!(
        "webphone_calls_connected_total",
        "Total number of calls that reached the connected phase"
    );
    describe_counter!(
        "webphone_calls_failed_total",
        "Total number of call setups that failed"
    );
    describe_counter!(
        "webphone_telephony_releases_total",
        "Total number of PBX channel/bridge releases"
    );
    describe_counter!(
        "webphone_telephony_release_failures_total",
        "Total number of failed PBX release steps"
    );
    describe_counter!(
        "webphone_protocol_violations_total",
        "Total number of client messages rejected as out of order"
    );

    Ok(handle)
}

/// HTTP metrics handler
pub async fn metrics_handler(State(prometheus_handle): State<PrometheusHandle>) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}
