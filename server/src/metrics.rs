//! Prometheus metrics wiring.
//!
//! The exposition must never contain request bodies or ciphertext; nothing
//! in this crate records payload-derived label values, and the scenario
//! suite asserts the rendered output stays clean.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// Install the process-global recorder. Call once from main (or once
    /// per test binary).
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
        metrics::describe_histogram!(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        );
        metrics::describe_counter!(
            "messages_ingested_total",
            "Messages durably persisted by the ingest pipeline"
        );
        metrics::describe_counter!(
            "messages_replayed_total",
            "Messages streamed by the replay engine"
        );
        metrics::describe_counter!("hub_fanout_total", "MessagePersisted events fanned out");
        metrics::describe_gauge!("ws_sessions_active", "Live WebSocket sessions");
        metrics::describe_counter!(
            "ws_frames_dropped_total",
            "Outbound frames dropped on full session queues"
        );
        metrics::describe_counter!("cache_near_hits_total", "Near-cache hits");
        metrics::describe_counter!("cache_shared_hits_total", "Shared cache hits");
        metrics::describe_counter!(
            "cache_invalidations_total",
            "Peer invalidation envelopes applied"
        );
        metrics::describe_counter!("rate_limited_total", "Requests rejected by the rate limiter");

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

/// Handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}
