//! Structured request logging + HTTP metrics.
//!
//! Logs method, path, status, and latency. Header values never reach the
//! log; anything token-shaped would have to go through `redact::token`
//! first, and nothing here needs to.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

pub async fn request_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    metrics::counter!(
        "http_requests_total",
        1,
        "method" => method.to_string(),
        "status" => status.to_string()
    );
    metrics::histogram!("http_request_duration_seconds", latency.as_secs_f64());

    tracing::info!(
        method = %method,
        path = %path,
        status,
        latency_ms = latency.as_millis() as u64,
        "request"
    );

    response
}
