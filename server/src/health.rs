//! Health and readiness probes.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::DistributedCache;
use crate::store::{ConversationsRead, Storage};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    storage: bool,
    cache: bool,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Liveness probe - 200 whenever the process can answer at all.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - checks the authoritative store and the shared cache.
/// Cache trouble degrades (it is best-effort everywhere) but still reports,
/// so orchestrators can see it.
pub async fn readiness(
    State(storage): State<Storage>,
    State(cache): State<Arc<DistributedCache>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let storage_ok = storage
        .conversations_read
        .get(Uuid::nil())
        .await
        .is_ok();
    let cache_ok = cache.get_checked::<u8>("health:probe").await.is_ok();

    let ready = storage_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            checks: ReadinessChecks {
                storage: storage_ok,
                cache: cache_ok,
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liveness_is_static_ok() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn health_body_shape() {
        let body = health().await.0;
        assert_eq!(body.status, "ok");
    }
}
