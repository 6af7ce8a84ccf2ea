//! Application state and router assembly.

use axum::{
    extract::FromRef,
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::TokenVerifier;
use crate::cache::DistributedCache;
use crate::config::Config;
use crate::handlers;
use crate::health;
use crate::hub::Hub;
use crate::ingest::Pipeline;
use crate::metrics;
use crate::middleware;
use crate::rate_limit::RateLimiter;
use crate::realtime;
use crate::replay::ReplayEngine;
use crate::store::Storage;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Storage,
    pub cache: Arc<DistributedCache>,
    pub hub: Arc<Hub>,
    pub pipeline: Arc<Pipeline>,
    pub limiter: Arc<RateLimiter>,
    pub verifier: TokenVerifier,
    pub replay: Arc<ReplayEngine>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(metrics::metrics_handler))
        // Messaging
        .route("/v1/messages", post(handlers::messages::send_message))
        .route("/v1/messages/read", post(handlers::messages::mark_read))
        .route(
            "/v1/messages/conversation/{id}",
            get(handlers::messages::list_conversation_messages),
        )
        .route(
            "/v1/messages/{id}",
            delete(handlers::messages::delete_message),
        )
        // Conversations
        .route(
            "/v1/conversations",
            post(handlers::conversations::create_conversation),
        )
        .route(
            "/v1/conversations/{id}",
            get(handlers::conversations::get_conversation),
        )
        .route(
            "/v1/conversations/{id}/participants",
            post(handlers::conversations::add_participant),
        )
        .route(
            "/v1/conversations/{id}/participants/{user_id}",
            delete(handlers::conversations::remove_participant),
        )
        .route(
            "/v1/conversations/{id}/leave",
            post(handlers::conversations::leave_conversation),
        )
        // Push channel
        .route("/ws", get(realtime::ws_connect))
        .layer(TraceLayer::new_for_http())
        // Browser clients authenticate with bearer tokens, not cookies, so
        // a permissive policy is safe here.
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(middleware::logging::request_log))
        .with_state(state)
}
