//! `/ws` endpoint: WebSocket upgrade into a hub session.
//!
//! A bearer token in the upgrade request authenticates immediately; its
//! absence defers authentication to the session's Handshaking phase, where
//! the client has 10 s to send an `auth` frame (close 4001 on deadline,
//! 4002 on a bad token). A token that is present but invalid still fails
//! the HTTP request with 401 before any upgrade happens.

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{TokenVerifier, DEVICE_ID_HEADER, SESSION_ID_HEADER};
use crate::error::ApiError;
use crate::hub::{session, Hub, MAX_SESSIONS_PER_ACCOUNT};
use crate::replay::ReplayEngine;
use crate::store::Storage;

pub const RESUME_TOKEN_HEADER: &str = "x-resume-token";

/// GET /ws
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    State(storage): State<Storage>,
    State(replay): State<Arc<ReplayEngine>>,
    State(verifier): State<TokenVerifier>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let device_id = required_header(&headers, DEVICE_ID_HEADER)?;
    let session_id = required_header(&headers, SESSION_ID_HEADER)?;

    let authenticated = match bearer(&headers) {
        Some(token) => {
            let claims = verifier.verify(token)?;
            let account_id = Uuid::parse_str(&claims.sub)
                .map_err(|_| ApiError::Auth("token subject is not an account id".to_string()))?;
            if hub.connected_sessions(account_id) >= MAX_SESSIONS_PER_ACCOUNT {
                tracing::warn!(
                    account = %crate::redact::for_log(&account_id.to_string()),
                    sessions = hub.connected_sessions(account_id),
                    "connection limit reached"
                );
                return Err(ApiError::RateLimited {
                    retry_after_secs: 30,
                });
            }
            Some(account_id)
        }
        // Deferred to the Handshaking phase; the session cap is enforced at
        // registration time for these.
        None => None,
    };

    let resume_token = headers
        .get(RESUME_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    tracing::info!(
        device = %crate::redact::for_log(&device_id),
        header_auth = authenticated.is_some(),
        resuming = resume_token.is_some(),
        "websocket upgrade accepted"
    );

    let deps = session::SessionDeps {
        hub,
        storage,
        replay,
        verifier,
    };
    Ok(ws.on_upgrade(move |socket| {
        session::run(
            socket,
            authenticated,
            device_id,
            session_id,
            resume_token,
            deps,
        )
    }))
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Validation(format!("missing {name} header")))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
