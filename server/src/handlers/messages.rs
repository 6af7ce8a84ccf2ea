//! Message endpoints: send, paged conversation history, read marking.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::ingest::{Pipeline, SendCommand};
use crate::models::{Message, MessageStatus, MessageType};
use crate::rate_limit::{IdentifierKind, Route};
use crate::store::{
    clamp_limit, ConversationsWrite, MessageFilter, MessagesRead, MessagesWrite,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Most ids accepted by a single read-mark call.
const MARK_READ_BATCH_MAX: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub encrypted_content: String,
    pub payload_size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub id: Uuid,
    pub seq: i64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// POST /v1/messages
pub async fn send_message(
    State(pipeline): State<Arc<Pipeline>>,
    auth: AuthContext,
    headers: HeaderMap,
    body: Result<Json<SendMessageBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.to_string()))?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let receipt = pipeline
        .send(
            SendCommand {
                conversation_id: body.conversation_id,
                sender_id: body.sender_id,
                message_type: body.message_type,
                encrypted_content: body.encrypted_content,
                payload_size_bytes: body.payload_size_bytes,
                idempotency_key,
            },
            &auth,
        )
        .await?;

    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(SendMessageResponse {
            id: receipt.message_id,
            seq: receipt.seq,
            created_at: receipt.created_at,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub encrypted_content: String,
    pub payload_size_bytes: i64,
    pub seq: i64,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            message_type: message.message_type,
            encrypted_content: base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(&message.encrypted_content),
            payload_size_bytes: message.payload_size_bytes,
            seq: message.seq,
            status: message.status,
            created_at: message.created_at,
            delivered_at: message.delivered_at,
            read_at: message.read_at,
            deleted_at: message.deleted_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u16>,
    pub cursor: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    #[serde(rename = "includeDeleted")]
    pub include_deleted: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct MessagePageResponse {
    pub items: Vec<MessageView>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// GET /v1/messages/conversation/{id}
pub async fn list_conversation_messages(
    State(pipeline): State<Arc<Pipeline>>,
    auth: AuthContext,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<MessagePageResponse>, ApiError> {
    let account = auth.account_id.to_string();
    let decision = pipeline
        .limiter()
        .check(Route::List, &[(IdentifierKind::Account, account.as_str())])
        .await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let participants = pipeline.participants(conversation_id).await?;
    let is_member = participants
        .iter()
        .any(|p| p.user_id == auth.account_id && p.is_active());
    if !is_member {
        return Err(ApiError::Forbidden(
            "not a participant of the conversation".to_string(),
        ));
    }

    let message_type = match &query.message_type {
        Some(raw) => Some(
            MessageType::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown type '{raw}'")))?,
        ),
        None => None,
    };
    let filter = MessageFilter {
        conversation_id: Some(conversation_id),
        sender_id: None,
        message_type,
        before: query.before,
        after: query.after,
        include_deleted: query.include_deleted.unwrap_or(false),
    };

    let page = pipeline
        .storage()
        .messages_read
        .list(&filter, query.cursor.as_deref(), clamp_limit(query.limit))
        .await?;

    Ok(Json(MessagePageResponse {
        items: page.items.iter().map(MessageView::from).collect(),
        next_cursor: page.next_cursor,
    }))
}

/// DELETE /v1/messages/{id}
///
/// Soft delete; only the sender may remove their own message. The row keeps
/// its seq so the per-conversation sequence stays dense.
pub async fn delete_message(
    State(pipeline): State<Arc<Pipeline>>,
    auth: AuthContext,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let message = pipeline
        .storage()
        .messages_read
        .find_by_id(message_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("message not found".to_string()))?;
    if message.sender_id != auth.account_id {
        return Err(ApiError::Forbidden(
            "only the sender can delete a message".to_string(),
        ));
    }

    pipeline
        .storage()
        .messages_write
        .soft_delete(message_id, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MarkReadBody {
    #[serde(rename = "messageIds")]
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub updated: u64,
}

/// POST /v1/messages/read
///
/// Ids outside the caller's conversations are silently skipped.
pub async fn mark_read(
    State(pipeline): State<Arc<Pipeline>>,
    auth: AuthContext,
    body: Result<Json<MarkReadBody>, JsonRejection>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.to_string()))?;
    if body.message_ids.len() > MARK_READ_BATCH_MAX {
        return Err(ApiError::Validation(format!(
            "at most {MARK_READ_BATCH_MAX} message ids per call"
        )));
    }

    let account = auth.account_id.to_string();
    let decision = pipeline
        .limiter()
        .check(Route::Read, &[(IdentifierKind::Account, account.as_str())])
        .await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let mut allowed = Vec::with_capacity(body.message_ids.len());
    let mut conversations_touched = Vec::new();
    for id in body.message_ids {
        let Some(message) = pipeline.storage().messages_read.find_by_id(id).await? else {
            continue;
        };
        let participants = match pipeline.participants(message.conversation_id).await {
            Ok(participants) => participants,
            Err(ApiError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        let is_member = participants
            .iter()
            .any(|p| p.user_id == auth.account_id && p.is_active());
        if is_member {
            allowed.push(id);
            if !conversations_touched.contains(&message.conversation_id) {
                conversations_touched.push(message.conversation_id);
            }
        }
    }

    let now = Utc::now();
    let updated = pipeline
        .storage()
        .messages_write
        .mark_many_read(&allowed, now)
        .await?;
    for conversation_id in conversations_touched {
        // Best-effort read receipt on the membership row.
        let _ = pipeline
            .storage()
            .conversations_write
            .touch_last_read(conversation_id, auth.account_id, now)
            .await;
    }

    Ok(Json(MarkReadResponse { updated }))
}
