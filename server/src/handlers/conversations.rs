//! Conversation and participant endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::hub::Hub;
use crate::ingest::Pipeline;
use crate::models::{
    Conversation, ConversationSettings, ConversationType, Participant, ParticipantRole,
};
use crate::store::{ConversationsRead, ConversationsWrite, NewConversation};

#[derive(Debug, Deserialize)]
pub struct ParticipantSpec {
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    #[serde(rename = "type")]
    pub conversation_type: String,
    pub participants: Vec<ParticipantSpec>,
    pub settings: Option<ConversationSettings>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

impl From<&Participant> for ParticipantView {
    fn from(p: &Participant) -> Self {
        Self {
            user_id: p.user_id,
            role: p.role,
            joined_at: p.joined_at,
            left_at: p.left_at,
            last_read_at: p.last_read_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: Vec<ParticipantView>,
    pub settings: ConversationSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn view(conversation: &Conversation, participants: &[Participant]) -> ConversationView {
    ConversationView {
        id: conversation.id,
        conversation_type: conversation.conversation_type,
        participants: participants.iter().map(ParticipantView::from).collect(),
        settings: conversation.settings.clone(),
        last_message_id: conversation.last_message_id,
        last_message_at: conversation.last_message_at,
        created_at: conversation.created_at,
    }
}

/// POST /v1/conversations
///
/// The caller becomes the owner; listed participants join as members (or the
/// given non-owner role).
pub async fn create_conversation(
    State(pipeline): State<Arc<Pipeline>>,
    State(hub): State<Arc<Hub>>,
    auth: AuthContext,
    body: Result<Json<CreateConversationBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.to_string()))?;

    let conversation_type = ConversationType::parse(&body.conversation_type)
        .ok_or_else(|| ApiError::Validation(format!("unknown type '{}'", body.conversation_type)))?;

    let mut participants = vec![(auth.account_id, ParticipantRole::Owner)];
    for spec in &body.participants {
        if spec.user_id == auth.account_id {
            continue;
        }
        let role = match spec.role.as_deref() {
            None => ParticipantRole::Member,
            Some(raw) => {
                let role = ParticipantRole::parse(raw)
                    .ok_or_else(|| ApiError::Validation(format!("unknown role '{raw}'")))?;
                if role == ParticipantRole::Owner {
                    return Err(ApiError::Validation(
                        "only the creator can be owner".to_string(),
                    ));
                }
                role
            }
        };
        participants.push((spec.user_id, role));
    }

    let conversation = pipeline
        .storage()
        .conversations_write
        .create(NewConversation {
            conversation_type,
            settings: body.settings.unwrap_or_default(),
            participants,
        })
        .await?;
    let members = pipeline
        .storage()
        .conversations_read
        .participants(conversation.id)
        .await?;

    // Live sessions of every initial member start receiving immediately.
    for participant in &members {
        hub.subscribe_account(participant.user_id, conversation.id);
    }

    Ok((StatusCode::CREATED, Json(view(&conversation, &members))))
}

/// GET /v1/conversations/{id}
pub async fn get_conversation(
    State(pipeline): State<Arc<Pipeline>>,
    auth: AuthContext,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    let participants = pipeline.participants(conversation_id).await?;
    let is_member = participants
        .iter()
        .any(|p| p.user_id == auth.account_id && p.is_active());
    if !is_member {
        return Err(ApiError::Forbidden(
            "not a participant of the conversation".to_string(),
        ));
    }

    let conversation = pipeline
        .storage()
        .conversations_read
        .get(conversation_id)
        .await?
        .filter(|c| c.deleted_at.is_none())
        .ok_or_else(|| ApiError::NotFound("conversation not found".to_string()))?;

    Ok(Json(view(&conversation, &participants)))
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantBody {
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    pub role: Option<String>,
}

/// POST /v1/conversations/{id}/participants
pub async fn add_participant(
    State(pipeline): State<Arc<Pipeline>>,
    State(hub): State<Arc<Hub>>,
    auth: AuthContext,
    Path(conversation_id): Path<Uuid>,
    body: Result<Json<AddParticipantBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.to_string()))?;

    let conversation = pipeline
        .storage()
        .conversations_read
        .get(conversation_id)
        .await?
        .filter(|c| c.deleted_at.is_none())
        .ok_or_else(|| ApiError::NotFound("conversation not found".to_string()))?;

    let participants = pipeline.participants(conversation_id).await?;
    let caller = participants
        .iter()
        .find(|p| p.user_id == auth.account_id && p.is_active())
        .ok_or_else(|| {
            ApiError::Forbidden("not a participant of the conversation".to_string())
        })?;
    if caller.role < conversation.settings.who_can_add_participants {
        return Err(ApiError::Forbidden(
            "role not allowed to add participants".to_string(),
        ));
    }

    let role = match body.role.as_deref() {
        None => ParticipantRole::Member,
        Some(raw) => {
            let role = ParticipantRole::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown role '{raw}'")))?;
            if role == ParticipantRole::Owner {
                return Err(ApiError::Validation("cannot add an owner".to_string()));
            }
            role
        }
    };

    pipeline
        .storage()
        .conversations_write
        .add_participant(conversation_id, body.user_id, role, Utc::now())
        .await?;
    pipeline.invalidate_participants(conversation_id).await;
    hub.subscribe_account(body.user_id, conversation_id);

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /v1/conversations/{id}/participants/{userId}
pub async fn remove_participant(
    State(pipeline): State<Arc<Pipeline>>,
    auth: AuthContext,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let participants = pipeline.participants(conversation_id).await?;
    let caller = participants
        .iter()
        .find(|p| p.user_id == auth.account_id && p.is_active())
        .ok_or_else(|| {
            ApiError::Forbidden("not a participant of the conversation".to_string())
        })?;
    // Self-removal is leaving; anything else needs admin.
    if user_id != auth.account_id && caller.role < ParticipantRole::Admin {
        return Err(ApiError::Forbidden(
            "role not allowed to remove participants".to_string(),
        ));
    }

    pipeline
        .storage()
        .conversations_write
        .remove_participant(conversation_id, user_id, Utc::now())
        .await?;
    pipeline.invalidate_participants(conversation_id).await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/conversations/{id}/leave
pub async fn leave_conversation(
    State(pipeline): State<Arc<Pipeline>>,
    auth: AuthContext,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    pipeline
        .storage()
        .conversations_write
        .remove_participant(conversation_id, auth.account_id, Utc::now())
        .await?;
    pipeline.invalidate_participants(conversation_id).await;
    Ok(StatusCode::NO_CONTENT)
}
