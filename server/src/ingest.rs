//! Message ingest pipeline.
//!
//! `send` is the single public operation: validate, authorize against the
//! cached participant set, rate limit, append through the sequencing store,
//! then emit `MessagePersisted` to the hub. Emission is fire-and-forget;
//! ingest success never depends on fan-out.

use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::cache::DistributedCache;
use crate::error::{retry_transient, ApiError};
use crate::hub::{ConversationEvents, MessagePersisted};
use crate::models::{
    MessageType, Participant, MAX_IDEMPOTENCY_KEY_BYTES, MAX_PAYLOAD_BYTES,
};
use crate::rate_limit::{IdentifierKind, RateLimiter, Route};
use crate::store::{
    ConversationsRead, ConversationsWrite, MessageDraft, MessagesWrite, Storage,
};

/// Participant sets are hot on the send path; cached briefly with
/// invalidation on membership writes.
const PARTICIPANTS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Bounded internal retries for transient append failures (the store itself
/// already retries seq conflicts).
const APPEND_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SendCommand {
    pub conversation_id: String,
    pub sender_id: String,
    pub message_type: String,
    /// base64url ciphertext.
    pub encrypted_content: String,
    pub payload_size_bytes: i64,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    /// True on idempotent replay; the handler answers 200 instead of 201.
    pub replayed: bool,
}

pub struct Pipeline {
    storage: Storage,
    cache: Arc<DistributedCache>,
    limiter: Arc<RateLimiter>,
    events: Arc<dyn ConversationEvents>,
}

impl Pipeline {
    pub fn new(
        storage: Storage,
        cache: Arc<DistributedCache>,
        limiter: Arc<RateLimiter>,
        events: Arc<dyn ConversationEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            cache,
            limiter,
            events,
        })
    }

    pub async fn send(
        &self,
        command: SendCommand,
        auth: &AuthContext,
    ) -> Result<SendReceipt, ApiError> {
        // 1. Validation.
        let message_type = MessageType::parse(&command.message_type)
            .ok_or_else(|| ApiError::Validation(format!("unknown type '{}'", command.message_type)))?;
        let conversation_id = Uuid::parse_str(&command.conversation_id)
            .map_err(|_| ApiError::Validation("conversationId is not a UUID".to_string()))?;
        let sender_id = Uuid::parse_str(&command.sender_id)
            .map_err(|_| ApiError::Validation("senderId is not a UUID".to_string()))?;
        if let Some(key) = &command.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
                return Err(ApiError::Validation(format!(
                    "idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_BYTES} bytes"
                )));
            }
        }
        let encrypted_content = decode_base64url(&command.encrypted_content)
            .ok_or_else(|| ApiError::Validation("encryptedContent is not base64url".to_string()))?;
        if encrypted_content.len() > MAX_PAYLOAD_BYTES {
            return Err(ApiError::PayloadTooLarge {
                size: encrypted_content.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        if command.payload_size_bytes != encrypted_content.len() as i64 {
            return Err(ApiError::Validation(
                "payloadSizeBytes does not match encryptedContent".to_string(),
            ));
        }

        // 2. AuthZ: the sender is the caller and a current participant.
        if sender_id != auth.account_id {
            return Err(ApiError::Forbidden(
                "senderId does not match the authenticated account".to_string(),
            ));
        }
        let participants = self.participants(conversation_id).await?;
        let is_member = participants
            .iter()
            .any(|p| p.user_id == sender_id && p.is_active());
        if !is_member {
            return Err(ApiError::Forbidden(
                "sender is not a participant of the conversation".to_string(),
            ));
        }

        // 3. Rate limit on every identity dimension.
        let device_id = auth.require_device()?;
        let session_id = auth.require_session()?;
        let account = auth.account_id.to_string();
        let decision = self
            .limiter
            .check(
                Route::Send,
                &[
                    (IdentifierKind::Account, account.as_str()),
                    (IdentifierKind::Device, device_id),
                    (IdentifierKind::Session, session_id),
                ],
            )
            .await;
        if !decision.allowed {
            return Err(ApiError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }

        // 4 + 5. Idempotency lookup and sequenced append share one atomic
        // unit inside the store.
        let draft = MessageDraft {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            message_type,
            encrypted_content,
            payload_size_bytes: command.payload_size_bytes,
        };
        let key = command.idempotency_key.clone();
        let messages = self.storage.messages_write.clone();
        let outcome = retry_transient("message_append", APPEND_ATTEMPTS, || {
            let draft = draft.clone();
            let key = key.clone();
            let messages = messages.clone();
            async move {
                messages
                    .append(draft, key.as_deref())
                    .await
                    .map_err(ApiError::from)
            }
        })
        .await?;

        // 6. Fan-out, detached from the response path. An idempotent replay
        // emits nothing.
        if !outcome.replayed {
            metrics::counter!("messages_ingested_total", 1);
            let subscribers: Vec<Uuid> = participants
                .iter()
                .filter(|p| p.is_active())
                .map(|p| p.user_id)
                .collect();
            let event = MessagePersisted {
                message: outcome.message.clone(),
                subscribers,
                sender_device: Some(device_id.to_string()),
            };
            let events = self.events.clone();
            tokio::spawn(async move {
                events.message_persisted(event).await;
            });

            let storage = self.storage.clone();
            let message = outcome.message.clone();
            tokio::spawn(async move {
                if let Err(e) = storage
                    .conversations_write
                    .set_last_message(message.conversation_id, &message)
                    .await
                {
                    tracing::warn!(error = %e, "last-message denormalization failed");
                }
            });
        }

        Ok(SendReceipt {
            message_id: outcome.message.id,
            seq: outcome.message.seq,
            created_at: outcome.message.created_at,
            replayed: outcome.replayed,
        })
    }

    /// Participant set via cache read-through with store fallback.
    pub async fn participants(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Participant>, ApiError> {
        let key = participants_cache_key(conversation_id);
        if let Some(cached) = self.cache.get::<Vec<Participant>>(&key).await {
            return Ok(cached);
        }

        let conversation = self
            .storage
            .conversations_read
            .get(conversation_id)
            .await?
            .filter(|c| c.deleted_at.is_none())
            .ok_or_else(|| ApiError::NotFound("conversation not found".to_string()))?;
        let participants = self
            .storage
            .conversations_read
            .participants(conversation.id)
            .await?;

        self.cache
            .set(&key, &participants, PARTICIPANTS_CACHE_TTL)
            .await;
        Ok(participants)
    }

    /// Called by every membership write path.
    pub async fn invalidate_participants(&self, conversation_id: Uuid) {
        self.cache
            .delete(&participants_cache_key(conversation_id))
            .await;
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

fn participants_cache_key(conversation_id: Uuid) -> String {
    format!("conv:participants:{conversation_id}")
}

fn decode_base64url(raw: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE
        .decode(raw)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(raw))
        .ok()
}
