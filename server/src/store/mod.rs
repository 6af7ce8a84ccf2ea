//! Storage ports, one narrow interface per aggregate.
//!
//! Two adapters implement these contracts: [`memory::MemoryStore`] for tests
//! and development, and [`postgres::PgStore`] for production. Both provide
//! the same guarantees: per-conversation sequence numbers are dense and
//! assigned atomically with the append, idempotency keys are reserved in the
//! same atomic unit, and reads after a successful append observe the message.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{
    Conversation, ConversationSettings, ConversationType, Message, MessageStatus, MessageType,
    Participant, ParticipantRole,
};

/// List page sizes are clamped into this range.
pub const LIST_LIMIT_MIN: u16 = 1;
pub const LIST_LIMIT_MAX: u16 = 200;
pub const LIST_LIMIT_DEFAULT: u16 = 50;

/// Attempts at assigning a fresh seq before giving up on a hot conversation.
pub const SEQUENCER_ATTEMPTS: u32 = 8;

/// Idempotency reservations outlive the request by this long.
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

pub(crate) fn idempotency_ttl() -> chrono::Duration {
    chrono::Duration::hours(IDEMPOTENCY_TTL_HOURS)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("duplicate seq for conversation {0}")]
    DuplicateSeq(Uuid),
    #[error("sequencer contention after {0} attempts")]
    SequencerContention(u32),
    #[error("invalid cursor")]
    InvalidCursor,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for crate::error::ApiError {
    fn from(err: StoreError) -> Self {
        use crate::error::ApiError;
        match err {
            StoreError::NotFound => ApiError::NotFound("not found".to_string()),
            StoreError::DuplicateSeq(id) => {
                ApiError::Conflict(format!("duplicate seq for conversation {id}"))
            }
            StoreError::SequencerContention(_) => ApiError::SequencerContention,
            StoreError::InvalidCursor => ApiError::Validation("invalid cursor".to_string()),
            StoreError::Invalid(message) => ApiError::Validation(message),
            StoreError::Internal(err) => ApiError::Internal(err),
        }
    }
}

pub fn clamp_limit(raw: Option<u16>) -> u16 {
    raw.unwrap_or(LIST_LIMIT_DEFAULT)
        .clamp(LIST_LIMIT_MIN, LIST_LIMIT_MAX)
}

/// What a caller hands to `append`. The store assigns `seq`, `status`, and
/// `created_at`.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: MessageType,
    pub encrypted_content: Vec<u8>,
    pub payload_size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    /// True when an idempotency hit returned the previously stored message.
    pub replayed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub conversation_id: Option<Uuid>,
    pub sender_id: Option<Uuid>,
    pub message_type: Option<MessageType>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// Opaque list cursor encoding the last emitted `(created_at, id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl ListCursor {
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.timestamp_micros(), self.id);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(token: &str) -> Result<Self, StoreError> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| StoreError::InvalidCursor)?;
        let raw = String::from_utf8(raw).map_err(|_| StoreError::InvalidCursor)?;
        let (micros, id) = raw.split_once('|').ok_or(StoreError::InvalidCursor)?;
        let micros: i64 = micros.parse().map_err(|_| StoreError::InvalidCursor)?;
        let created_at =
            DateTime::<Utc>::from_timestamp_micros(micros).ok_or(StoreError::InvalidCursor)?;
        let id = Uuid::parse_str(id).map_err(|_| StoreError::InvalidCursor)?;
        Ok(Self { created_at, id })
    }
}

#[async_trait]
pub trait MessagesRead: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Page through messages ordered by `(created_at, id)` ascending.
    async fn list(
        &self,
        filter: &MessageFilter,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<MessagePage, StoreError>;

    /// Highest assigned seq for a conversation; 0 when empty.
    async fn tip_seq(&self, conversation_id: Uuid) -> Result<i64, StoreError>;

    /// Messages with `seq ∈ (after, up_to]`, ascending, at most `batch` rows.
    async fn seq_range(
        &self,
        conversation_id: Uuid,
        after: i64,
        up_to: i64,
        batch: u16,
    ) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait MessagesWrite: Send + Sync {
    /// Append a message, assigning the next dense seq atomically. When
    /// `idempotency_key` is present and already reserved by this sender the
    /// stored message is returned with `replayed = true` and nothing is
    /// written.
    async fn append(
        &self,
        draft: MessageDraft,
        idempotency_key: Option<&str>,
    ) -> Result<AppendOutcome, StoreError>;

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Monotonic status advance; a backwards transition is `Invalid`.
    async fn mark_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Batch read-mark; unknown ids are skipped. Returns rows updated.
    async fn mark_many_read(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Drop expired idempotency reservations. Returns rows removed.
    async fn sweep_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conversation_type: ConversationType,
    pub settings: ConversationSettings,
    /// `(user, role)` pairs; exactly one owner, direct = exactly two users.
    pub participants: Vec<(Uuid, ParticipantRole)>,
}

#[async_trait]
pub trait ConversationsRead: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn participants(&self, id: Uuid) -> Result<Vec<Participant>, StoreError>;

    async fn is_active_participant(&self, id: Uuid, user_id: Uuid)
        -> Result<bool, StoreError>;

    /// Conversations where the user is an active participant.
    async fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
pub trait ConversationsWrite: Send + Sync {
    async fn create(&self, new: NewConversation) -> Result<Conversation, StoreError>;

    /// Re-adding a previously left user clears `left_at`. Direct
    /// conversations are immutable in membership.
    async fn add_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Owners cannot be removed.
    async fn remove_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_last_message(&self, id: Uuid, message: &Message) -> Result<(), StoreError>;

    async fn touch_last_read(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Facade bundling the per-aggregate ports; cheap to clone.
#[derive(Clone)]
pub struct Storage {
    pub messages_read: Arc<dyn MessagesRead>,
    pub messages_write: Arc<dyn MessagesWrite>,
    pub conversations_read: Arc<dyn ConversationsRead>,
    pub conversations_write: Arc<dyn ConversationsWrite>,
}

impl Storage {
    pub fn memory() -> Self {
        let store = Arc::new(memory::MemoryStore::new());
        Self {
            messages_read: store.clone(),
            messages_write: store.clone(),
            conversations_read: store.clone(),
            conversations_write: store,
        }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.storage_driver {
            crate::config::StorageDriver::Memory => Ok(Self::memory()),
            crate::config::StorageDriver::Postgres => {
                let Some(database_url) = config.database_url.clone() else {
                    anyhow::bail!("the postgres driver requires DATABASE_URL");
                };
                let db_config = postgres::DbConfig {
                    database_url,
                    ..Default::default()
                };
                let store = Arc::new(postgres::PgStore::connect(db_config).await?);
                Ok(Self {
                    messages_read: store.clone(),
                    messages_write: store.clone(),
                    conversations_read: store.clone(),
                    conversations_write: store,
                })
            }
        }
    }
}

pub(crate) fn validate_new_conversation(new: &NewConversation) -> Result<(), StoreError> {
    let owners = new
        .participants
        .iter()
        .filter(|(_, role)| *role == ParticipantRole::Owner)
        .count();
    if owners != 1 {
        return Err(StoreError::Invalid(format!(
            "expected exactly one owner, got {owners}"
        )));
    }
    let mut users: Vec<Uuid> = new.participants.iter().map(|(u, _)| *u).collect();
    users.sort();
    users.dedup();
    if users.len() != new.participants.len() {
        return Err(StoreError::Invalid("duplicate participants".to_string()));
    }
    if new.conversation_type == ConversationType::Direct && new.participants.len() != 2 {
        return Err(StoreError::Invalid(
            "direct conversations have exactly two participants".to_string(),
        ));
    }
    Ok(())
}
