//! Postgres adapter.
//!
//! The append path commits the seq computation, the idempotency reservation,
//! and the message insert as one transaction. Concurrent writers to the same
//! conversation race on the `(conversation_id, seq)` unique index; the loser
//! retries with a fresh seq up to [`SEQUENCER_ATTEMPTS`] times.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use std::borrow::Cow;
use std::time::Duration;
use uuid::Uuid;

use super::{
    idempotency_ttl, validate_new_conversation, AppendOutcome, ConversationsRead,
    ConversationsWrite, ListCursor, MessageDraft, MessageFilter, MessagePage, MessagesRead,
    MessagesWrite, NewConversation, StoreError, SEQUENCER_ATTEMPTS,
};
use crate::models::{
    Conversation, ConversationSettings, ConversationType, Message, MessageStatus, Participant,
    ParticipantRole,
};

const UNIQUE_VIOLATION: &str = "23505";
const SEQ_CONSTRAINT: &str = "messages_conversation_id_seq_key";
const IDEMPOTENCY_CONSTRAINT: &str = "message_idempotency_pkey";

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/courier".to_string()),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: DbConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    message_type: String,
    encrypted_content: Vec<u8>,
    payload_size_bytes: i64,
    seq: i64,
    status: String,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, StoreError> {
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            message_type: crate::models::MessageType::parse(&row.message_type)
                .ok_or_else(|| StoreError::Invalid(format!("bad message_type {}", row.message_type)))?,
            encrypted_content: row.encrypted_content,
            payload_size_bytes: row.payload_size_bytes,
            seq: row.seq,
            status: MessageStatus::parse(&row.status)
                .ok_or_else(|| StoreError::Invalid(format!("bad status {}", row.status)))?,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            deleted_at: row.deleted_at,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, message_type, encrypted_content, \
     payload_size_bytes, seq, status, created_at, delivered_at, read_at, deleted_at";

fn internal(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Internal(anyhow::Error::new(e).context(context))
}

fn constraint_of(err: &sqlx::Error) -> Option<(Cow<'_, str>, Option<&str>)> {
    err.as_database_error()
        .filter(|db| db.code() == Some(Cow::Borrowed(UNIQUE_VIOLATION)))
        .map(|db| (Cow::Borrowed(UNIQUE_VIOLATION), db.constraint()))
}

#[async_trait]
impl MessagesRead for PgStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal("Failed to fetch message"))?;
        row.map(Message::try_from).transpose()
    }

    async fn list(
        &self,
        filter: &MessageFilter,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<MessagePage, StoreError> {
        let after = cursor.map(ListCursor::decode).transpose()?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE TRUE"
        ));
        if let Some(conversation_id) = filter.conversation_id {
            builder.push(" AND conversation_id = ").push_bind(conversation_id);
        }
        if let Some(sender_id) = filter.sender_id {
            builder.push(" AND sender_id = ").push_bind(sender_id);
        }
        if let Some(message_type) = filter.message_type {
            builder
                .push(" AND message_type = ")
                .push_bind(message_type.as_str());
        }
        if let Some(before) = filter.before {
            builder.push(" AND created_at < ").push_bind(before);
        }
        if let Some(after_ts) = filter.after {
            builder.push(" AND created_at > ").push_bind(after_ts);
        }
        if !filter.include_deleted {
            builder.push(" AND deleted_at IS NULL");
        }
        if let Some(c) = after {
            builder
                .push(" AND (created_at, id) > (")
                .push_bind(c.created_at)
                .push(", ")
                .push_bind(c.id)
                .push(")");
        }
        builder
            .push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(limit as i64 + 1);

        let rows: Vec<MessageRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(internal("Failed to list messages"))?;

        let has_more = rows.len() > limit as usize;
        let mut items = rows
            .into_iter()
            .take(limit as usize)
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = if has_more {
            items.last().map(|m| {
                ListCursor {
                    created_at: m.created_at,
                    id: m.id,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(MessagePage { items, next_cursor })
    }

    async fn tip_seq(&self, conversation_id: Uuid) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT CAST(COALESCE(MAX(seq), 0) AS BIGINT) FROM messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(internal("Failed to read tip seq"))
    }

    async fn seq_range(
        &self,
        conversation_id: Uuid,
        after: i64,
        up_to: i64,
        batch: u16,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 AND seq > $2 AND seq <= $3 \
             ORDER BY seq ASC LIMIT $4"
        ))
        .bind(conversation_id)
        .bind(after)
        .bind(up_to)
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(internal("Failed to read seq range"))?;
        rows.into_iter().map(Message::try_from).collect()
    }
}

#[async_trait]
impl MessagesWrite for PgStore {
    async fn append(
        &self,
        draft: MessageDraft,
        idempotency_key: Option<&str>,
    ) -> Result<AppendOutcome, StoreError> {
        for attempt in 0..SEQUENCER_ATTEMPTS {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(internal("Failed to begin transaction"))?;

            if let Some(key) = idempotency_key {
                let existing: Option<Uuid> = sqlx::query_scalar(
                    "SELECT message_id FROM message_idempotency \
                     WHERE sender_id = $1 AND key = $2 AND expires_at > NOW()",
                )
                .bind(draft.sender_id)
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal("Failed to check idempotency key"))?;

                if let Some(message_id) = existing {
                    tx.rollback().await.ok();
                    let message = self
                        .find_by_id(message_id)
                        .await?
                        .ok_or(StoreError::NotFound)?;
                    return Ok(AppendOutcome {
                        message,
                        replayed: true,
                    });
                }
            }

            let seq: i64 = sqlx::query_scalar(
                "SELECT CAST(COALESCE(MAX(seq), 0) + 1 AS BIGINT) FROM messages WHERE conversation_id = $1",
            )
            .bind(draft.conversation_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal("Failed to compute next seq"))?;

            let now = Utc::now();
            let insert = sqlx::query_as::<_, MessageRow>(&format!(
                "INSERT INTO messages ( \
                     id, conversation_id, sender_id, message_type, encrypted_content, \
                     payload_size_bytes, seq, status, created_at \
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'sent', $8) \
                 RETURNING {MESSAGE_COLUMNS}"
            ))
            .bind(draft.id)
            .bind(draft.conversation_id)
            .bind(draft.sender_id)
            .bind(draft.message_type.as_str())
            .bind(&draft.encrypted_content)
            .bind(draft.payload_size_bytes)
            .bind(seq)
            .bind(now)
            .fetch_one(&mut *tx)
            .await;

            let row = match insert {
                Ok(row) => row,
                Err(e) => {
                    tx.rollback().await.ok();
                    match constraint_of(&e) {
                        Some((_, Some(SEQ_CONSTRAINT))) => {
                            // Lost the race for this seq; take a fresh one.
                            tracing::debug!(
                                attempt,
                                error = %StoreError::DuplicateSeq(draft.conversation_id),
                                "retrying append"
                            );
                            continue;
                        }
                        _ => return Err(internal("Failed to insert message")(e)),
                    }
                }
            };

            if let Some(key) = idempotency_key {
                let reserve = sqlx::query(
                    "INSERT INTO message_idempotency (sender_id, key, message_id, expires_at) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(draft.sender_id)
                .bind(key)
                .bind(draft.id)
                .bind(now + idempotency_ttl())
                .execute(&mut *tx)
                .await;

                if let Err(e) = reserve {
                    tx.rollback().await.ok();
                    if matches!(constraint_of(&e), Some((_, Some(IDEMPOTENCY_CONSTRAINT)))) {
                        // A concurrent writer reserved the key first; theirs wins.
                        let message_id: Option<Uuid> = sqlx::query_scalar(
                            "SELECT message_id FROM message_idempotency \
                             WHERE sender_id = $1 AND key = $2",
                        )
                        .bind(draft.sender_id)
                        .bind(key)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(internal("Failed to fetch winning idempotency row"))?;
                        if let Some(message_id) = message_id {
                            let message = self
                                .find_by_id(message_id)
                                .await?
                                .ok_or(StoreError::NotFound)?;
                            return Ok(AppendOutcome {
                                message,
                                replayed: true,
                            });
                        }
                    }
                    return Err(internal("Failed to reserve idempotency key")(e));
                }
            }

            tx.commit()
                .await
                .map_err(internal("Failed to commit append"))?;

            return Ok(AppendOutcome {
                message: Message::try_from(row)?,
                replayed: false,
            });
        }

        Err(StoreError::SequencerContention(SEQUENCER_ATTEMPTS))
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(internal("Failed to soft delete message"))?;

        if result.rows_affected() == 0 && self.find_by_id(id).await?.is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(internal("Failed to begin transaction"))?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM messages WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal("Failed to lock message row"))?;
        let current = current.ok_or(StoreError::NotFound)?;
        let current = MessageStatus::parse(&current)
            .ok_or_else(|| StoreError::Invalid(format!("bad status {current}")))?;

        if !current.can_transition_to(status) {
            return Err(StoreError::Invalid(format!(
                "cannot move status {} -> {}",
                current.as_str(),
                status.as_str()
            )));
        }

        sqlx::query(
            "UPDATE messages SET status = $2, \
                 delivered_at = CASE WHEN $2 IN ('delivered', 'read') THEN COALESCE(delivered_at, $3) ELSE delivered_at END, \
                 read_at = CASE WHEN $2 = 'read' THEN $3 ELSE read_at END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(internal("Failed to update status"))?;

        tx.commit()
            .await
            .map_err(internal("Failed to commit status update"))
    }

    async fn mark_many_read(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE messages SET status = 'read', read_at = $2, \
                 delivered_at = COALESCE(delivered_at, $2) \
             WHERE id = ANY($1) AND status IN ('pending', 'sent', 'delivered')",
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(internal("Failed to mark messages read"))?;
        Ok(result.rows_affected())
    }

    async fn sweep_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM message_idempotency WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(internal("Failed to sweep idempotency table"))?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    conversation_type: String,
    who_can_add_participants: String,
    last_message_id: Option<Uuid>,
    last_message_preview: Option<String>,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(row: ConversationRow) -> Result<Self, StoreError> {
        Ok(Conversation {
            id: row.id,
            conversation_type: ConversationType::parse(&row.conversation_type).ok_or_else(
                || StoreError::Invalid(format!("bad conversation_type {}", row.conversation_type)),
            )?,
            settings: ConversationSettings {
                who_can_add_participants: ParticipantRole::parse(&row.who_can_add_participants)
                    .ok_or_else(|| {
                        StoreError::Invalid(format!(
                            "bad who_can_add_participants {}",
                            row.who_can_add_participants
                        ))
                    })?,
            },
            last_message_id: row.last_message_id,
            last_message_preview: row.last_message_preview,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    conversation_id: Uuid,
    user_id: Uuid,
    role: String,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
    last_read_at: Option<DateTime<Utc>>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = StoreError;

    fn try_from(row: ParticipantRow) -> Result<Self, StoreError> {
        Ok(Participant {
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            role: ParticipantRole::parse(&row.role)
                .ok_or_else(|| StoreError::Invalid(format!("bad role {}", row.role)))?,
            joined_at: row.joined_at,
            left_at: row.left_at,
            last_read_at: row.last_read_at,
        })
    }
}

const CONVERSATION_COLUMNS: &str = "id, conversation_type, who_can_add_participants, \
     last_message_id, last_message_preview, last_message_at, created_at, deleted_at";

#[async_trait]
impl ConversationsRead for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal("Failed to fetch conversation"))?;
        row.map(Conversation::try_from).transpose()
    }

    async fn participants(&self, id: Uuid) -> Result<Vec<Participant>, StoreError> {
        let rows = sqlx::query_as::<_, ParticipantRow>(
            "SELECT conversation_id, user_id, role, joined_at, left_at, last_read_at \
             FROM participants WHERE conversation_id = $1 ORDER BY joined_at ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(internal("Failed to fetch participants"))?;
        rows.into_iter().map(Participant::try_from).collect()
    }

    async fn is_active_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM participants \
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(internal("Failed to check membership"))?;
        Ok(count > 0)
    }

    async fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        sqlx::query_scalar(
            "SELECT c.id FROM conversations c \
             INNER JOIN participants p ON c.id = p.conversation_id \
             WHERE p.user_id = $1 AND p.left_at IS NULL AND c.deleted_at IS NULL \
             ORDER BY c.created_at DESC LIMIT 1000",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(internal("Failed to list conversations for user"))
    }
}

#[async_trait]
impl ConversationsWrite for PgStore {
    async fn create(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        validate_new_conversation(&new)?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(internal("Failed to begin transaction"))?;

        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "INSERT INTO conversations (id, conversation_type, who_can_add_participants, created_at) \
             VALUES ($1, $2, $3, $4) RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(new.conversation_type.as_str())
        .bind(new.settings.who_can_add_participants.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(internal("Failed to insert conversation"))?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO participants (conversation_id, user_id, role, joined_at) ",
        );
        builder.push_values(new.participants.iter(), |mut b, (user_id, role)| {
            b.push_bind(id)
                .push_bind(user_id)
                .push_bind(role.as_str())
                .push_bind(now);
        });
        builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(internal("Failed to insert participants"))?;

        tx.commit()
            .await
            .map_err(internal("Failed to commit conversation"))?;
        Conversation::try_from(row)
    }

    async fn add_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conversation = self.get(id).await?.ok_or(StoreError::NotFound)?;
        if conversation.conversation_type == ConversationType::Direct {
            return Err(StoreError::Invalid(
                "direct conversations are immutable in membership".to_string(),
            ));
        }

        let result = sqlx::query(
            "INSERT INTO participants (conversation_id, user_id, role, joined_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (conversation_id, user_id) DO UPDATE \
                 SET left_at = NULL, role = EXCLUDED.role, joined_at = EXCLUDED.joined_at \
                 WHERE participants.left_at IS NOT NULL",
        )
        .bind(id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(internal("Failed to add participant"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Invalid("already a participant".to_string()));
        }
        Ok(())
    }

    async fn remove_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conversation = self.get(id).await?.ok_or(StoreError::NotFound)?;
        if conversation.conversation_type == ConversationType::Direct {
            return Err(StoreError::Invalid(
                "direct conversations are immutable in membership".to_string(),
            ));
        }

        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM participants \
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal("Failed to fetch participant role"))?;
        let role = role.ok_or(StoreError::NotFound)?;
        if role == ParticipantRole::Owner.as_str() {
            return Err(StoreError::Invalid("owners cannot be removed".to_string()));
        }

        sqlx::query(
            "UPDATE participants SET left_at = $3 \
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(internal("Failed to remove participant"))?;
        Ok(())
    }

    async fn set_last_message(&self, id: Uuid, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE conversations SET last_message_id = $2, last_message_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(message.id)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(internal("Failed to update last message"))?;
        Ok(())
    }

    async fn touch_last_read(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE participants SET last_read_at = $3 \
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(internal("Failed to update last read"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
