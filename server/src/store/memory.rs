//! In-memory adapter, the dev/test driver.
//!
//! Holds everything behind one `RwLock`, which makes each append naturally
//! atomic: the seq assignment, the idempotency reservation, and the insert
//! happen under a single write guard. Deterministic enough to drive the unit
//! and scenario suites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    idempotency_ttl, validate_new_conversation, AppendOutcome, ConversationsRead,
    ConversationsWrite, ListCursor, MessageDraft, MessageFilter, MessagePage, MessagesRead,
    MessagesWrite, NewConversation, StoreError,
};
use crate::models::{
    Conversation, ConversationType, Message, MessageStatus, Participant, ParticipantRole,
};

#[derive(Debug, Clone)]
struct IdempotencyRecord {
    message_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<Uuid, Message>,
    /// Message ids per conversation in seq order; length == tip seq.
    by_conversation: HashMap<Uuid, Vec<Uuid>>,
    idempotency: HashMap<(Uuid, String), IdempotencyRecord>,
    conversations: HashMap<Uuid, Conversation>,
    participants: HashMap<Uuid, Vec<Participant>>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagesRead for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.inner.read().messages.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: &MessageFilter,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<MessagePage, StoreError> {
        let after = cursor.map(ListCursor::decode).transpose()?;
        let inner = self.inner.read();

        let mut items: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| matches_filter(m, filter))
            .filter(|m| match after {
                Some(c) => (m.created_at, m.id) > (c.created_at, c.id),
                None => true,
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        let has_more = items.len() > limit as usize;
        items.truncate(limit as usize);
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
        Ok(self
            .inner
            .read()
            .by_conversation
            .get(&conversation_id)
            .map(|ids| ids.len() as i64)
            .unwrap_or(0))
    }

    async fn seq_range(
        &self,
        conversation_id: Uuid,
        after: i64,
        up_to: i64,
        batch: u16,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_conversation.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        let start = after.max(0) as usize;
        let end = (up_to.max(0) as usize).min(ids.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(ids[start..end]
            .iter()
            .take(batch as usize)
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl MessagesWrite for MemoryStore {
    async fn append(
        &self,
        draft: MessageDraft,
        idempotency_key: Option<&str>,
    ) -> Result<AppendOutcome, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        if let Some(key) = idempotency_key {
            let lookup = (draft.sender_id, key.to_string());
            if let Some(record) = inner.idempotency.get(&lookup) {
                if record.expires_at > now {
                    let message = inner
                        .messages
                        .get(&record.message_id)
                        .cloned()
                        .ok_or(StoreError::NotFound)?;
                    return Ok(AppendOutcome {
                        message,
                        replayed: true,
                    });
                }
            }
        }

        let order = inner
            .by_conversation
            .entry(draft.conversation_id)
            .or_default();
        let seq = order.len() as i64 + 1;
        order.push(draft.id);

        let message = Message {
            id: draft.id,
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            message_type: draft.message_type,
            encrypted_content: draft.encrypted_content,
            payload_size_bytes: draft.payload_size_bytes,
            seq,
            status: MessageStatus::Sent,
            created_at: now,
            delivered_at: None,
            read_at: None,
            deleted_at: None,
        };
        inner.messages.insert(draft.id, message.clone());

        if let Some(key) = idempotency_key {
            inner.idempotency.insert(
                (draft.sender_id, key.to_string()),
                IdempotencyRecord {
                    message_id: draft.id,
                    expires_at: now + idempotency_ttl(),
                },
            );
        }

        Ok(AppendOutcome {
            message,
            replayed: false,
        })
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let message = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;
        if message.deleted_at.is_none() {
            message.deleted_at = Some(at);
        }
        Ok(())
    }

    async fn mark_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let message = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;
        if !message.status.can_transition_to(status) {
            return Err(StoreError::Invalid(format!(
                "cannot move status {} -> {}",
                message.status.as_str(),
                status.as_str()
            )));
        }
        apply_status(message, status, at);
        Ok(())
    }

    async fn mark_many_read(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let mut updated = 0;
        for id in ids {
            if let Some(message) = inner.messages.get_mut(id) {
                if message.status.can_transition_to(MessageStatus::Read) {
                    apply_status(message, MessageStatus::Read, at);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn sweep_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, record| record.expires_at > now);
        Ok((before - inner.idempotency.len()) as u64)
    }
}

fn apply_status(message: &mut Message, status: MessageStatus, at: DateTime<Utc>) {
    message.status = status;
    match status {
        MessageStatus::Delivered => message.delivered_at = Some(at),
        MessageStatus::Read => {
            if message.delivered_at.is_none() {
                message.delivered_at = Some(at);
            }
            message.read_at = Some(at);
        }
        _ => {}
    }
}

fn matches_filter(message: &Message, filter: &MessageFilter) -> bool {
    if let Some(conversation_id) = filter.conversation_id {
        if message.conversation_id != conversation_id {
            return false;
        }
    }
    if let Some(sender_id) = filter.sender_id {
        if message.sender_id != sender_id {
            return false;
        }
    }
    if let Some(message_type) = filter.message_type {
        if message.message_type != message_type {
            return false;
        }
    }
    if let Some(before) = filter.before {
        if message.created_at >= before {
            return false;
        }
    }
    if let Some(after) = filter.after {
        if message.created_at <= after {
            return false;
        }
    }
    if !filter.include_deleted && message.deleted_at.is_some() {
        return false;
    }
    true
}

#[async_trait]
impl ConversationsRead for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.read().conversations.get(&id).cloned())
    }

    async fn participants(&self, id: Uuid) -> Result<Vec<Participant>, StoreError> {
        Ok(self
            .inner
            .read()
            .participants
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_active_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .participants
            .get(&id)
            .map(|list| {
                list.iter()
                    .any(|p| p.user_id == user_id && p.is_active())
            })
            .unwrap_or(false))
    }

    async fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .inner
            .read()
            .participants
            .iter()
            .filter(|(_, list)| {
                list.iter()
                    .any(|p| p.user_id == user_id && p.is_active())
            })
            .map(|(id, _)| *id)
            .collect())
    }
}

#[async_trait]
impl ConversationsWrite for MemoryStore {
    async fn create(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        validate_new_conversation(&new)?;
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            conversation_type: new.conversation_type,
            settings: new.settings,
            last_message_id: None,
            last_message_preview: None,
            last_message_at: None,
            created_at: now,
            deleted_at: None,
        };

        let mut inner = self.inner.write();
        let members = new
            .participants
            .into_iter()
            .map(|(user_id, role)| Participant {
                conversation_id: conversation.id,
                user_id,
                role,
                joined_at: now,
                left_at: None,
                last_read_at: None,
            })
            .collect();
        inner.participants.insert(conversation.id, members);
        inner.conversations.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn add_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let conversation = inner.conversations.get(&id).ok_or(StoreError::NotFound)?;
        if conversation.conversation_type == ConversationType::Direct {
            return Err(StoreError::Invalid(
                "direct conversations are immutable in membership".to_string(),
            ));
        }
        let members = inner.participants.entry(id).or_default();
        if let Some(existing) = members.iter_mut().find(|p| p.user_id == user_id) {
            if existing.is_active() {
                return Err(StoreError::Invalid("already a participant".to_string()));
            }
            existing.left_at = None;
            existing.role = role;
            existing.joined_at = at;
            return Ok(());
        }
        members.push(Participant {
            conversation_id: id,
            user_id,
            role,
            joined_at: at,
            left_at: None,
            last_read_at: None,
        });
        Ok(())
    }

    async fn remove_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let conversation = inner.conversations.get(&id).ok_or(StoreError::NotFound)?;
        if conversation.conversation_type == ConversationType::Direct {
            return Err(StoreError::Invalid(
                "direct conversations are immutable in membership".to_string(),
            ));
        }
        let members = inner
            .participants
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        let member = members
            .iter_mut()
            .find(|p| p.user_id == user_id && p.is_active())
            .ok_or(StoreError::NotFound)?;
        if member.role == ParticipantRole::Owner {
            return Err(StoreError::Invalid("owners cannot be removed".to_string()));
        }
        member.left_at = Some(at);
        Ok(())
    }

    async fn set_last_message(&self, id: Uuid, message: &Message) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let conversation = inner
            .conversations
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        conversation.last_message_id = Some(message.id);
        conversation.last_message_at = Some(message.created_at);
        Ok(())
    }

    async fn touch_last_read(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let members = inner
            .participants
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        let member = members
            .iter_mut()
            .find(|p| p.user_id == user_id && p.is_active())
            .ok_or(StoreError::NotFound)?;
        member.last_read_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationSettings, MessageType};

    fn draft(conversation_id: Uuid, sender_id: Uuid) -> MessageDraft {
        MessageDraft {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            message_type: MessageType::Text,
            encrypted_content: b"opaque".to_vec(),
            payload_size_bytes: 6,
        }
    }

    #[tokio::test]
    async fn seq_is_dense_and_starts_at_one() {
        let store = MemoryStore::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();
        for expected in 1..=5i64 {
            let outcome = store.append(draft(conversation, sender), None).await.unwrap();
            assert_eq!(outcome.message.seq, expected);
        }
        assert_eq!(store.tip_seq(conversation).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn idempotent_append_replays_without_new_seq() {
        let store = MemoryStore::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();

        let first = store
            .append(draft(conversation, sender), Some("key-1"))
            .await
            .unwrap();
        assert!(!first.replayed);

        let second = store
            .append(draft(conversation, sender), Some("key-1"))
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.message.id, first.message.id);
        assert_eq!(second.message.seq, first.message.seq);
        assert_eq!(store.tip_seq(conversation).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_key_different_senders_are_distinct() {
        let store = MemoryStore::new();
        let conversation = Uuid::new_v4();

        let a = store
            .append(draft(conversation, Uuid::new_v4()), Some("shared"))
            .await
            .unwrap();
        let b = store
            .append(draft(conversation, Uuid::new_v4()), Some("shared"))
            .await
            .unwrap();
        assert!(!a.replayed);
        assert!(!b.replayed);
        assert_ne!(a.message.id, b.message.id);
    }

    #[tokio::test]
    async fn seq_range_is_half_open_on_the_left() {
        let store = MemoryStore::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();
        for _ in 0..8 {
            store.append(draft(conversation, sender), None).await.unwrap();
        }

        let range = store.seq_range(conversation, 5, 8, 200).await.unwrap();
        let seqs: Vec<i64> = range.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8]);
    }

    #[tokio::test]
    async fn list_paginates_with_opaque_cursor() {
        let store = MemoryStore::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();
        for _ in 0..7 {
            store.append(draft(conversation, sender), None).await.unwrap();
        }

        let filter = MessageFilter {
            conversation_id: Some(conversation),
            ..Default::default()
        };
        let first = store.list(&filter, None, 3).await.unwrap();
        assert_eq!(first.items.len(), 3);
        let cursor = first.next_cursor.expect("more pages");

        let second = store.list(&filter, Some(&cursor), 3).await.unwrap();
        assert_eq!(second.items.len(), 3);
        // No overlap between pages.
        for item in &second.items {
            assert!(first.items.iter().all(|m| m.id != item.id));
        }

        let cursor = second.next_cursor.expect("one more page");
        let third = store.list(&filter, Some(&cursor), 3).await.unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn soft_deleted_messages_hide_unless_requested() {
        let store = MemoryStore::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let outcome = store.append(draft(conversation, sender), None).await.unwrap();
        store
            .soft_delete(outcome.message.id, Utc::now())
            .await
            .unwrap();

        let filter = MessageFilter {
            conversation_id: Some(conversation),
            ..Default::default()
        };
        assert!(store.list(&filter, None, 10).await.unwrap().items.is_empty());

        let with_deleted = MessageFilter {
            include_deleted: true,
            ..filter
        };
        assert_eq!(store.list(&with_deleted, None, 10).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn status_cannot_move_backwards() {
        let store = MemoryStore::new();
        let conversation = Uuid::new_v4();
        let outcome = store
            .append(draft(conversation, Uuid::new_v4()), None)
            .await
            .unwrap();
        let id = outcome.message.id;

        store
            .mark_status(id, MessageStatus::Delivered, Utc::now())
            .await
            .unwrap();
        store
            .mark_status(id, MessageStatus::Read, Utc::now())
            .await
            .unwrap();
        assert!(store
            .mark_status(id, MessageStatus::Delivered, Utc::now())
            .await
            .is_err());

        let stored = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert!(stored.delivered_at.is_some());
        assert!(stored.read_at.is_some());
    }

    #[tokio::test]
    async fn owner_cannot_be_removed() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();
        let conversation = store
            .create(NewConversation {
                conversation_type: ConversationType::Group,
                settings: ConversationSettings::default(),
                participants: vec![
                    (owner, ParticipantRole::Owner),
                    (member, ParticipantRole::Member),
                ],
            })
            .await
            .unwrap();

        assert!(store
            .remove_participant(conversation.id, owner, Utc::now())
            .await
            .is_err());
        store
            .remove_participant(conversation.id, member, Utc::now())
            .await
            .unwrap();
        assert!(!store
            .is_active_participant(conversation.id, member)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn left_participant_can_be_readded() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();
        let conversation = store
            .create(NewConversation {
                conversation_type: ConversationType::Group,
                settings: ConversationSettings::default(),
                participants: vec![
                    (owner, ParticipantRole::Owner),
                    (member, ParticipantRole::Member),
                ],
            })
            .await
            .unwrap();

        store
            .remove_participant(conversation.id, member, Utc::now())
            .await
            .unwrap();
        store
            .add_participant(conversation.id, member, ParticipantRole::Member, Utc::now())
            .await
            .unwrap();
        assert!(store
            .is_active_participant(conversation.id, member)
            .await
            .unwrap());
    }
}
