//! Core domain models shared by the stores, pipeline, and hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard ceiling on opaque ciphertext size.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Longest accepted client idempotency key, in bytes.
pub const MAX_IDEMPOTENCY_KEY_BYTES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    /// Status transitions are monotonic; a message never moves backwards.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// A persisted message. Immutable once appended except for `status`,
/// `deleted_at`, and the delivery/read timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: MessageType,
    /// Opaque ciphertext. Never logged, never indexed, never interpreted.
    pub encrypted_content: Vec<u8>,
    pub payload_size_bytes: i64,
    /// Per-conversation sequence: dense, unique, starts at 1.
    pub seq: i64,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Member,
    Admin,
    Owner,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettings {
    /// Minimum role allowed to add participants to a group conversation.
    #[serde(rename = "whoCanAddParticipants")]
    pub who_can_add_participants: ParticipantRole,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            who_can_add_participants: ParticipantRole::Admin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub conversation_type: ConversationType,
    pub settings: ConversationSettings,
    pub last_message_id: Option<Uuid>,
    /// Opaque client-supplied hint; ciphertext-safe by contract.
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// Participants with `left_at` set are excluded from delivery until
    /// re-added.
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Sent.can_transition_to(Failed));

        assert!(!Read.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Sent));
    }

    #[test]
    fn type_round_trips() {
        for raw in ["text", "image", "file", "system"] {
            assert_eq!(MessageType::parse(raw).unwrap().as_str(), raw);
        }
        assert!(MessageType::parse("video").is_none());
    }

    #[test]
    fn role_ordering_puts_owner_on_top() {
        assert!(ParticipantRole::Owner > ParticipantRole::Admin);
        assert!(ParticipantRole::Admin > ParticipantRole::Member);
    }
}
