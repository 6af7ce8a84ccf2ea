//! Wire frames for the push channel.
//!
//! Outbound frames carry a per-device monotonically increasing `seq`; this is
//! the transport sequence and is distinct from the per-conversation
//! `payload.data.seq` assigned at persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageType};

/// WebSocket close codes.
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const AUTH_TIMEOUT: u16 = 4001;
    pub const AUTH_FAILED: u16 = 4002;
    pub const SLOW_CONSUMER: u16 = 4003;
    pub const HEARTBEAT_LOST: u16 = 4004;
}

/// Message body as delivered to devices. Ciphertext travels base64url.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    #[serde(rename = "messageId")]
    pub message_id: Uuid,
    #[serde(rename = "conversationId")]
    pub conversation_id: Uuid,
    #[serde(rename = "senderId")]
    pub sender_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "encryptedContent")]
    pub encrypted_content: String,
    #[serde(rename = "payloadSizeBytes")]
    pub payload_size_bytes: i64,
    /// Per-conversation sequence.
    pub seq: i64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageData {
    fn from(message: &Message) -> Self {
        use base64::Engine;
        Self {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            message_type: message.message_type,
            encrypted_content: base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(&message.encrypted_content),
            payload_size_bytes: message.payload_size_bytes,
            seq: message.seq,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub data: MessageData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayExpectation {
    pub expected: bool,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Hello {
        #[serde(rename = "serverTime")]
        server_time: DateTime<Utc>,
        #[serde(rename = "resumeToken")]
        resume_token: String,
        replay: ReplayExpectation,
    },
    Message {
        id: Uuid,
        /// Per-device outbound sequence.
        seq: u64,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        replay: bool,
        payload: MessagePayload,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    Event {
        seq: u64,
        name: String,
        #[serde(flatten)]
        data: serde_json::Value,
    },
}

impl ServerFrame {
    pub fn replay_complete(seq: u64, replay_count: u64, batches: u64) -> Self {
        Self::Event {
            seq,
            name: "ws_replay_complete".to_string(),
            data: serde_json::json!({ "replayCount": replay_count, "batches": batches }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Post-upgrade authentication, for clients that cannot attach an
    /// Authorization header to the upgrade request. Must arrive within the
    /// handshake deadline or the connection closes with AUTH_TIMEOUT.
    Auth {
        token: String,
    },
    Ack {
        /// The delivered frame's message id.
        id: Uuid,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Per-conversation seq being acknowledged; implicitly acks below.
        seq: i64,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}
