//! Per-device resume state.
//!
//! The hub owns the live session; this module owns the persisted snapshot
//! that lets a device reconnect without loss. Snapshots live in the cache
//! under `resume:<deviceId>` with a 7-day TTL.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::DistributedCache;
use crate::hub::frames::MessageData;

/// Bound on frames buffered for an offline device. When full, the oldest
/// frame is dropped and `missed` is set so the next resume runs a full
/// gap-based replay.
pub const UNDELIVERED_RING_CAP: usize = 256;

/// Snapshots expire this long after the last persist.
pub const RESUME_STATE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Dirty live sessions are snapshotted this often.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    #[serde(rename = "resumeToken")]
    pub resume_token: String,
    #[serde(rename = "accountId")]
    pub account_id: Uuid,
    pub subscriptions: Vec<Uuid>,
    /// Highest acknowledged per-conversation seq.
    #[serde(rename = "ackedCursors")]
    pub acked_cursors: HashMap<Uuid, i64>,
    pub undelivered: VecDeque<MessageData>,
    pub missed: bool,
}

impl ResumeState {
    pub fn new(resume_token: String, account_id: Uuid, subscriptions: Vec<Uuid>) -> Self {
        Self {
            resume_token,
            account_id,
            subscriptions,
            acked_cursors: HashMap::new(),
            undelivered: VecDeque::new(),
            missed: false,
        }
    }

    /// Acks only move forward.
    pub fn ack(&mut self, conversation_id: Uuid, seq: i64) {
        let cursor = self.acked_cursors.entry(conversation_id).or_insert(0);
        *cursor = (*cursor).max(seq);
    }

    pub fn buffer(&mut self, frame: MessageData) {
        if self.undelivered.len() >= UNDELIVERED_RING_CAP {
            self.undelivered.pop_front();
            self.missed = true;
        }
        self.undelivered.push_back(frame);
    }
}

pub struct ResumeStore {
    cache: Arc<DistributedCache>,
}

impl ResumeStore {
    pub fn new(cache: Arc<DistributedCache>) -> Self {
        Self { cache }
    }

    fn key(device_id: &str) -> String {
        format!("resume:{device_id}")
    }

    pub async fn load(&self, device_id: &str) -> Option<ResumeState> {
        self.cache.get(&Self::key(device_id)).await
    }

    pub async fn persist(&self, device_id: &str, state: &ResumeState) {
        self.cache
            .set(&Self::key(device_id), state, RESUME_STATE_TTL)
            .await;
    }

    pub async fn drop_state(&self, device_id: &str) {
        self.cache.delete(&Self::key(device_id)).await;
    }

    /// Fan-out path for offline devices: load, append to the ring, persist.
    /// Returns false when no snapshot exists for the device.
    pub async fn buffer_undelivered(&self, device_id: &str, frame: MessageData) -> bool {
        let Some(mut state) = self.load(device_id).await else {
            return false;
        };
        state.buffer(frame);
        self.persist(device_id, &state).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{memory::MemoryBackend, CacheBackend};
    use crate::models::MessageType;
    use chrono::Utc;

    fn frame(seq: i64) -> MessageData {
        MessageData {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            message_type: MessageType::Text,
            encrypted_content: "AA".to_string(),
            payload_size_bytes: 1,
            seq,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ring_drops_oldest_and_flags_missed() {
        let mut state = ResumeState::new("t".into(), Uuid::new_v4(), vec![]);
        for seq in 0..UNDELIVERED_RING_CAP as i64 {
            state.buffer(frame(seq));
        }
        assert!(!state.missed);
        assert_eq!(state.undelivered.len(), UNDELIVERED_RING_CAP);

        state.buffer(frame(999));
        assert!(state.missed);
        assert_eq!(state.undelivered.len(), UNDELIVERED_RING_CAP);
        assert_eq!(state.undelivered.front().unwrap().seq, 1);
        assert_eq!(state.undelivered.back().unwrap().seq, 999);
    }

    #[test]
    fn acks_never_move_backwards() {
        let conversation = Uuid::new_v4();
        let mut state = ResumeState::new("t".into(), Uuid::new_v4(), vec![conversation]);
        state.ack(conversation, 5);
        state.ack(conversation, 3);
        assert_eq!(state.acked_cursors[&conversation], 5);
        state.ack(conversation, 8);
        assert_eq!(state.acked_cursors[&conversation], 8);
    }

    #[tokio::test]
    async fn store_round_trip() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let cache = DistributedCache::new("test", backend);
        let store = ResumeStore::new(cache);

        let conversation = Uuid::new_v4();
        let mut state = ResumeState::new("token-1".into(), Uuid::new_v4(), vec![conversation]);
        state.ack(conversation, 12);
        store.persist("device-1", &state).await;

        let loaded = store.load("device-1").await.unwrap();
        assert_eq!(loaded.resume_token, "token-1");
        assert_eq!(loaded.acked_cursors[&conversation], 12);

        store.drop_state("device-1").await;
        assert!(store.load("device-1").await.is_none());
    }

    #[tokio::test]
    async fn buffer_undelivered_requires_existing_snapshot() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let cache = DistributedCache::new("test", backend);
        let store = ResumeStore::new(cache);

        assert!(!store.buffer_undelivered("ghost", frame(1)).await);

        let state = ResumeState::new("t".into(), Uuid::new_v4(), vec![]);
        store.persist("device-2", &state).await;
        assert!(store.buffer_undelivered("device-2", frame(1)).await);
        let loaded = store.load("device-2").await.unwrap();
        assert_eq!(loaded.undelivered.len(), 1);
    }
}
