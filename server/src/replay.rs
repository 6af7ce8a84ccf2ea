//! Gap replay for resuming devices.
//!
//! For each subscribed conversation the engine snapshots the tip, then
//! streams `seq ∈ (ackedCursor, tip]` from the store in ascending batches.
//! Anything persisted after the snapshot is live traffic and belongs to the
//! session's post-replay stream; the two never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::Message;
use crate::store::{MessagesRead, StoreError};

pub const REPLAY_BATCH: u16 = 200;
pub const REPLAY_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replay_count: u64,
    pub batches: u64,
}

pub struct ReplayEngine {
    messages: Arc<dyn MessagesRead>,
}

impl ReplayEngine {
    pub fn new(messages: Arc<dyn MessagesRead>) -> Self {
        Self { messages }
    }

    /// Tip seq per conversation, taken once at resume start.
    pub async fn snapshot_tips(
        &self,
        subscriptions: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, StoreError> {
        let mut tips = HashMap::with_capacity(subscriptions.len());
        for conversation_id in subscriptions {
            tips.insert(
                *conversation_id,
                self.messages.tip_seq(*conversation_id).await?,
            );
        }
        Ok(tips)
    }

    /// Stream every missed message into `sink` in ascending per-conversation
    /// seq order. Returns the totals for `ws_replay_complete`.
    pub async fn run(
        &self,
        cursors: &HashMap<Uuid, i64>,
        tips: &HashMap<Uuid, i64>,
        sink: &mpsc::Sender<Message>,
    ) -> Result<ReplaySummary, StoreError> {
        let mut summary = ReplaySummary::default();

        for (&conversation_id, &tip) in tips {
            let mut cursor = cursors.get(&conversation_id).copied().unwrap_or(0);
            while cursor < tip {
                let batch = tokio::time::timeout(
                    REPLAY_BATCH_TIMEOUT,
                    self.messages
                        .seq_range(conversation_id, cursor, tip, REPLAY_BATCH),
                )
                .await
                .map_err(|_| {
                    StoreError::Internal(anyhow::anyhow!(
                        "replay batch timed out for conversation {conversation_id}"
                    ))
                })??;

                if batch.is_empty() {
                    // Holes cannot exist on the persisted side; an empty
                    // batch below the tip means the snapshot raced a purge.
                    break;
                }

                summary.batches += 1;
                for message in batch {
                    cursor = message.seq;
                    summary.replay_count += 1;
                    if sink.send(message).await.is_err() {
                        return Err(StoreError::Internal(anyhow::anyhow!(
                            "replay sink closed mid-stream"
                        )));
                    }
                }
            }
        }

        metrics::counter!("messages_replayed_total", summary.replay_count);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageType;
    use crate::store::{MessageDraft, MessagesWrite, Storage};

    async fn seed(storage: &Storage, conversation_id: Uuid, count: usize) {
        let sender = Uuid::new_v4();
        for _ in 0..count {
            storage
                .messages_write
                .append(
                    MessageDraft {
                        id: Uuid::new_v4(),
                        conversation_id,
                        sender_id: sender,
                        message_type: MessageType::Text,
                        encrypted_content: b"x".to_vec(),
                        payload_size_bytes: 1,
                    },
                    None,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn replays_exactly_the_gap_in_order() {
        let storage = Storage::memory();
        let conversation = Uuid::new_v4();
        seed(&storage, conversation, 8).await;

        let engine = ReplayEngine::new(storage.messages_read.clone());
        let tips = engine.snapshot_tips(&[conversation]).await.unwrap();
        assert_eq!(tips[&conversation], 8);

        let cursors = HashMap::from([(conversation, 5i64)]);
        let (tx, mut rx) = mpsc::channel(16);
        let summary = engine.run(&cursors, &tips, &tx).await.unwrap();
        drop(tx);

        let mut seqs = Vec::new();
        while let Some(message) = rx.recv().await {
            seqs.push(message.seq);
        }
        assert_eq!(seqs, vec![6, 7, 8]);
        assert_eq!(summary.replay_count, 3);
        assert_eq!(summary.batches, 1);
    }

    #[tokio::test]
    async fn empty_gap_is_a_noop() {
        let storage = Storage::memory();
        let conversation = Uuid::new_v4();
        seed(&storage, conversation, 4).await;

        let engine = ReplayEngine::new(storage.messages_read.clone());
        let tips = engine.snapshot_tips(&[conversation]).await.unwrap();
        let cursors = HashMap::from([(conversation, 4i64)]);

        let (tx, mut rx) = mpsc::channel(4);
        let summary = engine.run(&cursors, &tips, &tx).await.unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
        assert_eq!(summary, ReplaySummary::default());
    }

    #[tokio::test]
    async fn large_gaps_run_in_batches() {
        let storage = Storage::memory();
        let conversation = Uuid::new_v4();
        seed(&storage, conversation, 450).await;

        let engine = ReplayEngine::new(storage.messages_read.clone());
        let tips = engine.snapshot_tips(&[conversation]).await.unwrap();
        let cursors = HashMap::new();

        let (tx, mut rx) = mpsc::channel(512);
        let summary = engine.run(&cursors, &tips, &tx).await.unwrap();
        drop(tx);

        let mut previous = 0;
        let mut total = 0u64;
        while let Some(message) = rx.recv().await {
            assert_eq!(message.seq, previous + 1, "no duplicates, no gaps");
            previous = message.seq;
            total += 1;
        }
        assert_eq!(total, 450);
        assert_eq!(summary.replay_count, 450);
        assert_eq!(summary.batches, 3);
    }

    #[tokio::test]
    async fn missing_cursor_replays_from_the_beginning() {
        let storage = Storage::memory();
        let conversation = Uuid::new_v4();
        seed(&storage, conversation, 3).await;

        let engine = ReplayEngine::new(storage.messages_read.clone());
        let tips = engine.snapshot_tips(&[conversation]).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        engine.run(&HashMap::new(), &tips, &tx).await.unwrap();
        drop(tx);

        let mut seqs = Vec::new();
        while let Some(message) = rx.recv().await {
            seqs.push(message.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
