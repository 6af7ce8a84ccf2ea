//! Hub + replay scenarios: live fan-out, resume after disconnect, slow
//! consumers. Sessions are driven through the hub registration seam the
//! real WebSocket session uses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use courier_server::auth::AuthContext;
use courier_server::cache::{memory::MemoryBackend, CacheBackend, DistributedCache};
use courier_server::hub::{CloseReason, Hub, SessionEvent, SessionShared, OUTBOUND_QUEUE_CAP};
use courier_server::ingest::{Pipeline, SendCommand};
use courier_server::models::{ConversationSettings, ConversationType, ParticipantRole};
use courier_server::rate_limit::RateLimiter;
use courier_server::replay::ReplayEngine;
use courier_server::resume::{ResumeStore, UNDELIVERED_RING_CAP};
use courier_server::store::{ConversationsWrite, NewConversation, Storage};

struct World {
    storage: Storage,
    hub: Arc<Hub>,
    pipeline: Arc<Pipeline>,
    conversation: Uuid,
    alice: Uuid,
    bob: Uuid,
}

async fn world() -> World {
    let storage = Storage::memory();
    let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
    let cache = DistributedCache::new("test", backend);
    let hub = Hub::new(Arc::new(ResumeStore::new(cache.clone())));
    let limiter = Arc::new(RateLimiter::new(None, true));

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = storage
        .conversations_write
        .create(NewConversation {
            conversation_type: ConversationType::Group,
            settings: ConversationSettings::default(),
            participants: vec![
                (alice, ParticipantRole::Owner),
                (bob, ParticipantRole::Member),
            ],
        })
        .await
        .unwrap();

    World {
        pipeline: Pipeline::new(storage.clone(), cache, limiter, hub.clone()),
        storage,
        hub,
        conversation: conversation.id,
        alice,
        bob,
    }
}

fn shared(conversations: &[Uuid]) -> SessionShared {
    SessionShared {
        resume_token: ulid::Ulid::new().to_string(),
        subscriptions: conversations.iter().copied().collect::<HashSet<_>>(),
        acked_cursors: HashMap::new(),
        missed: false,
        dirty: false,
    }
}

fn auth(account: Uuid, device: &str) -> AuthContext {
    AuthContext {
        account_id: account,
        device_id: Some(device.to_string()),
        session_id: Some(format!("session-{device}")),
    }
}

fn send(world: &World, sender: Uuid) -> SendCommand {
    SendCommand {
        conversation_id: world.conversation.to_string(),
        sender_id: sender.to_string(),
        message_type: "text".to_string(),
        encrypted_content: "SGVsbG8=".to_string(),
        payload_size_bytes: 5,
        idempotency_key: None,
    }
}

async fn recv_one(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for fan-out")
        .expect("channel closed")
}

#[tokio::test]
async fn live_fanout_reaches_recipients_and_suppresses_echo() {
    let w = world().await;

    let mut d1 = w
        .hub
        .try_register("d1", "s1", w.alice, shared(&[w.conversation]))
        .unwrap();
    let mut d2 = w
        .hub
        .try_register("d2", "s2", w.bob, shared(&[w.conversation]))
        .unwrap();
    let mut d3 = w
        .hub
        .try_register("d3", "s3", w.bob, shared(&[w.conversation]))
        .unwrap();

    let receipt = w
        .pipeline
        .send(send(&w, w.alice), &auth(w.alice, "d1"))
        .await
        .unwrap();

    for events in [&mut d2.events, &mut d3.events] {
        let SessionEvent::Deliver(data) = recv_one(events).await;
        assert_eq!(data.message_id, receipt.message_id);
        assert_eq!(data.conversation_id, w.conversation);
        assert_eq!(data.seq, 1);
    }

    // Exactly one frame each, none for the sender's device.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(d2.events.try_recv().is_err());
    assert!(d3.events.try_recv().is_err());
    assert!(d1.events.try_recv().is_err());
}

#[tokio::test]
async fn resume_after_disconnect_replays_the_gap_in_order() {
    let w = world().await;
    let auth_alice = auth(w.alice, "d1");

    // Bob was connected, acked seq 5, then disconnected.
    for _ in 0..5 {
        w.pipeline.send(send(&w, w.alice), &auth_alice).await.unwrap();
    }
    let registration = w
        .hub
        .try_register("d2", "s2", w.bob, shared(&[w.conversation]))
        .unwrap();
    {
        let mut s = registration.handle.shared.lock();
        s.acked_cursors.insert(w.conversation, 5);
    }
    let state = registration.handle.shared.lock().to_resume_state(w.bob);
    w.hub.resume_store().persist("d2", &state).await;
    w.hub.unregister("d2", "s2");

    // Three messages land while Bob is offline.
    for _ in 0..3 {
        w.pipeline.send(send(&w, w.alice), &auth_alice).await.unwrap();
    }

    // Reconnect: load the cursor and stream the gap.
    let loaded = w.hub.resume_store().load("d2").await.unwrap();
    assert_eq!(loaded.acked_cursors[&w.conversation], 5);

    let engine = ReplayEngine::new(w.storage.messages_read.clone());
    let tips = engine.snapshot_tips(&[w.conversation]).await.unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let summary = engine
        .run(&loaded.acked_cursors, &tips, &tx)
        .await
        .unwrap();
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
async fn slow_consumer_is_cut_and_recovers_through_replay() {
    let w = world().await;
    let auth_alice = auth(w.alice, "d1");

    let registration = w
        .hub
        .try_register("d2", "s2", w.bob, shared(&[w.conversation]))
        .unwrap();
    {
        let mut s = registration.handle.shared.lock();
        s.acked_cursors.insert(w.conversation, 0);
    }

    // Fill the queue, then 17 more sends; nothing drains.
    let total = OUTBOUND_QUEUE_CAP + 17;
    for _ in 0..total {
        w.pipeline.send(send(&w, w.alice), &auth_alice).await.unwrap();
    }
    // Fan-out is fire-and-forget; wait for the drops to land.
    for _ in 0..100 {
        if registration.handle.closing().is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        registration.handle.close_reason(),
        Some(CloseReason::SlowConsumer)
    );
    let state = registration.handle.shared.lock().to_resume_state(w.bob);
    assert!(state.missed);

    // The session persists its state on close; simulate that, then replay
    // re-delivers everything from the acked cursor regardless of drops.
    w.hub.resume_store().persist("d2", &state).await;
    w.hub.unregister("d2", "s2");

    let engine = ReplayEngine::new(w.storage.messages_read.clone());
    let tips = engine.snapshot_tips(&[w.conversation]).await.unwrap();
    let (tx, mut rx) = mpsc::channel(2048);
    let summary = engine
        .run(&state.acked_cursors, &tips, &tx)
        .await
        .unwrap();
    drop(tx);

    let mut expected = 1i64;
    while let Some(message) = rx.recv().await {
        assert_eq!(message.seq, expected);
        expected += 1;
    }
    assert_eq!(summary.replay_count as usize, total);
}

#[tokio::test]
async fn offline_buffer_overflow_flags_missed() {
    let w = world().await;
    let auth_alice = auth(w.alice, "d1");

    let registration = w
        .hub
        .try_register("d2", "s2", w.bob, shared(&[w.conversation]))
        .unwrap();
    let state = registration.handle.shared.lock().to_resume_state(w.bob);
    w.hub.resume_store().persist("d2", &state).await;
    w.hub.unregister("d2", "s2");

    for _ in 0..(UNDELIVERED_RING_CAP + 1) {
        w.pipeline.send(send(&w, w.alice), &auth_alice).await.unwrap();
    }
    // Let the spawned fan-outs finish.
    for _ in 0..100 {
        let stored = w.hub.resume_store().load("d2").await.unwrap();
        if stored.missed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stored = w.hub.resume_store().load("d2").await.unwrap();
    assert!(stored.missed);
    assert_eq!(stored.undelivered.len(), UNDELIVERED_RING_CAP);
}
