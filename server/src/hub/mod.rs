//! Session hub: live device connections, subscription index, fan-out.
//!
//! The hub owns every live `DeviceSession` through its [`SessionHandle`].
//! The subscription index maps conversations to device ids, never to session
//! objects, so an abrupt close cannot leak a session through the index. Each
//! session has a bounded mailbox drained by exactly one writer task; fan-out
//! never blocks on a slow consumer.
//!
//! Publication is ordered per conversation: persisted seqs are dense, so a
//! small reorder buffer holds events that arrive ahead of their predecessor
//! and releases them in seq order through one dispatcher task per
//! conversation. A predecessor that never shows up (ingest died between
//! commit and emit) stalls its conversation only until the gap wait expires;
//! replay remains the authority for anything skipped.

pub mod frames;
pub mod session;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::Message;
use crate::resume::{ResumeState, ResumeStore};
use frames::MessageData;

/// Bounded per-session outbound queue.
pub const OUTBOUND_QUEUE_CAP: usize = 1024;

/// Dropped frames tolerated before the connection is closed as a slow
/// consumer.
pub const SLOW_CONSUMER_DROP_THRESHOLD: u32 = 16;

/// Concurrent sessions allowed per account.
pub const MAX_SESSIONS_PER_ACCOUNT: usize = 8;

/// How long the dispatcher waits for a missing predecessor seq before
/// skipping past it.
const DISPATCH_GAP_WAIT: Duration = Duration::from_secs(2);

/// Emitted by ingest once a message is durably persisted.
#[derive(Debug, Clone)]
pub struct MessagePersisted {
    pub message: Message,
    /// Accounts of the current non-left participants.
    pub subscribers: Vec<Uuid>,
    /// Device that produced the message; it never receives the echo.
    pub sender_device: Option<String>,
}

/// Seam between ingest and delivery. The hub implements it in-process; a
/// bus-backed implementation can take its place for multi-node fan-out.
#[async_trait]
pub trait ConversationEvents: Send + Sync {
    async fn message_persisted(&self, event: MessagePersisted);
}

#[derive(Debug)]
pub enum SessionEvent {
    Deliver(MessageData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SlowConsumer,
    HeartbeatLost,
    GoingAway,
    Superseded,
}

/// State shared between the hub, the session writer, and the reader task.
#[derive(Debug)]
pub struct SessionShared {
    pub resume_token: String,
    pub subscriptions: HashSet<Uuid>,
    pub acked_cursors: HashMap<Uuid, i64>,
    pub missed: bool,
    /// Set on every cursor advance; cleared by the snapshot job.
    pub dirty: bool,
}

impl SessionShared {
    pub fn to_resume_state(&self, account_id: Uuid) -> ResumeState {
        ResumeState {
            resume_token: self.resume_token.clone(),
            account_id,
            subscriptions: self.subscriptions.iter().copied().collect(),
            acked_cursors: self.acked_cursors.clone(),
            undelivered: Default::default(),
            missed: self.missed,
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: String,
    pub session_id: String,
    pub account_id: Uuid,
    tx: mpsc::Sender<SessionEvent>,
    dropped: Arc<AtomicU32>,
    closing: CancellationToken,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
    pub shared: Arc<Mutex<SessionShared>>,
}

impl SessionHandle {
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn close_with(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.closing.cancel();
    }

    pub fn dropped_frames(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct SessionRegistration {
    pub events: mpsc::Receiver<SessionEvent>,
    pub handle: SessionHandle,
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("too many concurrent sessions for account")]
    TooManyConnections,
}

/// Per-conversation ordered dispatch state.
struct ConvoDispatch {
    /// Next seq the conversation may release.
    next: i64,
    pending: BTreeMap<i64, MessagePersisted>,
    /// FIFO into the conversation's dispatcher task.
    queue: mpsc::UnboundedSender<MessagePersisted>,
    last_progress: Instant,
    flush_scheduled: bool,
}

pub struct Hub {
    connections: DashMap<String, SessionHandle>,
    /// conversation -> device ids (connected and resumable alike).
    subscriptions: RwLock<HashMap<Uuid, HashSet<String>>>,
    /// device -> owning account, kept while the device is resumable.
    device_accounts: DashMap<String, Uuid>,
    /// Connected devices per account, for the session cap.
    account_devices: DashMap<Uuid, HashSet<String>>,
    dispatch: Mutex<HashMap<Uuid, ConvoDispatch>>,
    resume: Arc<ResumeStore>,
    shutdown: CancellationToken,
    weak_self: Weak<Hub>,
}

impl Hub {
    pub fn new(resume: Arc<ResumeStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            connections: DashMap::new(),
            subscriptions: RwLock::new(HashMap::new()),
            device_accounts: DashMap::new(),
            account_devices: DashMap::new(),
            dispatch: Mutex::new(HashMap::new()),
            resume,
            shutdown: CancellationToken::new(),
            weak_self: weak.clone(),
        })
    }

    pub fn resume_store(&self) -> &Arc<ResumeStore> {
        &self.resume
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn connected_sessions(&self, account_id: Uuid) -> usize {
        self.account_devices
            .get(&account_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn try_register(
        &self,
        device_id: &str,
        session_id: &str,
        account_id: Uuid,
        shared: SessionShared,
    ) -> Result<SessionRegistration, RegisterError> {
        let already_connected = self.connections.contains_key(device_id);
        if !already_connected && self.connected_sessions(account_id) >= MAX_SESSIONS_PER_ACCOUNT {
            return Err(RegisterError::TooManyConnections);
        }

        // A reconnect of the same device replaces the old session.
        if let Some(old) = self.connections.get(device_id) {
            old.close_with(CloseReason::Superseded);
        }

        let (tx, events) = mpsc::channel(OUTBOUND_QUEUE_CAP);
        let subscriptions = shared.subscriptions.clone();
        let handle = SessionHandle {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            account_id,
            tx,
            dropped: Arc::new(AtomicU32::new(0)),
            closing: CancellationToken::new(),
            close_reason: Arc::new(Mutex::new(None)),
            shared: Arc::new(Mutex::new(shared)),
        };

        {
            let mut index = self.subscriptions.write();
            for conversation_id in &subscriptions {
                index
                    .entry(*conversation_id)
                    .or_default()
                    .insert(device_id.to_string());
            }
        }
        self.device_accounts
            .insert(device_id.to_string(), account_id);
        self.account_devices
            .entry(account_id)
            .or_default()
            .insert(device_id.to_string());
        self.connections
            .insert(device_id.to_string(), handle.clone());
        metrics::increment_gauge!("ws_sessions_active", 1.0);

        Ok(SessionRegistration { events, handle })
    }

    /// Remove the live connection. The device stays in the subscription
    /// index so offline fan-out keeps buffering for it until its resume
    /// state expires or is dropped.
    pub fn unregister(&self, device_id: &str, session_id: &str) {
        let removed = self
            .connections
            .remove_if(device_id, |_, handle| handle.session_id == session_id);
        if let Some((_, handle)) = removed {
            if let Some(mut set) = self.account_devices.get_mut(&handle.account_id) {
                set.remove(device_id);
            }
            metrics::decrement_gauge!("ws_sessions_active", 1.0);
        }
    }

    /// Drop every trace of a device, including its subscription entries.
    pub async fn forget_device(&self, device_id: &str) {
        self.device_accounts.remove(device_id);
        let mut index = self.subscriptions.write();
        for devices in index.values_mut() {
            devices.remove(device_id);
        }
        index.retain(|_, devices| !devices.is_empty());
        drop(index);
        self.resume.drop_state(device_id).await;
    }

    /// Subscribe every connected device of an account (member added
    /// mid-session, or a conversation created while devices are live).
    pub fn subscribe_account(&self, account_id: Uuid, conversation_id: Uuid) {
        let devices: Vec<String> = self
            .account_devices
            .get(&account_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for device_id in devices {
            self.subscribe_device(&device_id, conversation_id);
        }
    }

    /// A session gained a subscription (member added mid-session).
    pub fn subscribe_device(&self, device_id: &str, conversation_id: Uuid) {
        self.subscriptions
            .write()
            .entry(conversation_id)
            .or_default()
            .insert(device_id.to_string());
        if let Some(handle) = self.connections.get(device_id) {
            handle.shared.lock().subscriptions.insert(conversation_id);
        }
    }

    /// Accept a persisted message for ordered fan-out.
    ///
    /// Events may arrive out of seq order (each ingest emits from its own
    /// task); they are released to the delivery path strictly in seq order.
    pub fn publish(&self, event: MessagePersisted) {
        let conversation_id = event.message.conversation_id;
        let seq = event.message.seq;
        let mut schedule_flush = false;

        {
            let mut dispatch = self.dispatch.lock();
            let entry = dispatch.entry(conversation_id).or_insert_with(|| {
                let (queue, rx) = mpsc::unbounded_channel();
                self.spawn_dispatcher(conversation_id, rx);
                ConvoDispatch {
                    next: seq,
                    pending: BTreeMap::new(),
                    queue,
                    last_progress: Instant::now(),
                    flush_scheduled: false,
                }
            });

            if seq < entry.next {
                tracing::debug!(
                    conversation = %crate::redact::for_log(&conversation_id.to_string()),
                    seq,
                    next = entry.next,
                    "dropping late event; replay covers it"
                );
                return;
            }
            entry.pending.insert(seq, event);

            loop {
                let next = entry.next;
                let Some(ready) = entry.pending.remove(&next) else {
                    break;
                };
                // Pushed under the dispatch lock, so the queue order is the
                // seq order even with concurrent publishers.
                let _ = entry.queue.send(ready);
                entry.next += 1;
                entry.last_progress = Instant::now();
            }

            if !entry.pending.is_empty() && !entry.flush_scheduled {
                entry.flush_scheduled = true;
                schedule_flush = true;
            }
        }

        if schedule_flush {
            if let Some(hub) = self.weak_self.upgrade() {
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(DISPATCH_GAP_WAIT).await;
                        if !hub.flush_stalled(conversation_id) {
                            break;
                        }
                    }
                });
            }
        }
    }

    /// Skip past a predecessor that never arrived. Returns true while a gap
    /// remains and the flusher should stay alive.
    fn flush_stalled(&self, conversation_id: Uuid) -> bool {
        let mut dispatch = self.dispatch.lock();
        let Some(entry) = dispatch.get_mut(&conversation_id) else {
            return false;
        };
        if entry.pending.is_empty() {
            entry.flush_scheduled = false;
            return false;
        }
        if entry.last_progress.elapsed() >= DISPATCH_GAP_WAIT {
            if let Some(&lowest) = entry.pending.keys().next() {
                tracing::warn!(
                    conversation = %crate::redact::for_log(&conversation_id.to_string()),
                    skipped_from = entry.next,
                    resumed_at = lowest,
                    "seq gap never filled, skipping; replay remains authoritative"
                );
                entry.next = lowest;
            }
            loop {
                let next = entry.next;
                let Some(ready) = entry.pending.remove(&next) else {
                    break;
                };
                let _ = entry.queue.send(ready);
                entry.next += 1;
                entry.last_progress = Instant::now();
            }
        }
        if entry.pending.is_empty() {
            entry.flush_scheduled = false;
            false
        } else {
            true
        }
    }

    fn spawn_dispatcher(
        &self,
        conversation_id: Uuid,
        mut rx: mpsc::UnboundedReceiver<MessagePersisted>,
    ) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(hub) = weak.upgrade() else {
                    break;
                };
                hub.deliver(event).await;
            }
            tracing::debug!(
                conversation = %crate::redact::for_log(&conversation_id.to_string()),
                "dispatcher stopped"
            );
        });
    }

    /// Fan one event out to every subscribed device, in dispatcher order.
    async fn deliver(&self, event: MessagePersisted) {
        let conversation_id = event.message.conversation_id;
        let data = MessageData::from(&event.message);

        let devices: Vec<String> = {
            let index = self.subscriptions.read();
            match index.get(&conversation_id) {
                Some(set) => set.iter().cloned().collect(),
                None => return,
            }
        };

        for device_id in devices {
            if event.sender_device.as_deref() == Some(device_id.as_str()) {
                continue;
            }

            // Clone out of the map so no shard guard is held across await.
            let connected = self.connections.get(&device_id).map(|h| h.clone());
            if let Some(handle) = connected {
                if !event.subscribers.contains(&handle.account_id) {
                    continue;
                }
                self.deliver_or_drop(&handle, data.clone()).await;
                continue;
            }

            // Offline device: buffer into its resume snapshot, if the
            // account is still a participant.
            let account = self.device_accounts.get(&device_id).map(|a| *a);
            match account {
                Some(account) if event.subscribers.contains(&account) => {
                    self.resume
                        .buffer_undelivered(&device_id, data.clone())
                        .await;
                }
                _ => {}
            }
        }
    }

    async fn deliver_or_drop(&self, handle: &SessionHandle, data: MessageData) {
        match handle.tx.try_send(SessionEvent::Deliver(data)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let drops = handle.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                {
                    let mut shared = handle.shared.lock();
                    shared.missed = true;
                    shared.dirty = true;
                }
                metrics::counter!("ws_frames_dropped_total", 1);
                tracing::warn!(
                    device = %crate::redact::for_log(&handle.device_id),
                    drops,
                    "outbound queue full, frame dropped"
                );
                if drops > SLOW_CONSUMER_DROP_THRESHOLD {
                    handle.close_with(CloseReason::SlowConsumer);
                }
            }
            Err(mpsc::error::TrySendError::Closed(SessionEvent::Deliver(data))) => {
                // Session is tearing down; treat the device as offline.
                if self.device_accounts.contains_key(&handle.device_id) {
                    self.resume
                        .buffer_undelivered(&handle.device_id, data)
                        .await;
                }
            }
        }
    }

    /// Persist resume state for every dirty live session. Runs every 15 s.
    pub async fn snapshot_dirty(&self) {
        let mut snapshots = Vec::new();
        for entry in self.connections.iter() {
            let handle = entry.value();
            let mut shared = handle.shared.lock();
            if shared.dirty {
                shared.dirty = false;
                snapshots.push((
                    handle.device_id.clone(),
                    shared.to_resume_state(handle.account_id),
                ));
            }
        }
        for (device_id, state) in snapshots {
            self.resume.persist(&device_id, &state).await;
        }
    }

    /// Broadcast GOING_AWAY and wait for sessions to drain, bounded.
    pub async fn shutdown(&self, drain: Duration) {
        self.shutdown.cancel();
        for entry in self.connections.iter() {
            entry.value().close_with(CloseReason::GoingAway);
        }
        let deadline = tokio::time::Instant::now() + drain;
        while !self.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.connections.is_empty() {
            tracing::warn!(
                remaining = self.connections.len(),
                "sessions still open after drain deadline"
            );
        }
    }

    #[cfg(test)]
    fn is_connected(&self, device_id: &str) -> bool {
        self.connections.contains_key(device_id)
    }
}

#[async_trait]
impl ConversationEvents for Hub {
    async fn message_persisted(&self, event: MessagePersisted) {
        metrics::counter!("hub_fanout_total", 1);
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{memory::MemoryBackend, CacheBackend, DistributedCache};
    use crate::models::{MessageStatus, MessageType};
    use chrono::Utc;

    fn test_hub() -> Arc<Hub> {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let cache = DistributedCache::new("test", backend);
        Hub::new(Arc::new(ResumeStore::new(cache)))
    }

    fn shared_for(conversations: &[Uuid]) -> SessionShared {
        SessionShared {
            resume_token: ulid::Ulid::new().to_string(),
            subscriptions: conversations.iter().copied().collect(),
            acked_cursors: HashMap::new(),
            missed: false,
            dirty: false,
        }
    }

    fn persisted(
        conversation_id: Uuid,
        seq: i64,
        subscribers: Vec<Uuid>,
        sender_device: Option<&str>,
    ) -> MessagePersisted {
        MessagePersisted {
            message: Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: Uuid::new_v4(),
                message_type: MessageType::Text,
                encrypted_content: vec![0u8; 4],
                payload_size_bytes: 4,
                seq,
                status: MessageStatus::Sent,
                created_at: Utc::now(),
                delivered_at: None,
                read_at: None,
                deleted_at: None,
            },
            subscribers,
            sender_device: sender_device.map(str::to_string),
        }
    }

    async fn recv_deliver(events: &mut mpsc::Receiver<SessionEvent>) -> MessageData {
        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
        {
            SessionEvent::Deliver(data) => data,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_subscribers_but_not_the_sender() {
        let hub = test_hub();
        let conversation = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let mut d1 = hub
            .try_register("d1", "s1", alice, shared_for(&[conversation]))
            .unwrap();
        let mut d2 = hub
            .try_register("d2", "s2", bob, shared_for(&[conversation]))
            .unwrap();
        let mut d3 = hub
            .try_register("d3", "s3", bob, shared_for(&[conversation]))
            .unwrap();

        hub.publish(persisted(conversation, 1, vec![alice, bob], Some("d1")));

        assert_eq!(recv_deliver(&mut d2.events).await.seq, 1);
        assert_eq!(recv_deliver(&mut d3.events).await.seq, 1);
        // Echo suppressed for the sending device.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(d1.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_order_publishes_deliver_in_seq_order() {
        let hub = test_hub();
        let conversation = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut d2 = hub
            .try_register("d2", "s2", bob, shared_for(&[conversation]))
            .unwrap();

        // Seq 1 first to pin the dispatcher's origin, then 3 before 2.
        hub.publish(persisted(conversation, 1, vec![bob], None));
        hub.publish(persisted(conversation, 3, vec![bob], None));
        hub.publish(persisted(conversation, 2, vec![bob], None));

        assert_eq!(recv_deliver(&mut d2.events).await.seq, 1);
        assert_eq!(recv_deliver(&mut d2.events).await.seq, 2);
        assert_eq!(recv_deliver(&mut d2.events).await.seq, 3);
    }

    #[tokio::test]
    async fn left_participants_receive_nothing() {
        let hub = test_hub();
        let conversation = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let mut d2 = hub
            .try_register("d2", "s2", bob, shared_for(&[conversation]))
            .unwrap();

        // Bob left: the subscribers list no longer carries his account.
        hub.publish(persisted(conversation, 1, vec![alice], None));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(d2.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_closed_after_threshold_drops() {
        let hub = test_hub();
        let conversation = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let registration = hub
            .try_register("d2", "s2", bob, shared_for(&[conversation]))
            .unwrap();
        // Nobody drains `registration.events`.

        let total = OUTBOUND_QUEUE_CAP as i64 + 17;
        for seq in 1..=total {
            hub.publish(persisted(conversation, seq, vec![bob], None));
        }

        // Fan-out runs on the dispatcher task; wait for the drops.
        for _ in 0..100 {
            if registration.handle.closing().is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(registration.handle.dropped_frames(), 17);
        assert_eq!(
            registration.handle.close_reason(),
            Some(CloseReason::SlowConsumer)
        );
        assert!(registration.handle.shared.lock().missed);
    }

    #[tokio::test]
    async fn offline_devices_buffer_into_resume_state() {
        let hub = test_hub();
        let conversation = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let registration = hub
            .try_register("d2", "s2", bob, shared_for(&[conversation]))
            .unwrap();
        let state = registration.handle.shared.lock().to_resume_state(bob);
        hub.resume_store().persist("d2", &state).await;
        hub.unregister("d2", "s2");

        hub.publish(persisted(conversation, 1, vec![bob], None));
        hub.publish(persisted(conversation, 2, vec![bob], None));

        for _ in 0..100 {
            let stored = hub.resume_store().load("d2").await.unwrap();
            if stored.undelivered.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stored = hub.resume_store().load("d2").await.unwrap();
        assert_eq!(stored.undelivered.len(), 2);
        assert_eq!(stored.undelivered[0].seq, 1);
        assert_eq!(stored.undelivered[1].seq, 2);
    }

    #[tokio::test]
    async fn session_cap_per_account() {
        let hub = test_hub();
        let account = Uuid::new_v4();
        for n in 0..MAX_SESSIONS_PER_ACCOUNT {
            hub.try_register(&format!("d{n}"), "s", account, shared_for(&[]))
                .unwrap();
        }
        assert!(matches!(
            hub.try_register("d-extra", "s", account, shared_for(&[])),
            Err(RegisterError::TooManyConnections)
        ));
    }

    #[tokio::test]
    async fn reconnect_supersedes_the_old_session() {
        let hub = test_hub();
        let account = Uuid::new_v4();
        let first = hub
            .try_register("d1", "s1", account, shared_for(&[]))
            .unwrap();
        let _second = hub
            .try_register("d1", "s2", account, shared_for(&[]))
            .unwrap();

        assert_eq!(first.handle.close_reason(), Some(CloseReason::Superseded));
        // The old session's unregister must not evict the new one.
        hub.unregister("d1", "s1");
        assert!(hub.is_connected("d1"));
    }
}
