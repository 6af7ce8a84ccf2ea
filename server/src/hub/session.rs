//! Per-connection session driver.
//!
//! One WebSocket = one DeviceSession. The connection moves through
//! Handshaking -> Authenticated -> (Resuming | Live) -> Draining -> Closed.
//! A header-carried bearer token authenticates before the upgrade and skips
//! straight past Handshaking; a client that could not set headers upgrades
//! bare and must send an `auth` frame within [`AUTH_DEADLINE`], or the
//! connection closes with AUTH_TIMEOUT (a bad token closes with
//! AUTH_FAILED). A reader task parses client frames; the writer loop here
//! is the mailbox's single consumer and the only place that touches the
//! sink.
//!
//! Replay and live frames never interleave: during Resuming, live deliveries
//! above the tip snapshot are parked and drained after
//! `ws_replay_complete`; deliveries at or below the tip are covered by the
//! replay itself and dropped.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use chrono::Utc;
use futures::{sink::SinkExt, stream::SplitSink, stream::StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::frames::{close_code, ClientFrame, MessageData, MessagePayload, ReplayExpectation, ServerFrame};
use super::{CloseReason, Hub, SessionEvent, SessionShared};
use crate::auth::TokenVerifier;
use crate::replay::ReplayEngine;
use crate::store::{ConversationsRead, MessagesWrite, Storage};

/// Handshaking deadline for the post-upgrade `auth` frame.
pub const AUTH_DEADLINE: Duration = Duration::from_secs(10);
/// Server ping cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
/// Close with HEARTBEAT_LOST when no pong arrived within this.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(55);
/// Bound on flushing the outbound queue while Draining.
pub const DRAIN_FLUSH_BOUND: Duration = Duration::from_secs(5);
/// Deadline for any single socket write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SessionDeps {
    pub hub: Arc<Hub>,
    pub storage: Storage,
    pub replay: Arc<ReplayEngine>,
    pub verifier: TokenVerifier,
}

/// Why the writer loop ended.
enum Ending {
    ClientClosed,
    SocketGone,
    Closing(Option<CloseReason>),
}

/// How Handshaking fell over.
enum AuthFailure {
    TimedOut,
    Failed,
    Gone,
}

pub async fn run(
    mut socket: WebSocket,
    authenticated: Option<Uuid>,
    device_id: String,
    session_id: String,
    presented_resume_token: Option<String>,
    deps: SessionDeps,
) {
    // Handshaking: header-authenticated sockets arrive with the account
    // already known; everything else gets one bounded shot at an auth frame.
    let account_id = match authenticated {
        Some(account_id) => account_id,
        None => match await_auth(&mut socket, &deps.verifier).await {
            Ok(account_id) => account_id,
            Err(AuthFailure::TimedOut) => {
                tracing::info!(
                    device = %crate::redact::for_log(&device_id),
                    "no auth frame within the handshake deadline"
                );
                close_socket(socket, close_code::AUTH_TIMEOUT, "auth timeout").await;
                return;
            }
            Err(AuthFailure::Failed) => {
                tracing::info!(
                    device = %crate::redact::for_log(&device_id),
                    "auth frame rejected"
                );
                close_socket(socket, close_code::AUTH_FAILED, "auth failed").await;
                return;
            }
            Err(AuthFailure::Gone) => return,
        },
    };

    let resume_store = deps.hub.resume_store().clone();

    let subscriptions: Vec<Uuid> = match deps
        .storage
        .conversations_read
        .conversations_for_user(account_id)
        .await
    {
        Ok(list) => list,
        Err(e) => {
            tracing::error!(error = %e, "failed to load subscriptions, refusing session");
            close_socket(socket, 1011, "subscription load failed").await;
            return;
        }
    };

    // Resume decision: the presented token must match the persisted
    // snapshot for this device. Anything else starts a fresh session.
    let prior = resume_store.load(&device_id).await.filter(|state| {
        state.account_id == account_id
            && presented_resume_token.as_deref() == Some(state.resume_token.as_str())
    });
    let resuming = prior.is_some();
    let acked_cursors = prior.map(|state| state.acked_cursors).unwrap_or_default();

    let resume_token = ulid::Ulid::new().to_string();
    let shared = SessionShared {
        resume_token: resume_token.clone(),
        subscriptions: subscriptions.iter().copied().collect::<HashSet<_>>(),
        acked_cursors,
        missed: false,
        dirty: true,
    };

    let registration =
        match deps
            .hub
            .try_register(&device_id, &session_id, account_id, shared)
        {
            Ok(registration) => registration,
            Err(e) => {
                tracing::warn!(
                    account = %crate::redact::for_log(&account_id.to_string()),
                    error = %e,
                    "session registration refused"
                );
                close_socket(socket, 1013, "session limit").await;
                return;
            }
        };
    let handle = registration.handle.clone();
    let mut events = registration.events;

    tracing::info!(
        device = %crate::redact::for_log(&device_id),
        resuming,
        subscriptions = subscriptions.len(),
        "session authenticated"
    );

    let (mut sink, mut stream) = socket.split();

    // Reader task: acks update the shared cursors through the in-flight
    // table; control frames are forwarded to the writer.
    let inflight: Arc<Mutex<HashMap<Uuid, Uuid>>> = Arc::new(Mutex::new(HashMap::new()));
    let last_pong = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
    let (client_tx, mut client_rx) = mpsc::channel::<ClientFrame>(32);
    let reader_inflight = inflight.clone();
    let reader_shared = handle.shared.clone();
    let reader_last_pong = last_pong.clone();
    let reader_messages = deps.storage.messages_write.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Ack {
                        id,
                        status,
                        reason,
                        seq,
                    }) => {
                        if status == super::frames::AckStatus::Rejected {
                            tracing::warn!(
                                frame = %id,
                                reason = reason.as_deref().unwrap_or("unspecified"),
                                "client rejected frame"
                            );
                        }
                        let conversation = reader_inflight.lock().remove(&id);
                        if let Some(conversation_id) = conversation {
                            {
                                let mut shared = reader_shared.lock();
                                let cursor = shared
                                    .acked_cursors
                                    .entry(conversation_id)
                                    .or_insert(0);
                                // Ack of N implicitly covers everything below.
                                *cursor = (*cursor).max(seq);
                                shared.dirty = true;
                            }
                            if status == super::frames::AckStatus::Accepted {
                                // Delivery receipt; a later status wins, so
                                // an Invalid transition is just noise.
                                let messages = reader_messages.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = messages
                                        .mark_status(
                                            id,
                                            crate::models::MessageStatus::Delivered,
                                            Utc::now(),
                                        )
                                        .await
                                    {
                                        tracing::debug!(error = %e, "delivery mark skipped");
                                    }
                                });
                            }
                        }
                    }
                    Ok(ClientFrame::Pong { .. }) => {
                        reader_last_pong
                            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    }
                    Ok(ClientFrame::Auth { .. }) => {
                        tracing::debug!("auth frame after authentication, ignoring");
                    }
                    Ok(frame) => {
                        if client_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "unparseable client frame");
                    }
                },
                WsMessage::Pong(_) => {
                    reader_last_pong.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let mut outbound_seq: u64 = 0;
    let mut write_ok = true;

    // Hello carries the freshly minted resume token for the next reconnect.
    let hello = ServerFrame::Hello {
        server_time: Utc::now(),
        resume_token,
        replay: ReplayExpectation { expected: resuming },
    };
    if send_frame(&mut sink, &hello).await.is_err() {
        write_ok = false;
    }

    // Resuming: stream the gap, park live traffic above the tip snapshot.
    if resuming && write_ok {
        write_ok = run_replay(
            &deps,
            &handle,
            &mut sink,
            &mut events,
            &inflight,
            &subscriptions,
            &mut outbound_seq,
        )
        .await;
    }

    // Live.
    let ending = if write_ok {
        live_loop(
            &handle,
            &mut sink,
            &mut events,
            &mut client_rx,
            &inflight,
            &last_pong,
            &mut outbound_seq,
        )
        .await
    } else {
        Ending::SocketGone
    };

    // Draining / Closed.
    let reason = handle.close_reason();
    match &ending {
        Ending::Closing(Some(CloseReason::SlowConsumer)) => {
            let _ = close_split(&mut sink, close_code::SLOW_CONSUMER, "slow consumer").await;
        }
        Ending::Closing(Some(CloseReason::HeartbeatLost)) => {
            let _ = close_split(&mut sink, close_code::HEARTBEAT_LOST, "heartbeat lost").await;
        }
        Ending::Closing(Some(CloseReason::GoingAway)) => {
            drain_outbound(&mut sink, &mut events, &inflight, &mut outbound_seq).await;
            let _ = close_split(&mut sink, close_code::GOING_AWAY, "going away").await;
        }
        Ending::Closing(Some(CloseReason::Superseded)) => {
            let _ = close_split(&mut sink, 1000, "superseded").await;
        }
        Ending::Closing(None) | Ending::ClientClosed => {
            drain_outbound(&mut sink, &mut events, &inflight, &mut outbound_seq).await;
            let _ = close_split(&mut sink, 1000, "bye").await;
        }
        Ending::SocketGone => {}
    }

    reader.abort();

    // Snapshot for loss-free resume, except when a newer session for this
    // device already owns the persisted state.
    if reason != Some(CloseReason::Superseded) {
        let state = handle.shared.lock().to_resume_state(account_id);
        resume_store.persist(&device_id, &state).await;
    }
    deps.hub.unregister(&device_id, &session_id);

    tracing::info!(
        device = %crate::redact::for_log(&device_id),
        reason = ?reason,
        "session closed"
    );
}

/// Handshaking: wait for the client's `auth` frame, bounded by
/// [`AUTH_DEADLINE`]. Keepalive pings are tolerated; any other frame before
/// authentication is a failure.
async fn await_auth(
    socket: &mut WebSocket,
    verifier: &TokenVerifier,
) -> Result<Uuid, AuthFailure> {
    let deadline = tokio::time::Instant::now() + AUTH_DEADLINE;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = match tokio::time::timeout(remaining, socket.recv()).await {
            Err(_) => return Err(AuthFailure::TimedOut),
            Ok(None) | Ok(Some(Err(_))) => return Err(AuthFailure::Gone),
            Ok(Some(Ok(message))) => message,
        };
        match message {
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Auth { token }) => {
                    let claims = verifier.verify(&token).map_err(|_| AuthFailure::Failed)?;
                    return Uuid::parse_str(&claims.sub).map_err(|_| AuthFailure::Failed);
                }
                Ok(ClientFrame::Ping { .. }) | Ok(ClientFrame::Pong { .. }) => continue,
                Ok(_) | Err(_) => return Err(AuthFailure::Failed),
            },
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => return Err(AuthFailure::Gone),
            _ => return Err(AuthFailure::Failed),
        }
    }
}

/// Returns false when the socket died mid-replay.
async fn run_replay(
    deps: &SessionDeps,
    handle: &super::SessionHandle,
    sink: &mut SplitSink<WebSocket, WsMessage>,
    events: &mut mpsc::Receiver<SessionEvent>,
    inflight: &Arc<Mutex<HashMap<Uuid, Uuid>>>,
    subscriptions: &[Uuid],
    outbound_seq: &mut u64,
) -> bool {
    let tips = match deps.replay.snapshot_tips(subscriptions).await {
        Ok(tips) => tips,
        Err(e) => {
            tracing::error!(error = %e, "tip snapshot failed, skipping replay");
            return true;
        }
    };

    let cursors = handle.shared.lock().acked_cursors.clone();
    let (replay_tx, mut replay_rx) = mpsc::channel(64);
    let engine = deps.replay.clone();
    let task_cursors = cursors.clone();
    let task_tips = tips.clone();
    let replay_task = tokio::spawn(async move {
        engine.run(&task_cursors, &task_tips, &replay_tx).await
    });

    let mut parked: Vec<MessageData> = Vec::new();
    let mut replay_done = false;
    let closing = handle.closing();
    while !replay_done {
        tokio::select! {
            maybe = replay_rx.recv() => match maybe {
                Some(message) => {
                    let data = MessageData::from(&message);
                    inflight.lock().insert(data.message_id, data.conversation_id);
                    *outbound_seq += 1;
                    let frame = ServerFrame::Message {
                        id: data.message_id,
                        seq: *outbound_seq,
                        replay: true,
                        payload: MessagePayload { data },
                    };
                    if send_frame(sink, &frame).await.is_err() {
                        replay_task.abort();
                        return false;
                    }
                }
                None => replay_done = true,
            },
            maybe = events.recv() => {
                if let Some(SessionEvent::Deliver(data)) = maybe {
                    let tip = tips.get(&data.conversation_id).copied().unwrap_or(0);
                    if data.seq > tip {
                        parked.push(data);
                    }
                    // At or below the tip the replay stream covers it.
                }
            }
            _ = closing.cancelled() => {
                replay_task.abort();
                return true;
            }
        }
    }

    let summary = match replay_task.await {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "replay failed");
            return false;
        }
        Err(_) => return false,
    };

    *outbound_seq += 1;
    let complete =
        ServerFrame::replay_complete(*outbound_seq, summary.replay_count, summary.batches);
    if send_frame(sink, &complete).await.is_err() {
        return false;
    }

    tracing::info!(
        device = %crate::redact::for_log(&handle.device_id),
        replay_count = summary.replay_count,
        batches = summary.batches,
        "replay complete"
    );

    for data in parked {
        inflight.lock().insert(data.message_id, data.conversation_id);
        *outbound_seq += 1;
        let frame = ServerFrame::Message {
            id: data.message_id,
            seq: *outbound_seq,
            replay: false,
            payload: MessagePayload { data },
        };
        if send_frame(sink, &frame).await.is_err() {
            return false;
        }
    }
    true
}

async fn live_loop(
    handle: &super::SessionHandle,
    sink: &mut SplitSink<WebSocket, WsMessage>,
    events: &mut mpsc::Receiver<SessionEvent>,
    client_rx: &mut mpsc::Receiver<ClientFrame>,
    inflight: &Arc<Mutex<HashMap<Uuid, Uuid>>>,
    last_pong: &Arc<AtomicI64>,
    outbound_seq: &mut u64,
) -> Ending {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // immediate first tick
    let mut nonce: u64 = 0;
    let closing = handle.closing();

    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(SessionEvent::Deliver(data)) => {
                    inflight.lock().insert(data.message_id, data.conversation_id);
                    *outbound_seq += 1;
                    let frame = ServerFrame::Message {
                        id: data.message_id,
                        seq: *outbound_seq,
                        replay: false,
                        payload: MessagePayload { data },
                    };
                    if send_frame(sink, &frame).await.is_err() {
                        return Ending::SocketGone;
                    }
                }
                None => return Ending::SocketGone,
            },
            maybe = client_rx.recv() => match maybe {
                Some(ClientFrame::Ping { nonce }) => {
                    if send_frame(sink, &ServerFrame::Pong { nonce }).await.is_err() {
                        return Ending::SocketGone;
                    }
                }
                Some(_) => {}
                None => return Ending::ClientClosed,
            },
            _ = heartbeat.tick() => {
                let silent_ms = Utc::now().timestamp_millis()
                    - last_pong.load(Ordering::Relaxed);
                if silent_ms > HEARTBEAT_TIMEOUT.as_millis() as i64 {
                    handle.close_with(CloseReason::HeartbeatLost);
                    return Ending::Closing(Some(CloseReason::HeartbeatLost));
                }
                nonce += 1;
                if send_frame(sink, &ServerFrame::Ping { nonce }).await.is_err() {
                    return Ending::SocketGone;
                }
            }
            _ = closing.cancelled() => {
                return Ending::Closing(handle.close_reason());
            }
        }
    }
}

/// Flush whatever sits in the mailbox, bounded by [`DRAIN_FLUSH_BOUND`].
async fn drain_outbound(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    events: &mut mpsc::Receiver<SessionEvent>,
    inflight: &Arc<Mutex<HashMap<Uuid, Uuid>>>,
    outbound_seq: &mut u64,
) {
    let deadline = tokio::time::Instant::now() + DRAIN_FLUSH_BOUND;
    while tokio::time::Instant::now() < deadline {
        match events.try_recv() {
            Ok(SessionEvent::Deliver(data)) => {
                inflight.lock().insert(data.message_id, data.conversation_id);
                *outbound_seq += 1;
                let frame = ServerFrame::Message {
                    id: data.message_id,
                    seq: *outbound_seq,
                    replay: false,
                    payload: MessagePayload { data },
                };
                if send_frame(sink, &frame).await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: &ServerFrame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(json.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

async fn close_split(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    code: u16,
    reason: &'static str,
) -> Result<(), ()> {
    let frame = WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    tokio::time::timeout(WRITE_TIMEOUT, sink.send(frame))
        .await
        .map_err(|_| ())?
        .map_err(|_| ())
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
