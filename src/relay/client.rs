//! WebSocket relay client — `SignalingRelay` and `InvitationNotifier` over
//! a connection to the relay server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::protocol::{ClientFrame, ServerFrame};
use crate::calling::invitation::{InvitationEvent, InvitationNotifier};
use crate::calling::signaling::{RelayError, RelayEvent, SignalMessage, SignalingRelay};
use crate::calling::{RoomId, UserId};

/// How long to wait for `welcome` and `joined` acknowledgements.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

enum Outbound {
    Frame(ClientFrame),
    Close,
}

#[derive(Default)]
struct Shared {
    rooms: HashMap<RoomId, mpsc::UnboundedSender<RelayEvent>>,
    pending_joins: HashMap<RoomId, oneshot::Sender<Result<(), RelayError>>>,
    inbox: Option<mpsc::UnboundedSender<InvitationEvent>>,
}

pub struct RelayClient {
    user: UserId,
    out_tx: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Mutex<Shared>>,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

impl RelayClient {
    /// Connect, identify as `user`, and start the reader/writer tasks.
    pub async fn connect(url: &str, user: UserId, heartbeat: Duration) -> Result<Self> {
        tracing::info!("Connecting to relay at {}", url);
        let (ws, response) = connect_async(url).await.context("Relay WebSocket connection failed")?;
        tracing::debug!("Relay WebSocket connected (status={})", response.status());
        let (mut sink, mut source) = ws.split();

        let hello = serde_json::to_string(&ClientFrame::Hello { user_id: user.clone() })?;
        sink.send(Message::Text(hello)).await.context("Failed to send hello")?;

        let welcome = tokio::time::timeout(ACK_TIMEOUT, async {
            while let Some(msg) = source.next().await {
                if let Message::Text(text) = msg.context("Relay receive error")? {
                    return match serde_json::from_str::<ServerFrame>(&text)? {
                        ServerFrame::Welcome { user_id } => Ok(user_id),
                        other => bail!("Expected welcome from relay, got {:?}", other),
                    };
                }
            }
            bail!("Relay closed the connection before welcome")
        })
        .await
        .context("Timed out waiting for relay welcome")??;
        tracing::info!("Relay session established as {}", welcome);

        let shared = Arc::new(Mutex::new(Shared::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

        let writer = {
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
                loop {
                    let frame = tokio::select! {
                        out = out_rx.recv() => match out {
                            Some(Outbound::Frame(frame)) => frame,
                            Some(Outbound::Close) | None => break,
                        },
                        _ = heartbeat.tick() => ClientFrame::Ping,
                    };
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::warn!("Failed to encode client frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!("Relay send failed: {}", e);
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
                let _ = sink.close().await;
            })
        };

        let reader = {
            let shared = shared.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(msg) = source.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => dispatch(&shared, frame),
                            Err(e) => tracing::warn!("Invalid relay frame: {}", e),
                        },
                        Ok(Message::Close(frame)) => {
                            tracing::info!("Relay closed the connection: {:?}", frame);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Relay receive error: {}", e);
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders ends every subscription.
                let mut state = lock(&shared);
                state.rooms.clear();
                state.pending_joins.clear();
                state.inbox = None;
                tracing::info!("Relay connection lost");
            })
        };

        Ok(Self {
            user,
            out_tx,
            shared,
            closed,
            tasks: vec![writer, reader],
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: ClientFrame) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.out_tx.send(Outbound::Frame(frame)).map_err(|_| RelayError::Closed)
    }

    fn check_user(&self, user: &UserId) -> Result<(), RelayError> {
        if user != &self.user {
            return Err(RelayError::UnknownUser(user.clone()));
        }
        Ok(())
    }

    /// Close the connection gracefully.
    pub fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close);
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn dispatch(shared: &Mutex<Shared>, frame: ServerFrame) {
    let mut state = lock(shared);
    match frame {
        ServerFrame::Joined { room_id } => {
            if let Some(ack) = state.pending_joins.remove(&room_id) {
                let _ = ack.send(Ok(()));
            }
        }
        ServerFrame::Event { room_id, from, message } => match state.rooms.get(&room_id) {
            Some(tx) => {
                let _ = tx.send(RelayEvent { from, message });
            }
            None => tracing::debug!("Event for room {} we are not in", room_id),
        },
        ServerFrame::Invitation { event } => match &state.inbox {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => tracing::debug!("Invitation received with no inbox registered"),
        },
        ServerFrame::Error { room_id, code, message } => {
            tracing::warn!("Relay error ({:?}): {}", code, message);
            if let Some(room) = &room_id {
                if let Some(ack) = state.pending_joins.remove(room) {
                    state.rooms.remove(room);
                    let _ = ack.send(Err(code.into_relay_error(room_id.clone(), message)));
                }
            }
        }
        ServerFrame::Pong => tracing::trace!("Relay pong"),
        ServerFrame::Welcome { .. } => {}
    }
}

#[async_trait]
impl SignalingRelay for RelayClient {
    async fn join(&self, room: &RoomId, user: &UserId) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError> {
        self.check_user(user)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut state = lock(&self.shared);
            state.rooms.insert(room.clone(), tx);
            state.pending_joins.insert(room.clone(), ack_tx);
        }
        if let Err(e) = self.send(ClientFrame::Join { room_id: room.clone() }) {
            let mut state = lock(&self.shared);
            state.rooms.remove(room);
            state.pending_joins.remove(room);
            return Err(e);
        }

        let result = match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(rx),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => Err(RelayError::Timeout),
        };
        if result.is_err() {
            let mut state = lock(&self.shared);
            state.rooms.remove(room);
            state.pending_joins.remove(room);
        } else {
            tracing::info!("Joined room {} via relay", room);
        }
        result
    }

    async fn publish(&self, room: &RoomId, from: &UserId, message: SignalMessage) -> Result<(), RelayError> {
        self.check_user(from)?;
        tracing::debug!("Publishing {} to room {}", message.name(), room);
        self.send(ClientFrame::Publish {
            room_id: room.clone(),
            message,
        })
    }

    async fn leave(&self, room: &RoomId, user: &UserId) -> Result<(), RelayError> {
        self.check_user(user)?;
        lock(&self.shared).rooms.remove(room);
        self.send(ClientFrame::Leave { room_id: room.clone() })
    }
}

#[async_trait]
impl InvitationNotifier for RelayClient {
    async fn register(&self, user: &UserId) -> Result<mpsc::UnboundedReceiver<InvitationEvent>, RelayError> {
        self.check_user(user)?;
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared).inbox = Some(tx);
        Ok(rx)
    }

    /// Queue the invitation. An unreachable recipient is reported by the
    /// server asynchronously and only logged.
    async fn deliver(&self, to: &UserId, event: InvitationEvent) -> Result<(), RelayError> {
        self.send(ClientFrame::Invite { to: to.clone(), event })
    }

    async fn unregister(&self, user: &UserId) -> Result<(), RelayError> {
        self.check_user(user)?;
        lock(&self.shared).inbox = None;
        Ok(())
    }
}
