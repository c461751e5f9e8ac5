//! WebSocket relay server — exposes a `RelayHub` to remote clients.
//!
//! One task per connection reads client frames; a writer task owns the sink
//! and drains an unbounded queue, so room forwarders and the invitation
//! forwarder never contend for the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use super::hub::RelayHub;
use super::protocol::{ClientFrame, ErrorCode, ServerFrame};
use crate::calling::{RoomId, UserId};

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: &str, hub: Arc<RelayHub>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind relay listener on {}", addr))?;
    tracing::info!("Relay listening on ws://{}", listener.local_addr()?);
    run_listener(listener, hub).await
}

/// Accept connections on an already bound listener.
pub async fn run_listener(listener: TcpListener, hub: Arc<RelayHub>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("Failed to accept connection")?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, hub).await {
                tracing::warn!("Relay connection {} ended with error: {:#}", peer, e);
            }
        });
    }
}

fn send_error(out: &mpsc::UnboundedSender<ServerFrame>, room_id: Option<RoomId>, code: ErrorCode, message: String) {
    let _ = out.send(ServerFrame::Error { room_id, code, message });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: Arc<RelayHub>) -> Result<()> {
    let ws = accept_async(stream).await.context("WebSocket upgrade failed")?;
    let (mut sink, mut source) = ws.split();

    // Nothing is accepted before the client says who it is.
    let user: UserId = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Hello { user_id }) => break user_id,
                Ok(other) => {
                    tracing::warn!("Frame before hello from {}: {:?}", peer, other);
                    let frame = ServerFrame::Error {
                        room_id: None,
                        code: ErrorCode::NoHello,
                        message: "send hello first".into(),
                    };
                    sink.send(Message::Text(serde_json::to_string(&frame)?))
                        .await
                        .context("Failed to send error frame")?;
                }
                Err(e) => {
                    tracing::warn!("Invalid frame from {}: {}", peer, e);
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("WebSocket receive error"),
        }
    };
    tracing::info!("Relay client {} connected from {}", user, peer);

    // Registered before `welcome`, so a connected client is always reachable.
    let session = hub.open_session();
    let mut inbox = hub.register_inbox_as(&user, session);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("Failed to encode server frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!("Relay writer stopping: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });
    let _ = out_tx.send(ServerFrame::Welcome { user_id: user.clone() });

    let inbox_task = {
        let out = out_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                if out.send(ServerFrame::Invitation { event }).is_err() {
                    break;
                }
            }
        })
    };

    let mut rooms: HashMap<RoomId, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = source.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                tracing::debug!("{} closed the connection: {:?}", user, frame);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Receive error from {}: {}", user, e);
                break;
            }
        };
        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(f) => f,
            Err(e) => {
                send_error(&out_tx, None, ErrorCode::BadFrame, e.to_string());
                continue;
            }
        };

        match frame {
            ClientFrame::Hello { user_id } => {
                tracing::debug!("Ignoring repeated hello ({}) from {}", user_id, user);
            }
            ClientFrame::Join { room_id } => match hub.join_as(&room_id, &user, session) {
                Ok(mut rx) => {
                    let _ = out_tx.send(ServerFrame::Joined {
                        room_id: room_id.clone(),
                    });
                    let out = out_tx.clone();
                    let room = room_id.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            let frame = ServerFrame::Event {
                                room_id: room.clone(),
                                from: event.from,
                                message: event.message,
                            };
                            if out.send(frame).is_err() {
                                break;
                            }
                        }
                    });
                    if let Some(old) = rooms.insert(room_id, forwarder) {
                        old.abort();
                    }
                }
                Err(e) => {
                    let _ = out_tx.send(ServerFrame::error(Some(room_id), &e));
                }
            },
            ClientFrame::Publish { room_id, message } => {
                if let Err(e) = hub.publish(&room_id, &user, message) {
                    let _ = out_tx.send(ServerFrame::error(Some(room_id), &e));
                }
            }
            ClientFrame::Leave { room_id } => {
                hub.leave_as(&room_id, &user, session);
                if let Some(task) = rooms.remove(&room_id) {
                    task.abort();
                }
            }
            ClientFrame::Invite { to, event } => {
                if let Err(e) = hub.deliver(&to, event) {
                    let _ = out_tx.send(ServerFrame::error(None, &e));
                }
            }
            ClientFrame::Ping => {
                let _ = out_tx.send(ServerFrame::Pong);
            }
        }
    }

    // A reconnect may already own these subscriptions under a newer session.
    for (room, task) in rooms {
        hub.leave_as(&room, &user, session);
        task.abort();
    }
    hub.unregister_inbox_as(&user, session);
    inbox_task.abort();
    drop(out_tx);
    let _ = writer.await;
    tracing::info!("Relay client {} ({}) disconnected", user, peer);
    Ok(())
}
