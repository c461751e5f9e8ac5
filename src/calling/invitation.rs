//! Invitations — ringing an idle counterpart before either side joins the room.
//!
//! This path is separate from room signaling: events are addressed to a user,
//! not a room, and an invitation expires on its own timeout, independent of
//! the in-room connection timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::signaling::RelayError;
use super::{Participant, RoomId, UserId};

/// An invitation to join a call room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub invitation_id: Uuid,
    pub room_id: RoomId,
    pub caller_name: String,
    pub caller_id: UserId,
    pub expires_at: DateTime<Utc>,
}

impl Invitation {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Events carried on a user's invitation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InvitationEvent {
    IncomingCall(Invitation),
    CallAccepted {
        #[serde(rename = "invitationId")]
        invitation_id: Uuid,
        by: UserId,
    },
    CallRejected {
        #[serde(rename = "invitationId")]
        invitation_id: Uuid,
        by: UserId,
    },
    InvitationCancelled {
        #[serde(rename = "invitationId")]
        invitation_id: Uuid,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum InvitationError {
    #[error("the invitation has expired")]
    Expired,
    #[error("invitation channel closed")]
    Closed,
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Per-user addressable delivery channel, owned by the relay.
#[async_trait]
pub trait InvitationNotifier: Send + Sync {
    /// Start receiving events addressed to `user`. A second registration
    /// replaces the first.
    async fn register(&self, user: &UserId) -> Result<mpsc::UnboundedReceiver<InvitationEvent>, RelayError>;

    /// Deliver to a registered user; unknown users fail with `UnknownUser`.
    async fn deliver(&self, to: &UserId, event: InvitationEvent) -> Result<(), RelayError>;

    async fn unregister(&self, user: &UserId) -> Result<(), RelayError>;
}

/// How a ring attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOutcome {
    Accepted,
    Rejected,
    Expired,
}

// ---- Caller side ----

/// Rings callees on behalf of one caller.
pub struct Ringer {
    notifier: Arc<dyn InvitationNotifier>,
    caller: Participant,
    timeout: Duration,
    inbox: mpsc::UnboundedReceiver<InvitationEvent>,
}

impl Ringer {
    /// Register the caller's inbox so responses can be routed back.
    pub async fn register(
        notifier: Arc<dyn InvitationNotifier>,
        caller: Participant,
        timeout: Duration,
    ) -> Result<Self, InvitationError> {
        let inbox = notifier.register(&caller.user_id).await?;
        Ok(Self {
            notifier,
            caller,
            timeout,
            inbox,
        })
    }

    /// Ring `callee` and wait for an answer or expiry.
    pub async fn ring(&mut self, callee: &UserId, room: &RoomId) -> Result<RingOutcome, InvitationError> {
        let invitation = Invitation {
            invitation_id: Uuid::new_v4(),
            room_id: room.clone(),
            caller_name: self.caller.display_name.clone(),
            caller_id: self.caller.user_id.clone(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::seconds(45)),
        };
        let id = invitation.invitation_id;
        tracing::info!("Ringing {} for room {} (invitation {})", callee, room, id);
        self.notifier
            .deliver(callee, InvitationEvent::IncomingCall(invitation))
            .await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(InvitationEvent::CallAccepted { invitation_id, by })) if invitation_id == id => {
                    tracing::info!("{} accepted the call", by);
                    return Ok(RingOutcome::Accepted);
                }
                Ok(Some(InvitationEvent::CallRejected { invitation_id, by })) if invitation_id == id => {
                    tracing::info!("{} rejected the call", by);
                    return Ok(RingOutcome::Rejected);
                }
                Ok(Some(other)) => {
                    tracing::debug!("Ignoring unrelated invitation event while ringing: {:?}", other);
                }
                Ok(None) => return Err(InvitationError::Closed),
                Err(_) => {
                    tracing::info!("Invitation {} expired", id);
                    if let Err(e) = self
                        .notifier
                        .deliver(callee, InvitationEvent::InvitationCancelled { invitation_id: id })
                        .await
                    {
                        tracing::debug!("Could not cancel invitation {}: {}", id, e);
                    }
                    return Ok(RingOutcome::Expired);
                }
            }
        }
    }

    pub async fn close(self) -> Result<(), InvitationError> {
        self.notifier.unregister(&self.caller.user_id).await?;
        Ok(())
    }
}

// ---- Callee side ----

/// Something that happened on the callee's invitation channel.
pub enum InboxEvent {
    Incoming(IncomingCall),
    Cancelled(Uuid),
}

/// The callee's invitation inbox.
pub struct IncomingCalls {
    notifier: Arc<dyn InvitationNotifier>,
    user: UserId,
    inbox: mpsc::UnboundedReceiver<InvitationEvent>,
}

impl IncomingCalls {
    pub async fn register(notifier: Arc<dyn InvitationNotifier>, user: UserId) -> Result<Self, InvitationError> {
        let inbox = notifier.register(&user).await?;
        Ok(Self { notifier, user, inbox })
    }

    /// Next incoming call or cancellation. `None` once the channel closes.
    pub async fn next(&mut self) -> Option<InboxEvent> {
        loop {
            match self.inbox.recv().await? {
                InvitationEvent::IncomingCall(invitation) => {
                    tracing::info!(
                        "Incoming call from {} ({}) for room {}",
                        invitation.caller_name,
                        invitation.caller_id,
                        invitation.room_id
                    );
                    return Some(InboxEvent::Incoming(IncomingCall {
                        invitation,
                        callee: self.user.clone(),
                        notifier: self.notifier.clone(),
                    }));
                }
                InvitationEvent::InvitationCancelled { invitation_id } => {
                    return Some(InboxEvent::Cancelled(invitation_id));
                }
                other => tracing::debug!("Ignoring invitation event: {:?}", other),
            }
        }
    }

    pub async fn close(self) -> Result<(), InvitationError> {
        self.notifier.unregister(&self.user).await?;
        Ok(())
    }
}

/// A pending invitation the callee can answer once.
pub struct IncomingCall {
    invitation: Invitation,
    callee: UserId,
    notifier: Arc<dyn InvitationNotifier>,
}

impl IncomingCall {
    pub fn invitation(&self) -> &Invitation {
        &self.invitation
    }

    /// Accept and return the room to join.
    pub async fn accept(self) -> Result<RoomId, InvitationError> {
        if self.invitation.is_expired() {
            return Err(InvitationError::Expired);
        }
        self.notifier
            .deliver(
                &self.invitation.caller_id,
                InvitationEvent::CallAccepted {
                    invitation_id: self.invitation.invitation_id,
                    by: self.callee.clone(),
                },
            )
            .await?;
        Ok(self.invitation.room_id)
    }

    pub async fn reject(self) -> Result<(), InvitationError> {
        self.notifier
            .deliver(
                &self.invitation.caller_id,
                InvitationEvent::CallRejected {
                    invitation_id: self.invitation.invitation_id,
                    by: self.callee,
                },
            )
            .await?;
        Ok(())
    }
}
