//! In-process relay: both participants share one hub.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::hub::RelayHub;
use crate::calling::invitation::{InvitationEvent, InvitationNotifier};
use crate::calling::signaling::{RelayError, RelayEvent, SignalMessage, SignalingRelay};
use crate::calling::{RoomId, UserId};

#[derive(Clone)]
pub struct LocalRelay {
    hub: Arc<RelayHub>,
}

impl LocalRelay {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl SignalingRelay for LocalRelay {
    async fn join(&self, room: &RoomId, user: &UserId) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError> {
        self.hub.join(room, user)
    }

    async fn publish(&self, room: &RoomId, from: &UserId, message: SignalMessage) -> Result<(), RelayError> {
        self.hub.publish(room, from, message)
    }

    async fn leave(&self, room: &RoomId, user: &UserId) -> Result<(), RelayError> {
        self.hub.leave(room, user);
        Ok(())
    }
}

#[async_trait]
impl InvitationNotifier for LocalRelay {
    async fn register(&self, user: &UserId) -> Result<mpsc::UnboundedReceiver<InvitationEvent>, RelayError> {
        Ok(self.hub.register_inbox(user))
    }

    async fn deliver(&self, to: &UserId, event: InvitationEvent) -> Result<(), RelayError> {
        self.hub.deliver(to, event)
    }

    async fn unregister(&self, user: &UserId) -> Result<(), RelayError> {
        self.hub.unregister_inbox(user);
        Ok(())
    }
}
