//! Test doubles shared by the calling tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::signaling::{RelayError, RelayEvent, SignalMessage, SignalingRelay};
use super::{RoomId, UserId};

/// A relay that records every publish and lets the test inject inbound events.
#[derive(Default)]
pub struct RecordingRelay {
    published: Mutex<Vec<SignalMessage>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<RelayEvent>>>,
    fail_publish: AtomicBool,
    joins: AtomicUsize,
    leaves: AtomicUsize,
}

impl RecordingRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent publish fail with a transport error.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<SignalMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Publish attempts with the given event name, failed ones included.
    pub fn count(&self, name: &str) -> usize {
        self.published.lock().unwrap().iter().filter(|m| m.name() == name).count()
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    /// Deliver an event to the current subscriber, as if the peer sent it.
    pub fn inject(&self, from: &str, message: SignalMessage) -> bool {
        match self.inbound.lock().unwrap().as_ref() {
            Some(tx) => tx
                .send(RelayEvent {
                    from: from.into(),
                    message,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Close the subscription, as if the relay went away.
    pub fn disconnect(&self) {
        self.inbound.lock().unwrap().take();
    }
}

#[async_trait]
impl SignalingRelay for RecordingRelay {
    async fn join(&self, _room: &RoomId, _user: &UserId) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn publish(&self, _room: &RoomId, _from: &UserId, message: SignalMessage) -> Result<(), RelayError> {
        self.published.lock().unwrap().push(message);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("simulated publish failure".into()));
        }
        Ok(())
    }

    async fn leave(&self, _room: &RoomId, _user: &UserId) -> Result<(), RelayError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        self.inbound.lock().unwrap().take();
        Ok(())
    }
}
