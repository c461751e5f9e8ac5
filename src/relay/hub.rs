//! In-memory relay state: rooms of at most two members, and per-user
//! invitation inboxes.
//!
//! The hub owns the user → channel routing table; callers only ever ask it
//! to deliver to a room or a user. Each subscriber gets its own unbounded
//! FIFO, so events keep their send order per subscriber.
//!
//! Every subscription is tagged with the session that created it. A user who
//! reconnects gets a new session, and cleanup for the old session leaves the
//! new subscriptions alone.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::calling::invitation::InvitationEvent;
use crate::calling::signaling::{RelayError, RelayEvent, SignalMessage};
use crate::calling::{RoomId, UserId};

/// A call room never has more than the two participants.
pub const ROOM_CAPACITY: usize = 2;

/// One relay connection, as seen by the hub.
pub type SessionId = u64;

/// Session used by in-process callers, which never reconnect.
pub const LOCAL_SESSION: SessionId = 0;

struct Member {
    user: UserId,
    session: SessionId,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

struct Inbox {
    session: SessionId,
    tx: mpsc::UnboundedSender<InvitationEvent>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<RoomId, Vec<Member>>,
    inboxes: HashMap<UserId, Inbox>,
    last_session: SessionId,
}

#[derive(Default)]
pub struct RelayHub {
    state: Mutex<HubState>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a session for a new relay connection.
    pub fn open_session(&self) -> SessionId {
        let mut state = self.lock();
        state.last_session += 1;
        state.last_session
    }

    // ---- Rooms ----

    pub fn join(&self, room: &RoomId, user: &UserId) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError> {
        self.join_as(room, user, LOCAL_SESSION)
    }

    /// Subscribe `user` to `room` on behalf of `session`.
    ///
    /// When the room becomes full, both members are told about each other
    /// with `peer-joined`, so it does not matter who arrived first. A user
    /// joining a room they are already in replaces their old subscription,
    /// whichever session held it.
    pub fn join_as(
        &self,
        room: &RoomId,
        user: &UserId,
        session: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError> {
        let mut state = self.lock();
        let members = state.rooms.entry(room.clone()).or_default();
        members.retain(|m| &m.user != user && !m.tx.is_closed());
        if members.len() >= ROOM_CAPACITY {
            tracing::warn!("Rejecting {} from full room {}", user, room);
            return Err(RelayError::RoomFull(room.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for existing in members.iter() {
            let _ = existing.tx.send(RelayEvent {
                from: user.clone(),
                message: SignalMessage::PeerJoined { user_id: user.clone() },
            });
            let _ = tx.send(RelayEvent {
                from: existing.user.clone(),
                message: SignalMessage::PeerJoined {
                    user_id: existing.user.clone(),
                },
            });
        }
        members.push(Member {
            user: user.clone(),
            session,
            tx,
        });
        tracing::info!("{} joined room {} ({} members)", user, room, members.len());
        Ok(rx)
    }

    /// Forward a client event to the other member of the room.
    pub fn publish(&self, room: &RoomId, from: &UserId, message: SignalMessage) -> Result<(), RelayError> {
        if message.is_membership() {
            return Err(RelayError::Reserved(message.name()));
        }
        let mut state = self.lock();
        let members = state
            .rooms
            .get_mut(room)
            .ok_or_else(|| RelayError::NotJoined(room.clone()))?;
        if !members.iter().any(|m| &m.user == from) {
            return Err(RelayError::NotJoined(room.clone()));
        }

        let name = message.name();
        let mut delivered = 0usize;
        members.retain(|m| {
            if &m.user == from {
                return true;
            }
            let sent = m
                .tx
                .send(RelayEvent {
                    from: from.clone(),
                    message: message.clone(),
                })
                .is_ok();
            if sent {
                delivered += 1;
            } else {
                tracing::debug!("Dropping stale subscriber {} from room {}", m.user, room);
            }
            sent
        });
        tracing::debug!("{} -> room {}: {} ({} recipients)", from, room, name, delivered);
        Ok(())
    }

    /// Unsubscribe. Returns whether `user` was a member.
    pub fn leave(&self, room: &RoomId, user: &UserId) -> bool {
        self.remove_member(room, user, None)
    }

    /// Unsubscribe `user` only if `session` still holds the subscription.
    pub fn leave_as(&self, room: &RoomId, user: &UserId, session: SessionId) -> bool {
        self.remove_member(room, user, Some(session))
    }

    fn remove_member(&self, room: &RoomId, user: &UserId, session: Option<SessionId>) -> bool {
        let mut state = self.lock();
        let Some(members) = state.rooms.get_mut(room) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| &m.user != user || session.is_some_and(|s| s != m.session));
        let left = members.len() != before;
        if !left && session.is_some() {
            tracing::debug!("Stale session for {} in room {}, membership kept", user, room);
        }
        if left {
            for m in members.iter() {
                let _ = m.tx.send(RelayEvent {
                    from: user.clone(),
                    message: SignalMessage::PeerLeft { user_id: user.clone() },
                });
            }
            tracing::info!("{} left room {}", user, room);
        }
        if members.is_empty() {
            state.rooms.remove(room);
            tracing::debug!("Room {} closed", room);
        }
        left
    }

    #[cfg(test)]
    pub fn members(&self, room: &RoomId) -> Vec<UserId> {
        self.lock()
            .rooms
            .get(room)
            .map(|ms| ms.iter().map(|m| m.user.clone()).collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    // ---- Invitations ----

    pub fn register_inbox(&self, user: &UserId) -> mpsc::UnboundedReceiver<InvitationEvent> {
        self.register_inbox_as(user, LOCAL_SESSION)
    }

    /// Route invitations for `user` to a fresh inbox owned by `session`.
    pub fn register_inbox_as(&self, user: &UserId, session: SessionId) -> mpsc::UnboundedReceiver<InvitationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.lock().inboxes.insert(user.clone(), Inbox { session, tx }).is_some() {
            tracing::debug!("Replaced invitation inbox for {}", user);
        }
        rx
    }

    pub fn unregister_inbox(&self, user: &UserId) {
        self.lock().inboxes.remove(user);
    }

    /// Drop the inbox of `user` only if `session` registered it.
    pub fn unregister_inbox_as(&self, user: &UserId, session: SessionId) {
        let mut state = self.lock();
        if state.inboxes.get(user).is_some_and(|inbox| inbox.session == session) {
            state.inboxes.remove(user);
        }
    }

    pub fn deliver(&self, to: &UserId, event: InvitationEvent) -> Result<(), RelayError> {
        let mut state = self.lock();
        let inbox = state
            .inboxes
            .get(to)
            .ok_or_else(|| RelayError::UnknownUser(to.clone()))?;
        if inbox.tx.send(event).is_err() {
            state.inboxes.remove(to);
            return Err(RelayError::UnknownUser(to.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        "room-1".into()
    }

    fn offer() -> SignalMessage {
        SignalMessage::Offer {
            sdp: "v=0".into(),
            video_source: None,
        }
    }

    #[test]
    fn test_peer_joined_sent_to_both_sides() {
        let hub = RelayHub::new();
        let mut first = hub.join(&room(), &"t".into()).unwrap();
        assert!(first.try_recv().is_err());

        let mut second = hub.join(&room(), &"s".into()).unwrap();
        let to_first = first.try_recv().unwrap();
        assert_eq!(to_first.message, SignalMessage::PeerJoined { user_id: "s".into() });
        let to_second = second.try_recv().unwrap();
        assert_eq!(to_second.message, SignalMessage::PeerJoined { user_id: "t".into() });
    }

    #[test]
    fn test_third_member_rejected() {
        let hub = RelayHub::new();
        let _a = hub.join(&room(), &"a".into()).unwrap();
        let _b = hub.join(&room(), &"b".into()).unwrap();
        assert_eq!(
            hub.join(&room(), &"c".into()).unwrap_err(),
            RelayError::RoomFull(room())
        );
    }

    #[test]
    fn test_publish_reaches_only_the_other_member_in_order() {
        let hub = RelayHub::new();
        let mut a = hub.join(&room(), &"a".into()).unwrap();
        let mut b = hub.join(&room(), &"b".into()).unwrap();
        let _ = a.try_recv();
        let _ = b.try_recv();

        hub.publish(&room(), &"a".into(), offer()).unwrap();
        hub.publish(&room(), &"a".into(), SignalMessage::CallEnded { user_id: "a".into() })
            .unwrap();
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap().message.name(), "offer");
        assert_eq!(b.try_recv().unwrap().message.name(), "call-ended");
    }

    #[test]
    fn test_publish_requires_membership_and_client_events() {
        let hub = RelayHub::new();
        assert!(matches!(
            hub.publish(&room(), &"a".into(), offer()),
            Err(RelayError::NotJoined(_))
        ));
        let _a = hub.join(&room(), &"a".into()).unwrap();
        assert!(matches!(
            hub.publish(&room(), &"a".into(), SignalMessage::PeerJoined { user_id: "a".into() }),
            Err(RelayError::Reserved("peer-joined"))
        ));
    }

    #[test]
    fn test_leave_notifies_and_drops_empty_room() {
        let hub = RelayHub::new();
        let mut a = hub.join(&room(), &"a".into()).unwrap();
        let _b = hub.join(&room(), &"b".into()).unwrap();
        let _ = a.try_recv();

        assert!(hub.leave(&room(), &"b".into()));
        assert!(!hub.leave(&room(), &"b".into()));
        assert_eq!(a.try_recv().unwrap().message, SignalMessage::PeerLeft { user_id: "b".into() });
        assert_eq!(hub.members(&room()), vec![UserId::from("a")]);

        hub.leave(&room(), &"a".into());
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn test_rejoin_replaces_subscription() {
        let hub = RelayHub::new();
        let _old = hub.join(&room(), &"a".into()).unwrap();
        let _b = hub.join(&room(), &"b".into()).unwrap();
        let mut fresh = hub.join(&room(), &"a".into()).unwrap();
        assert_eq!(hub.members(&room()).len(), 2);
        assert_eq!(fresh.try_recv().unwrap().message, SignalMessage::PeerJoined { user_id: "b".into() });
    }

    #[test]
    fn test_stale_session_cleanup_keeps_newer_subscription() {
        let hub = RelayHub::new();
        let old = hub.open_session();
        let new = hub.open_session();
        assert_ne!(old, new);

        let mut t = hub.join(&room(), &"t".into()).unwrap();
        let _old_rx = hub.join_as(&room(), &"s".into(), old).unwrap();
        let _old_inbox = hub.register_inbox_as(&"s".into(), old);
        let _new_rx = hub.join_as(&room(), &"s".into(), new).unwrap();
        let mut new_inbox = hub.register_inbox_as(&"s".into(), new);
        while t.try_recv().is_ok() {}

        // The old connection closes after the user reconnected.
        assert!(!hub.leave_as(&room(), &"s".into(), old));
        hub.unregister_inbox_as(&"s".into(), old);
        assert_eq!(hub.members(&room()), vec![UserId::from("t"), UserId::from("s")]);
        assert!(t.try_recv().is_err());
        let event = InvitationEvent::InvitationCancelled {
            invitation_id: uuid::Uuid::nil(),
        };
        hub.deliver(&"s".into(), event.clone()).unwrap();
        assert_eq!(new_inbox.try_recv().unwrap(), event);

        assert!(hub.leave_as(&room(), &"s".into(), new));
        assert_eq!(t.try_recv().unwrap().message, SignalMessage::PeerLeft { user_id: "s".into() });
    }

    #[test]
    fn test_inbox_delivery() {
        let hub = RelayHub::new();
        let event = InvitationEvent::InvitationCancelled {
            invitation_id: uuid::Uuid::nil(),
        };
        assert!(matches!(
            hub.deliver(&"s".into(), event.clone()),
            Err(RelayError::UnknownUser(_))
        ));
        let mut inbox = hub.register_inbox(&"s".into());
        hub.deliver(&"s".into(), event.clone()).unwrap();
        assert_eq!(inbox.try_recv().unwrap(), event);

        drop(inbox);
        assert!(hub.deliver(&"s".into(), event).is_err());
    }
}
