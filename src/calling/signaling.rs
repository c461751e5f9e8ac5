//! Room-scoped signaling relay contract and its message set.
//!
//! The relay is a dumb pub/sub bus: it forwards client events to the other
//! member of the room and emits membership events itself. Delivery is
//! at-least-once and FIFO per subscriber; nothing here relies on ordering
//! between different event types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::peer::IceCandidateInit;
use super::{RoomId, UserId};

/// What an outbound video sender is carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

/// Explicit purpose of the video on one negotiated mid.
///
/// `source: None` means the sender is currently transmitting no video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSourceTag {
    pub mid: String,
    pub source: Option<VideoSource>,
}

/// Events exchanged through a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer {
        sdp: String,
        #[serde(rename = "videoSource", default, skip_serializing_if = "Option::is_none")]
        video_source: Option<VideoSourceTag>,
    },
    Answer {
        sdp: String,
        #[serde(rename = "videoSource", default, skip_serializing_if = "Option::is_none")]
        video_source: Option<VideoSourceTag>,
    },
    IceCandidate {
        candidate: IceCandidateInit,
    },
    CallEnded {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// Emitted by the relay when a second member subscribes.
    PeerJoined {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// Emitted by the relay when a member leaves.
    PeerLeft {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// The outbound video was swapped in place, without renegotiation.
    VideoSource(VideoSourceTag),
}

impl SignalMessage {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::CallEnded { .. } => "call-ended",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::VideoSource(_) => "video-source",
        }
    }

    /// Membership events are produced by the relay, never by clients.
    pub fn is_membership(&self) -> bool {
        matches!(self, SignalMessage::PeerJoined { .. } | SignalMessage::PeerLeft { .. })
    }
}

/// A message delivered to a room subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub from: UserId,
    pub message: SignalMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("room {0} already has two participants")]
    RoomFull(RoomId),
    #[error("not a member of room {0}")]
    NotJoined(RoomId),
    #[error("user {0} is not reachable")]
    UnknownUser(UserId),
    #[error("'{0}' events are emitted by the relay and cannot be published")]
    Reserved(&'static str),
    #[error("relay connection closed")]
    Closed,
    #[error("relay transport error: {0}")]
    Transport(String),
    #[error("relay did not answer in time")]
    Timeout,
}

/// Room-scoped publish/subscribe channel.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Subscribe to a room. The receiver yields every event published by the
    /// other member plus relay membership events.
    async fn join(&self, room: &RoomId, user: &UserId) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError>;

    /// Forward a message to the other member of the room.
    async fn publish(&self, room: &RoomId, from: &UserId, message: SignalMessage) -> Result<(), RelayError>;

    /// Unsubscribe. Leaving a room you are not in is not an error.
    async fn leave(&self, room: &RoomId, user: &UserId) -> Result<(), RelayError>;
}
