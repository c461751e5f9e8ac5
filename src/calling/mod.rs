//! Call signaling core — negotiation, lifecycle and invitations for a
//! two-party tutoring call.
//!
//! The browser collaborators are reached through traits: `peer::PeerConnection`
//! for the media session, `media::MediaDevices` for capture, and
//! `signaling::SignalingRelay` / `invitation::InvitationNotifier` for the
//! relay. `sim` provides in-process implementations of the first two.

pub mod controller;
pub mod ice;
pub mod invitation;
pub mod media;
pub mod negotiator;
pub mod peer;
pub mod remote;
pub mod sdp;
pub mod signaling;
pub mod sim;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use serde::{Deserialize, Serialize};

use self::media::MediaError;
use self::peer::ConnectionState;

/// Stable identifier of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a call room (one room per booked session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account role reported by the authentication collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    /// Tutor / administrator account.
    Admin,
    Student,
}

/// Role of a participant within one call.
///
/// Derived once from the account role and never changed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the offer once the peer is in the room.
    Initiator,
    /// Waits for the offer and answers it.
    Responder,
}

impl From<AccountRole> for Role {
    fn from(role: AccountRole) -> Self {
        match role {
            AccountRole::Admin => Role::Initiator,
            AccountRole::Student => Role::Responder,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// The local participant of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
}

impl Participant {
    pub fn new(user_id: UserId, display_name: impl Into<String>, account_role: AccountRole) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role: Role::from(account_role),
        }
    }
}

/// Why a call attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No usable camera or microphone.
    Media(MediaError),
    /// `connected` was not reached within the connection timeout.
    ConnectionTimeout,
    /// The transport went away before the call connected.
    TransportFailed,
    /// Joining the room through the relay failed, or the relay went away
    /// before the call connected.
    RelayUnavailable(String),
    /// The peer connection could not be created or configured.
    PeerUnavailable(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Media(e) => write!(f, "{}", e),
            FailureReason::ConnectionTimeout => f.write_str("the connection could not be established in time"),
            FailureReason::TransportFailed => f.write_str("the connection to the other participant failed"),
            FailureReason::RelayUnavailable(e) => write!(f, "the call service is unavailable ({})", e),
            FailureReason::PeerUnavailable(e) => write!(f, "the call could not be set up ({})", e),
        }
    }
}

/// Local view of the call's progress.
///
/// Both participants run independent copies of this state machine; they are
/// expected, but not guaranteed, to agree at any instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    /// An invitation is out and the callee has not answered yet.
    Ringing,
    RequestingMedia,
    JoiningRoom,
    /// Initiator in the room, waiting for the responder to join.
    AwaitingPeer,
    /// Responder in the room, waiting for the initiator's offer.
    AwaitingOffer,
    Negotiating,
    Connected,
    Ending,
    Ended,
    Failed(FailureReason),
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed(_))
    }

    /// States from which the first media exchange can still be declared.
    fn is_pre_connect(&self) -> bool {
        matches!(
            self,
            CallStatus::JoiningRoom
                | CallStatus::AwaitingPeer
                | CallStatus::AwaitingOffer
                | CallStatus::Negotiating
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Idle => f.write_str("Idle"),
            CallStatus::Ringing => f.write_str("Ringing..."),
            CallStatus::RequestingMedia => f.write_str("Requesting camera and microphone..."),
            CallStatus::JoiningRoom => f.write_str("Joining room..."),
            CallStatus::AwaitingPeer => f.write_str("Waiting for the other participant to join..."),
            CallStatus::AwaitingOffer => f.write_str("Waiting for the call to start..."),
            CallStatus::Negotiating => f.write_str("Connecting..."),
            CallStatus::Connected => f.write_str("Connected"),
            CallStatus::Ending => f.write_str("Ending call..."),
            CallStatus::Ended => f.write_str("Call ended"),
            CallStatus::Failed(reason) => write!(f, "Call failed: {}", reason),
        }
    }
}

/// What triggered the teardown of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    /// The peer connection reported disconnected, failed or closed.
    Transport(ConnectionState),
    ConnectionTimeout,
    /// The relay subscription closed underneath the call.
    RelayClosed,
    /// The call never got far enough to exchange media.
    SetupFailed(FailureReason),
}

impl EndReason {
    /// Terminal status for this reason, given whether media was flowing.
    pub fn final_status(&self, was_connected: bool) -> CallStatus {
        match self {
            EndReason::LocalHangUp | EndReason::RemoteHangUp => CallStatus::Ended,
            EndReason::Transport(_) if !was_connected => CallStatus::Failed(FailureReason::TransportFailed),
            EndReason::Transport(_) => CallStatus::Ended,
            EndReason::ConnectionTimeout => CallStatus::Failed(FailureReason::ConnectionTimeout),
            EndReason::RelayClosed if was_connected => CallStatus::Ended,
            EndReason::RelayClosed => {
                CallStatus::Failed(FailureReason::RelayUnavailable("relay closed".to_string()))
            }
            EndReason::SetupFailed(reason) => CallStatus::Failed(reason.clone()),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangUp => f.write_str("local hang-up"),
            EndReason::RemoteHangUp => f.write_str("remote hang-up"),
            EndReason::Transport(state) => write!(f, "transport {}", state),
            EndReason::ConnectionTimeout => f.write_str("connection timeout"),
            EndReason::RelayClosed => f.write_str("relay closed"),
            EndReason::SetupFailed(reason) => write!(f, "setup failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_derived_from_account() {
        let admin = Participant::new("t-1".into(), "Tutor", AccountRole::Admin);
        let student = Participant::new("s-1".into(), "Student", AccountRole::Student);
        assert_eq!(admin.role, Role::Initiator);
        assert_eq!(student.role, Role::Responder);
    }

    #[test]
    fn test_final_status_by_reason() {
        assert_eq!(EndReason::LocalHangUp.final_status(true), CallStatus::Ended);
        assert_eq!(EndReason::RemoteHangUp.final_status(false), CallStatus::Ended);
        assert_eq!(
            EndReason::Transport(ConnectionState::Failed).final_status(false),
            CallStatus::Failed(FailureReason::TransportFailed)
        );
        assert_eq!(
            EndReason::Transport(ConnectionState::Failed).final_status(true),
            CallStatus::Ended
        );
        for state in [ConnectionState::Disconnected, ConnectionState::Closed] {
            assert_eq!(
                EndReason::Transport(state).final_status(false),
                CallStatus::Failed(FailureReason::TransportFailed)
            );
            assert_eq!(EndReason::Transport(state).final_status(true), CallStatus::Ended);
        }
        assert_eq!(
            EndReason::ConnectionTimeout.final_status(false),
            CallStatus::Failed(FailureReason::ConnectionTimeout)
        );
    }

    #[test]
    fn test_status_strings_are_specific() {
        let denied = CallStatus::Failed(FailureReason::Media(MediaError::PermissionDenied));
        assert!(denied.to_string().contains("permission"));
        let missing = CallStatus::Failed(FailureReason::Media(MediaError::NotFound));
        assert!(missing.to_string().contains("no camera or microphone"));
        assert!(CallStatus::Ended.is_terminal());
        assert!(!CallStatus::Ending.is_terminal());
    }
}
