//! WebSocket frames between relay clients and the relay server.
//!
//! Every frame is a JSON text message `{"op": "...", "d": {...}}`. A client
//! must send `hello` first; everything before that is refused.

use serde::{Deserialize, Serialize};

use crate::calling::invitation::InvitationEvent;
use crate::calling::signaling::{RelayError, SignalMessage};
use crate::calling::{RoomId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Identify the connection. Identity is trusted as-is; authorizing it is
    /// the auth gateway's job.
    Hello {
        user_id: UserId,
    },
    Join {
        room_id: RoomId,
    },
    Publish {
        room_id: RoomId,
        message: SignalMessage,
    },
    Leave {
        room_id: RoomId,
    },
    Invite {
        to: UserId,
        event: InvitationEvent,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    RoomFull,
    NotJoined,
    UnknownUser,
    Reserved,
    BadFrame,
    NoHello,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "kebab-case")]
pub enum ServerFrame {
    Welcome {
        user_id: UserId,
    },
    Joined {
        room_id: RoomId,
    },
    Event {
        room_id: RoomId,
        from: UserId,
        message: SignalMessage,
    },
    Invitation {
        event: InvitationEvent,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ServerFrame {
    pub fn error(room_id: Option<RoomId>, err: &RelayError) -> Self {
        let code = match err {
            RelayError::RoomFull(_) => ErrorCode::RoomFull,
            RelayError::NotJoined(_) => ErrorCode::NotJoined,
            RelayError::UnknownUser(_) => ErrorCode::UnknownUser,
            RelayError::Reserved(_) => ErrorCode::Reserved,
            _ => ErrorCode::BadFrame,
        };
        ServerFrame::Error {
            room_id,
            code,
            message: err.to_string(),
        }
    }
}

impl ErrorCode {
    /// Rebuild the relay error a server error frame stands for.
    pub fn into_relay_error(self, room_id: Option<RoomId>, message: String) -> RelayError {
        match (self, room_id) {
            (ErrorCode::RoomFull, Some(room)) => RelayError::RoomFull(room),
            (ErrorCode::NotJoined, Some(room)) => RelayError::NotJoined(room),
            _ => RelayError::Transport(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_shape() {
        let frame = ClientFrame::Publish {
            room_id: "r".into(),
            message: SignalMessage::CallEnded { user_id: "u".into() },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "publish");
        assert_eq!(json["d"]["room_id"], "r");
        assert_eq!(json["d"]["message"]["event"], "call-ended");

        let ping: ClientFrame = serde_json::from_str(r#"{"op":"ping"}"#).unwrap();
        assert_eq!(ping, ClientFrame::Ping);
    }

    #[test]
    fn test_error_frame_round_trips_to_relay_error() {
        let frame = ServerFrame::error(Some("r".into()), &RelayError::RoomFull("r".into()));
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains(r#""code":"room-full""#));
        let ServerFrame::Error { room_id, code, message } = serde_json::from_str(&text).unwrap() else {
            panic!("expected error frame");
        };
        assert_eq!(code.into_relay_error(room_id, message), RelayError::RoomFull("r".into()));
    }
}
