//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization. One message per WebSocket
//! text frame; the transport gives per-connection ordering.

use serde::{Deserialize, Serialize};

use crate::ban_list::BanListEntry;
use crate::error::ErrorCode;
use crate::member::MemberInfo;
use crate::room::RoomInfo;
use crate::types::{ClientId, DeviceId, GameInfo, MacAddress};

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the room (must be the first message on a connection)
    Join {
        nickname: String,
        hardware_address: MacAddress,
        device_id: DeviceId,
        /// Account credential; the host resolves it to a username
        #[serde(default)]
        credential: Option<String>,
        #[serde(default)]
        password: Option<String>,
        protocol_version: u32,
        #[serde(default)]
        current_game: Option<GameInfo>,
    },
    /// Send a chat message
    Chat { text: String },
    /// Report the game currently running
    SetGame { game: Option<GameInfo> },
    /// Kick a member by nickname (moderators only)
    Kick { nickname: String },
    /// Ban a member by nickname (moderators only)
    Ban { nickname: String },
    /// Remove a ban list entry (moderators only)
    Unban { entry: BanListEntry },
    /// Ask for the current ban list (moderators only)
    RequestBanList,
    /// Leave the room
    Leave,
}

/// Chat message as ordered by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Host-assigned, strictly increasing
    pub sequence: u64,
    pub sender: String,
    pub text: String,
}

/// Why a member left the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Lost,
    Kicked,
    Banned,
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted
    JoinSuccess {
        member_id: ClientId,
        room: RoomInfo,
        roster: Vec<MemberInfo>,
        /// Sequence number the next chat message will carry
        next_sequence: u64,
    },
    /// Join refused; the connection is closed afterwards
    JoinRejected { code: ErrorCode },
    /// Full roster after any membership or game change
    RosterChanged { roster: Vec<MemberInfo> },
    /// A member joined
    MemberJoined { nickname: String },
    /// A member left
    MemberLeft { nickname: String, reason: LeaveReason },
    /// Chat message received
    Chat(ChatMessage),
    /// You were kicked; the connection is closed afterwards
    Kicked,
    /// You were banned; the connection is closed afterwards
    Banned,
    /// Current ban list (moderators only)
    BanList { entries: Vec<BanListEntry> },
    /// The host closed the room
    RoomClosed,
    /// A request failed
    Error { code: ErrorCode, message: String },
}

/// Convert ErrorCode to ServerMessage for client notification
impl From<ErrorCode> for ServerMessage {
    fn from(code: ErrorCode) -> Self {
        ServerMessage::Error {
            code,
            message: code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize() {
        let json = r#"{
            "type": "join",
            "nickname": "Alice1",
            "hardware_address": "02:00:00:00:00:01",
            "device_id": 7,
            "protocol_version": 1
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Join {
                nickname,
                hardware_address,
                credential,
                password,
                ..
            } => {
                assert_eq!(nickname, "Alice1");
                assert_eq!(hardware_address.0[5], 1);
                assert!(credential.is_none());
                assert!(password.is_none());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_server_chat_serialize() {
        let msg = ServerMessage::Chat(ChatMessage {
            sequence: 3,
            sender: "Alice1".to_string(),
            text: "hi".to_string(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"chat\""));
        assert!(json.contains("\"sequence\":3"));
    }

    #[test]
    fn test_error_message_carries_text() {
        let msg: ServerMessage = ErrorCode::UserNotFound.into();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":\"user_not_found\""));
        assert!(json.contains("may have left"));
    }
}
