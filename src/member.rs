//! Member struct definition
//!
//! Represents a joined room member with their identity and communication channel.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{ClientId, DeviceId, GameInfo, MacAddress};

/// Joined member
///
/// Holds all state related to a member including their handle, the three
/// identifiers that must be unique within the room, and the message sender
/// channel of their connection.
#[derive(Debug)]
pub struct Member {
    /// Handle of the member's connection
    pub id: ClientId,
    pub nickname: String,
    pub hardware_address: MacAddress,
    pub device_id: DeviceId,
    /// Account username, when the member is authenticated
    pub account: Option<String>,
    /// Remote address of the connection
    pub ip: IpAddr,
    pub current_game: Option<GameInfo>,
    /// Server → Client message channel
    pub sender: mpsc::Sender<ServerMessage>,
}

impl Member {
    /// Queue a message for this member without waiting
    ///
    /// `Full` means the member stopped reading; `ChannelClosed` means it
    /// disconnected.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Roster entry for this member
    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            nickname: self.nickname.clone(),
            hardware_address: self.hardware_address,
            account: self.account.clone(),
            current_game: self.current_game.clone(),
        }
    }
}

/// Roster entry as seen by every member
///
/// Device id and IP stay on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub nickname: String,
    pub hardware_address: MacAddress,
    pub account: Option<String>,
    pub current_game: Option<GameInfo>,
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn member(nickname: &str, sender: mpsc::Sender<ServerMessage>) -> Member {
        Member {
            id: ClientId::new(),
            nickname: nickname.to_string(),
            hardware_address: MacAddress([2, 0, 0, 0, 0, 2]),
            device_id: DeviceId(2),
            account: None,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            current_game: None,
            sender,
        }
    }

    #[tokio::test]
    async fn test_member_send_and_info() {
        let (tx, mut rx) = mpsc::channel(32);
        let member = Member {
            id: ClientId::new(),
            nickname: "Alice1".to_string(),
            hardware_address: MacAddress([2, 0, 0, 0, 0, 1]),
            device_id: DeviceId(1),
            account: Some("alice".to_string()),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            current_game: None,
            sender: tx,
        };

        member.send(ServerMessage::Kicked).unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::Kicked)));

        let info = member.info();
        assert_eq!(info.nickname, "Alice1");
        assert_eq!(info.account.as_deref(), Some("alice"));
    }

    #[test]
    fn test_member_send_after_disconnect() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let member = member("Bob1", tx);
        assert!(matches!(
            member.send(ServerMessage::RoomClosed),
            Err(SendError::ChannelClosed)
        ));
    }

    #[test]
    fn test_member_send_never_waits() {
        let (tx, _rx) = mpsc::channel(1);
        let member = member("Bob1", tx);
        member.send(ServerMessage::Kicked).unwrap();
        assert!(matches!(
            member.send(ServerMessage::RoomClosed),
            Err(SendError::Full)
        ));
    }
}
