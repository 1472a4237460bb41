//! Session state
//!
//! The authoritative data model of a hosted room: room settings, members in
//! join order and the chat sequence counter. Owned and mutated by the room
//! server actor only.

use tracing::debug;

use crate::error::{ConflictKind, SendError};
use crate::member::{Member, MemberInfo};
use crate::message::{ChatMessage, ServerMessage};
use crate::room::Room;
use crate::types::{ClientId, GameInfo};

/// Room plus membership
///
/// At most one member holds a given nickname, hardware address or device id.
#[derive(Debug)]
pub struct SessionState {
    room: Room,
    /// Members in join order
    members: Vec<Member>,
    next_sequence: u64,
}

impl SessionState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            members: Vec::new(),
            next_sequence: 0,
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Add a member, unless one of its identifiers is already taken
    ///
    /// On conflict the member is dropped and the roster is left untouched.
    pub fn add_member(&mut self, member: Member) -> Result<ClientId, ConflictKind> {
        if let Some(kind) = self.conflict_with(&member) {
            return Err(kind);
        }
        let id = member.id;
        debug!("Member {} added as '{}'", id, member.nickname);
        self.members.push(member);
        Ok(id)
    }

    fn conflict_with(&self, candidate: &Member) -> Option<ConflictKind> {
        if self.members.iter().any(|m| m.nickname == candidate.nickname) {
            return Some(ConflictKind::NicknameInUse);
        }
        if self
            .members
            .iter()
            .any(|m| m.hardware_address == candidate.hardware_address)
        {
            return Some(ConflictKind::HardwareAddressInUse);
        }
        if self.members.iter().any(|m| m.device_id == candidate.device_id) {
            return Some(ConflictKind::DeviceIdConflict);
        }
        None
    }

    /// Remove a member, returning it so the caller can notify it
    pub fn remove_member(&mut self, id: ClientId) -> Option<Member> {
        let index = self.members.iter().position(|m| m.id == id)?;
        Some(self.members.remove(index))
    }

    /// Remove every member (room teardown)
    pub fn drain_members(&mut self) -> Vec<Member> {
        std::mem::take(&mut self.members)
    }

    pub fn member(&self, id: ClientId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn find_by_nickname(&self, nickname: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.nickname == nickname)
    }

    /// Update the game a member reports; false if the member is unknown
    pub fn set_current_game(&mut self, id: ClientId, game: Option<GameInfo>) -> bool {
        match self.members.iter_mut().find(|m| m.id == id) {
            Some(member) => {
                member.current_game = game;
                true
            }
            None => false,
        }
    }

    /// Roster snapshot in join order
    pub fn roster(&self) -> Vec<MemberInfo> {
        self.members.iter().map(Member::info).collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.room.settings.max_players
    }

    /// Sequence number the next chat message will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Queue a message for every member, in join order, without waiting
    ///
    /// Returns the members whose queue is full. Closed channels are skipped;
    /// their disconnect is handled separately.
    #[must_use]
    pub fn broadcast(&self, msg: &ServerMessage) -> Vec<ClientId> {
        let mut lagging = Vec::new();
        for member in &self.members {
            match member.send(msg.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => lagging.push(member.id),
                Err(SendError::ChannelClosed) => {
                    debug!("Skipping closed channel of {}", member.id);
                }
            }
        }
        lagging
    }

    /// Order a chat message and fan it out to every member
    ///
    /// Returns `None` if `sender` is not a member, otherwise the message and
    /// the members that could not take it.
    pub fn broadcast_chat(&mut self, sender: ClientId, text: String) -> Option<(ChatMessage, Vec<ClientId>)> {
        let nickname = self.member(sender)?.nickname.clone();
        let message = ChatMessage {
            sequence: self.next_sequence,
            sender: nickname,
            text,
        };
        self.next_sequence += 1;
        let lagging = self.broadcast(&ServerMessage::Chat(message.clone()));
        Some((message, lagging))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::sync::mpsc;

    use super::*;
    use crate::room::RoomSettings;
    use crate::types::{DeviceId, MacAddress};

    fn session(max_players: usize) -> SessionState {
        SessionState::new(Room::new(RoomSettings {
            name: "TestRoom1".to_string(),
            preferred_game: Some(GameInfo::new("Puzzle League", 1)),
            max_players,
            ..Default::default()
        }))
    }

    fn member(nickname: &str, mac: u8, device: u64) -> (Member, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let member = Member {
            id: ClientId::new(),
            nickname: nickname.to_string(),
            hardware_address: MacAddress([2, 0, 0, 0, 0, mac]),
            device_id: DeviceId(device),
            account: None,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            current_game: None,
            sender: tx,
        };
        (member, rx)
    }

    #[test]
    fn test_add_member_and_roster_order() {
        let mut state = session(8);
        let (alice, _rx_a) = member("Alice1", 1, 1);
        let (bob, _rx_b) = member("Bob1", 2, 2);

        let alice_id = state.add_member(alice).unwrap();
        state.add_member(bob).unwrap();

        let names: Vec<_> = state.roster().into_iter().map(|m| m.nickname).collect();
        assert_eq!(names, vec!["Alice1", "Bob1"]);
        assert_eq!(state.member(alice_id).unwrap().nickname, "Alice1");
    }

    #[test]
    fn test_conflicts_leave_roster_untouched() {
        let mut state = session(8);
        let (alice, _rx) = member("Alice1", 1, 1);
        state.add_member(alice).unwrap();

        let (same_nick, _rx) = member("Alice1", 2, 2);
        assert_eq!(state.add_member(same_nick), Err(ConflictKind::NicknameInUse));

        let (same_mac, _rx) = member("Carol1", 1, 3);
        assert_eq!(
            state.add_member(same_mac),
            Err(ConflictKind::HardwareAddressInUse)
        );

        let (same_device, _rx) = member("Dave1", 4, 1);
        assert_eq!(
            state.add_member(same_device),
            Err(ConflictKind::DeviceIdConflict)
        );

        assert_eq!(state.member_count(), 1);
    }

    #[test]
    fn test_nickname_free_after_removal() {
        let mut state = session(8);
        let (alice, _rx) = member("Alice1", 1, 1);
        let id = state.add_member(alice).unwrap();

        let removed = state.remove_member(id).unwrap();
        assert_eq!(removed.nickname, "Alice1");
        assert!(state.remove_member(id).is_none());

        let (again, _rx) = member("Alice1", 1, 1);
        assert!(state.add_member(again).is_ok());
    }

    #[test]
    fn test_is_full() {
        let mut state = session(1);
        assert!(!state.is_full());
        let (alice, _rx) = member("Alice1", 1, 1);
        state.add_member(alice).unwrap();
        assert!(state.is_full());
    }

    #[tokio::test]
    async fn test_chat_sequence_is_shared_order() {
        let mut state = session(8);
        let (alice, mut rx_a) = member("Alice1", 1, 1);
        let (bob, mut rx_b) = member("Bob1", 2, 2);
        let alice_id = state.add_member(alice).unwrap();
        let bob_id = state.add_member(bob).unwrap();

        state.broadcast_chat(alice_id, "one".into()).unwrap();
        state.broadcast_chat(bob_id, "two".into()).unwrap();
        state.broadcast_chat(alice_id, "three".into()).unwrap();
        assert_eq!(state.next_sequence(), 3);

        for rx in [&mut rx_a, &mut rx_b] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                match rx.recv().await {
                    Some(ServerMessage::Chat(msg)) => seen.push((msg.sequence, msg.text)),
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert_eq!(
                seen,
                vec![(0, "one".into()), (1, "two".into()), (2, "three".into())]
            );
        }
    }

    #[test]
    fn test_chat_from_non_member_is_dropped() {
        let mut state = session(8);
        assert!(state.broadcast_chat(ClientId::new(), "hi".into()).is_none());
        assert_eq!(state.next_sequence(), 0);
    }

    #[test]
    fn test_broadcast_reports_full_queues() {
        let mut state = session(8);
        let (alice, _rx_a) = member("Alice1", 1, 1);
        let alice_id = state.add_member(alice).unwrap();

        let (tx, _rx_b) = mpsc::channel(1);
        let (mut bob, _) = member("Bob1", 2, 2);
        bob.sender = tx;
        let bob_id = state.add_member(bob).unwrap();

        assert!(state.broadcast(&ServerMessage::RoomClosed).is_empty());
        let (_, lagging) = state.broadcast_chat(alice_id, "hi".into()).unwrap();
        assert_eq!(lagging, vec![bob_id]);
    }

    #[test]
    fn test_set_current_game() {
        let mut state = session(8);
        let (alice, _rx) = member("Alice1", 1, 1);
        let id = state.add_member(alice).unwrap();

        assert!(state.set_current_game(id, Some(GameInfo::new("Kart", 9))));
        assert_eq!(
            state.roster()[0].current_game,
            Some(GameInfo::new("Kart", 9))
        );
        assert!(!state.set_current_game(ClientId::new(), None));
    }
}
