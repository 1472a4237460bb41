//! RoomServer Actor implementation
//!
//! The central actor that owns the room: session state, moderation and the
//! registry of open connections. Connection handlers and the host handle talk
//! to it through `ServerCommand`s, so every mutation is serialized.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::ban_list::BanListEntry;
use crate::error::ErrorCode;
use crate::member::{Member, MemberInfo};
use crate::message::{ChatMessage, LeaveReason, ServerMessage};
use crate::moderation::{Actor, ModerationController};
use crate::room::RoomInfo;
use crate::session::SessionState;
use crate::types::{ClientId, ConnectionState, DeviceId, GameInfo, MacAddress, PROTOCOL_VERSION};
use crate::validation::validate_nickname;

/// Longest chat message relayed, in characters
pub const MAX_CHAT_LENGTH: usize = 500;

/// Reply channel for host-initiated requests
///
/// `None` when the request came from a member; failures are then sent to
/// that member as a `ServerMessage::Error`.
pub type Reply<T> = Option<oneshot::Sender<Result<T, ErrorCode>>>;

/// Everything a client presents when joining
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub nickname: String,
    pub hardware_address: MacAddress,
    pub device_id: DeviceId,
    /// Verified account username; `None` when the credential did not resolve
    pub account: Option<String>,
    pub password: Option<String>,
    pub protocol_version: u32,
    pub current_game: Option<GameInfo>,
}

/// Consistent view of the room for the host and the lobby announcer
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room: RoomInfo,
    pub roster: Vec<MemberInfo>,
    pub next_sequence: u64,
}

/// Notifications for the hosting application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    MemberJoined { nickname: String },
    MemberLeft { nickname: String, reason: LeaveReason },
    Chat(ChatMessage),
    /// The room is listed on the lobby directory
    Announced,
    /// Listing the room failed; carries the user-facing code
    AnnounceFailed(ErrorCode),
}

/// Commands sent from handlers and the host handle to the RoomServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New connection accepted
    Connect {
        client_id: ClientId,
        ip: IpAddr,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// Connection closed by the transport
    Disconnect { client_id: ClientId },
    /// Join attempt
    Join {
        client_id: ClientId,
        request: JoinRequest,
    },
    /// Chat message from a member
    Chat { client_id: ClientId, text: String },
    /// Member reports its current game
    SetGame {
        client_id: ClientId,
        game: Option<GameInfo>,
    },
    /// Voluntary leave
    Leave { client_id: ClientId },
    Kick {
        actor: Actor,
        nickname: String,
        reply: Reply<()>,
    },
    Ban {
        actor: Actor,
        nickname: String,
        reply: Reply<()>,
    },
    Unban {
        actor: Actor,
        entry: BanListEntry,
        reply: Reply<()>,
    },
    BanList {
        actor: Actor,
        reply: Reply<Vec<BanListEntry>>,
    },
    Snapshot { reply: oneshot::Sender<RoomSnapshot> },
    /// Tear the room down; replies with the number of members disconnected
    Close { reply: oneshot::Sender<usize> },
}

/// An accepted connection, joined or not
#[derive(Debug)]
struct Connection {
    ip: IpAddr,
    sender: mpsc::Sender<ServerMessage>,
    state: ConnectionState,
}

/// The room server actor
///
/// Manages all state and processes commands from connection handlers.
pub struct RoomServer {
    session: SessionState,
    moderation: ModerationController,
    /// All open connections: ClientId -> Connection
    connections: HashMap<ClientId, Connection>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    events: Option<mpsc::Sender<HostEvent>>,
}

impl RoomServer {
    pub fn new(
        session: SessionState,
        moderation: ModerationController,
        receiver: mpsc::Receiver<ServerCommand>,
        events: Option<mpsc::Sender<HostEvent>>,
    ) -> Self {
        Self {
            session,
            moderation,
            connections: HashMap::new(),
            receiver,
            events,
        }
    }

    /// Run the RoomServer event loop
    ///
    /// Processes commands until the room is closed or all senders are dropped.
    /// Nothing here waits on a member: outbound queues are filled with
    /// `try_send` and a member whose queue is full is dropped as lost.
    pub async fn run(mut self) {
        info!("Room '{}' open", self.session.room().name());

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd).await {
                break;
            }
        }

        info!("Room '{}' closed", self.session.room().name());
    }

    /// Process a single command; false once the room is closed
    async fn handle_command(&mut self, cmd: ServerCommand) -> bool {
        match cmd {
            ServerCommand::Connect {
                client_id,
                ip,
                sender,
            } => self.handle_connect(client_id, ip, sender),
            ServerCommand::Disconnect { client_id } => self.handle_disconnect(client_id),
            ServerCommand::Join { client_id, request } => self.handle_join(client_id, request),
            ServerCommand::Chat { client_id, text } => self.handle_chat(client_id, text),
            ServerCommand::SetGame { client_id, game } => self.handle_set_game(client_id, game),
            ServerCommand::Leave { client_id } => self.handle_leave(client_id),
            ServerCommand::Kick {
                actor,
                nickname,
                reply,
            } => {
                let result = self.handle_kick(actor, &nickname);
                self.respond(actor, reply, result);
            }
            ServerCommand::Ban {
                actor,
                nickname,
                reply,
            } => {
                let result = self.handle_ban(actor, &nickname).await;
                self.respond(actor, reply, result);
            }
            ServerCommand::Unban {
                actor,
                entry,
                reply,
            } => {
                let result = self.moderation.unban(&self.session, actor, &entry).await;
                self.respond(actor, reply, result);
            }
            ServerCommand::BanList { actor, reply } => {
                let result = self.moderation.ban_list(&self.session, actor);
                match (reply, actor, result) {
                    (Some(reply), _, result) => {
                        let _ = reply.send(result);
                    }
                    (None, Actor::Member(id), Ok(entries)) => {
                        self.send_to(id, ServerMessage::BanList { entries });
                    }
                    (None, actor, Err(code)) => self.respond::<()>(actor, None, Err(code)),
                    (None, Actor::Host, Ok(_)) => {}
                }
            }
            ServerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ServerCommand::Close { reply } => {
                let count = self.handle_close();
                let _ = reply.send(count);
                return false;
            }
        }
        true
    }

    /// Handle new connection
    fn handle_connect(&mut self, client_id: ClientId, ip: IpAddr, sender: mpsc::Sender<ServerMessage>) {
        debug!("Connection {} from {} registered", client_id, ip);
        self.connections.insert(
            client_id,
            Connection {
                ip,
                sender,
                state: ConnectionState::Connecting,
            },
        );
        debug!(
            "Total connections: {}, members: {}",
            self.connections.len(),
            self.session.member_count()
        );
    }

    /// Handle transport disconnection
    fn handle_disconnect(&mut self, client_id: ClientId) {
        match self.session.remove_member(client_id) {
            Some(member) => {
                info!("Member '{}' lost connection", member.nickname);
                self.finish(member, ConnectionState::Lost, LeaveReason::Lost);
            }
            None => {
                if self.connections.remove(&client_id).is_some() {
                    debug!("Connection {} closed before joining", client_id);
                }
            }
        }
    }

    /// Handle a join attempt
    fn handle_join(&mut self, client_id: ClientId, request: JoinRequest) {
        let Some(conn) = self.connections.get(&client_id) else {
            return;
        };
        if conn.state != ConnectionState::Connecting {
            warn!("Ignoring repeated join from {}", client_id);
            return;
        }
        let ip = conn.ip;
        let sender = conn.sender.clone();
        let nickname = request.nickname.clone();

        if let Err(code) = self.admit(client_id, ip, sender.clone(), request) {
            info!("Join of '{}' from {} rejected: {:?}", nickname, ip, code);
            let _ = sender.try_send(ServerMessage::JoinRejected { code });
            self.set_state(client_id, ConnectionState::Disconnected);
            self.connections.remove(&client_id);
            return;
        }

        self.set_state(client_id, ConnectionState::Connected);
        info!("'{}' joined room '{}' from {}", nickname, self.session.room().name(), ip);

        let welcome = ServerMessage::JoinSuccess {
            member_id: client_id,
            room: self.session.room().info(),
            roster: self.session.roster(),
            next_sequence: self.session.next_sequence(),
        };
        self.send_to(client_id, welcome);

        self.broadcast(ServerMessage::MemberJoined {
            nickname: nickname.clone(),
        });
        self.broadcast_roster();
        self.emit(HostEvent::MemberJoined { nickname });
    }

    /// The join sequence, short-circuiting on the first failure
    fn admit(
        &mut self,
        client_id: ClientId,
        ip: IpAddr,
        sender: mpsc::Sender<ServerMessage>,
        request: JoinRequest,
    ) -> Result<(), ErrorCode> {
        if !validate_nickname(&request.nickname) {
            return Err(ErrorCode::InvalidNickname);
        }
        if self.session.is_full() {
            return Err(ErrorCode::RoomIsFull);
        }
        if self.moderation.is_banned(request.account.as_deref(), ip) {
            return Err(ErrorCode::Banned);
        }
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ErrorCode::VersionMismatch);
        }
        if !self.session.room().verify_password(request.password.as_deref()) {
            return Err(ErrorCode::IncorrectPassword);
        }

        self.session.add_member(Member {
            id: client_id,
            nickname: request.nickname,
            hardware_address: request.hardware_address,
            device_id: request.device_id,
            account: request.account,
            ip,
            current_game: request.current_game,
            sender,
        })?;
        Ok(())
    }

    /// Handle chat message
    fn handle_chat(&mut self, client_id: ClientId, text: String) {
        if text.trim().is_empty() {
            return;
        }
        if text.chars().count() > MAX_CHAT_LENGTH {
            warn!("Dropping oversized chat message from {}", client_id);
            return;
        }
        match self.session.broadcast_chat(client_id, text) {
            Some((message, lagging)) => {
                self.emit(HostEvent::Chat(message));
                self.drop_lagging(lagging);
            }
            None => warn!("Chat from {} before joining ignored", client_id),
        }
    }

    /// Handle current game update
    fn handle_set_game(&mut self, client_id: ClientId, game: Option<GameInfo>) {
        if self.session.set_current_game(client_id, game) {
            self.broadcast_roster();
        }
    }

    /// Handle voluntary leave
    fn handle_leave(&mut self, client_id: ClientId) {
        let Some(member) = self.session.remove_member(client_id) else {
            return;
        };
        info!("Member '{}' left", member.nickname);
        self.finish(member, ConnectionState::Disconnected, LeaveReason::Left);
    }

    fn handle_kick(&mut self, actor: Actor, nickname: &str) -> Result<(), ErrorCode> {
        let member = self.moderation.kick(&mut self.session, actor, nickname)?;
        let _ = member.send(ServerMessage::Kicked);
        self.finish(member, ConnectionState::Kicked, LeaveReason::Kicked);
        Ok(())
    }

    async fn handle_ban(&mut self, actor: Actor, nickname: &str) -> Result<(), ErrorCode> {
        let member = self
            .moderation
            .ban(&mut self.session, actor, nickname)
            .await?;
        let _ = member.send(ServerMessage::Banned);
        self.finish(member, ConnectionState::Banned, LeaveReason::Banned);
        Ok(())
    }

    /// Handle room teardown
    fn handle_close(&mut self) -> usize {
        let members = self.session.drain_members();
        let count = members.len();
        for member in &members {
            let _ = member.send(ServerMessage::RoomClosed);
        }
        for (client_id, conn) in self.connections.drain() {
            if conn.state == ConnectionState::Connecting {
                let _ = conn.sender.try_send(ServerMessage::RoomClosed);
            }
            debug!("Connection {} -> {:?}", client_id, ConnectionState::Disconnected);
        }
        info!(
            "Room '{}' closing after {}s, {} member(s) disconnected",
            self.session.room().name(),
            self.session.room().uptime().as_secs(),
            count
        );
        count
    }

    /// Helper: release a removed member's connection and tell the room
    fn finish(&mut self, member: Member, state: ConnectionState, reason: LeaveReason) {
        self.set_state(member.id, state);
        self.connections.remove(&member.id);
        let nickname = member.nickname.clone();
        drop(member);

        self.broadcast(ServerMessage::MemberLeft {
            nickname: nickname.clone(),
            reason,
        });
        self.broadcast_roster();
        self.emit(HostEvent::MemberLeft { nickname, reason });
    }

    /// Helper: drop members that stopped reading
    ///
    /// Dropping the queue ends the member's connection; the rest of the room
    /// sees an ordinary lost member. Notifying the room may expose further
    /// laggards, which are handled in the same pass.
    fn drop_lagging(&mut self, mut lagging: Vec<ClientId>) {
        while let Some(client_id) = lagging.pop() {
            let Some(member) = self.session.remove_member(client_id) else {
                continue;
            };
            warn!("Member '{}' is not reading, dropping", member.nickname);
            self.set_state(client_id, ConnectionState::Lost);
            self.connections.remove(&client_id);
            let nickname = member.nickname.clone();
            drop(member);

            lagging.extend(self.session.broadcast(&ServerMessage::MemberLeft {
                nickname: nickname.clone(),
                reason: LeaveReason::Lost,
            }));
            lagging.extend(self.session.broadcast(&ServerMessage::RosterChanged {
                roster: self.session.roster(),
            }));
            self.emit(HostEvent::MemberLeft {
                nickname,
                reason: LeaveReason::Lost,
            });
        }
    }

    /// Helper: deliver a moderation result to whoever asked
    fn respond<T>(&mut self, actor: Actor, reply: Reply<T>, result: Result<T, ErrorCode>) {
        match (reply, actor) {
            (Some(reply), _) => {
                let _ = reply.send(result);
            }
            (None, Actor::Member(id)) => {
                if let Err(code) = result {
                    self.send_to(id, code.into());
                }
            }
            (None, Actor::Host) => {}
        }
    }

    fn send_to(&mut self, client_id: ClientId, msg: ServerMessage) {
        let Some(conn) = self.connections.get(&client_id) else {
            return;
        };
        if let Err(TrySendError::Full(_)) = conn.sender.try_send(msg) {
            self.drop_lagging(vec![client_id]);
        }
    }

    fn broadcast(&mut self, msg: ServerMessage) {
        let lagging = self.session.broadcast(&msg);
        self.drop_lagging(lagging);
    }

    fn broadcast_roster(&mut self) {
        self.broadcast(ServerMessage::RosterChanged {
            roster: self.session.roster(),
        });
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room: self.session.room().info(),
            roster: self.session.roster(),
            next_sequence: self.session.next_sequence(),
        }
    }

    fn set_state(&mut self, client_id: ClientId, next: ConnectionState) {
        let Some(conn) = self.connections.get_mut(&client_id) else {
            return;
        };
        if conn.state.can_transition_to(next) {
            debug!("Connection {} {:?} -> {:?}", client_id, conn.state, next);
            conn.state = next;
        } else {
            warn!(
                "Illegal transition {:?} -> {:?} for {}",
                conn.state, next, client_id
            );
        }
    }

    /// Host events are best effort; a slow host never stalls the room
    fn emit(&self, event: HostEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                debug!("Host event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::ban_list::BanList;
    use crate::room::{Room, RoomSettings};

    struct Harness {
        cmd_tx: mpsc::Sender<ServerCommand>,
    }

    impl Harness {
        fn start(settings: RoomSettings) -> Self {
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let session = SessionState::new(Room::new(settings));
            let moderation = ModerationController::new(BanList::new(), vec!["trusted".to_string()]);
            tokio::spawn(RoomServer::new(session, moderation, cmd_rx, None).run());
            Self { cmd_tx }
        }

        async fn connect(&self, ip_last: u8) -> (ClientId, mpsc::Receiver<ServerMessage>) {
            self.connect_with_queue(ip_last, 64).await
        }

        async fn connect_with_queue(
            &self,
            ip_last: u8,
            queue: usize,
        ) -> (ClientId, mpsc::Receiver<ServerMessage>) {
            let (tx, rx) = mpsc::channel(queue);
            let client_id = ClientId::new();
            self.cmd_tx
                .send(ServerCommand::Connect {
                    client_id,
                    ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, ip_last)),
                    sender: tx,
                })
                .await
                .unwrap();
            (client_id, rx)
        }

        async fn join(
            &self,
            nickname: &str,
            n: u8,
            account: Option<&str>,
        ) -> (ClientId, mpsc::Receiver<ServerMessage>, ServerMessage) {
            let (client_id, mut rx) = self.connect(n).await;
            self.cmd_tx
                .send(ServerCommand::Join {
                    client_id,
                    request: request(nickname, n, account),
                })
                .await
                .unwrap();
            let first = rx.recv().await.unwrap();
            (client_id, rx, first)
        }

        async fn kick(&self, nickname: &str) -> Result<(), ErrorCode> {
            let (tx, rx) = oneshot::channel();
            self.cmd_tx
                .send(ServerCommand::Kick {
                    actor: Actor::Host,
                    nickname: nickname.to_string(),
                    reply: Some(tx),
                })
                .await
                .unwrap();
            rx.await.unwrap()
        }

        async fn snapshot(&self) -> RoomSnapshot {
            let (tx, rx) = oneshot::channel();
            self.cmd_tx
                .send(ServerCommand::Snapshot { reply: tx })
                .await
                .unwrap();
            rx.await.unwrap()
        }
    }

    fn settings() -> RoomSettings {
        RoomSettings {
            name: "TestRoom1".to_string(),
            preferred_game: Some(GameInfo::new("Puzzle League", 1)),
            ..Default::default()
        }
    }

    fn request(nickname: &str, n: u8, account: Option<&str>) -> JoinRequest {
        JoinRequest {
            nickname: nickname.to_string(),
            hardware_address: MacAddress([2, 0, 0, 0, 0, n]),
            device_id: DeviceId(u64::from(n)),
            account: account.map(str::to_string),
            password: None,
            protocol_version: PROTOCOL_VERSION,
            current_game: None,
        }
    }

    fn rejection(msg: &ServerMessage) -> Option<ErrorCode> {
        match msg {
            ServerMessage::JoinRejected { code } => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_join_success_sends_roster_and_cursor() {
        let server = Harness::start(settings());
        let (id, mut rx, first) = server.join("Alice1", 1, None).await;

        match first {
            ServerMessage::JoinSuccess {
                member_id,
                roster,
                next_sequence,
                room,
            } => {
                assert_eq!(member_id, id);
                assert_eq!(roster.len(), 1);
                assert_eq!(roster[0].nickname, "Alice1");
                assert_eq!(next_sequence, 0);
                assert_eq!(room.name, "TestRoom1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::MemberJoined { nickname }) if nickname == "Alice1"
        ));
        assert!(matches!(rx.recv().await, Some(ServerMessage::RosterChanged { .. })));
    }

    #[tokio::test]
    async fn test_join_sequence_order() {
        let mut full = settings();
        full.max_players = 1;
        full.password = Some("secret".to_string());
        let server = Harness::start(full);
        server.join("Alice1", 1, Some("alice")).await;

        // Room full wins over the wrong password and version
        let (client_id, mut rx) = server.connect(2).await;
        let mut req = request("Bob1", 2, None);
        req.protocol_version = PROTOCOL_VERSION + 1;
        server
            .cmd_tx
            .send(ServerCommand::Join { client_id, request: req })
            .await
            .unwrap();
        assert_eq!(rejection(&rx.recv().await.unwrap()), Some(ErrorCode::RoomIsFull));
        // Rejected connections are closed
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_version_then_password() {
        let mut locked = settings();
        locked.password = Some("secret".to_string());
        let server = Harness::start(locked);

        let (client_id, mut rx) = server.connect(1).await;
        let mut req = request("Alice1", 1, None);
        req.protocol_version = PROTOCOL_VERSION + 1;
        server
            .cmd_tx
            .send(ServerCommand::Join { client_id, request: req })
            .await
            .unwrap();
        assert_eq!(rejection(&rx.recv().await.unwrap()), Some(ErrorCode::VersionMismatch));

        let (client_id, mut rx) = server.connect(1).await;
        server
            .cmd_tx
            .send(ServerCommand::Join {
                client_id,
                request: request("Alice1", 1, None),
            })
            .await
            .unwrap();
        assert_eq!(rejection(&rx.recv().await.unwrap()), Some(ErrorCode::IncorrectPassword));

        let (client_id, mut rx) = server.connect(1).await;
        let mut req = request("Alice1", 1, None);
        req.password = Some("secret".to_string());
        server
            .cmd_tx
            .send(ServerCommand::Join { client_id, request: req })
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::JoinSuccess { .. })));
    }

    #[tokio::test]
    async fn test_identity_conflicts() {
        let server = Harness::start(settings());
        server.join("Alice1", 1, None).await;

        let (_, _, first) = server.join("Alice1", 2, None).await;
        assert_eq!(rejection(&first), Some(ErrorCode::NicknameInUse));

        let (client_id, mut rx) = server.connect(3).await;
        let mut req = request("Carol1", 3, None);
        req.hardware_address = MacAddress([2, 0, 0, 0, 0, 1]);
        server
            .cmd_tx
            .send(ServerCommand::Join { client_id, request: req })
            .await
            .unwrap();
        assert_eq!(
            rejection(&rx.recv().await.unwrap()),
            Some(ErrorCode::HardwareAddressInUse)
        );

        let (client_id, mut rx) = server.connect(4).await;
        let mut req = request("Dave1", 4, None);
        req.device_id = DeviceId(1);
        server
            .cmd_tx
            .send(ServerCommand::Join { client_id, request: req })
            .await
            .unwrap();
        assert_eq!(
            rejection(&rx.recv().await.unwrap()),
            Some(ErrorCode::DeviceIdConflict)
        );

        assert_eq!(server.snapshot().await.roster.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_nickname_rejected_by_host() {
        let server = Harness::start(settings());
        let (_, _, first) = server.join("Al", 1, None).await;
        assert_eq!(rejection(&first), Some(ErrorCode::InvalidNickname));
    }

    #[tokio::test]
    async fn test_kick_notifies_and_allows_rejoin() {
        let server = Harness::start(settings());
        let (_, mut alice_rx, _) = server.join("Alice1", 1, None).await;
        let (_, mut bob_rx, _) = server.join("Bob1", 2, None).await;

        server.kick("Alice1").await.unwrap();

        let mut saw_kicked = false;
        while let Some(msg) = alice_rx.recv().await {
            if matches!(msg, ServerMessage::Kicked) {
                saw_kicked = true;
            }
        }
        assert!(saw_kicked);

        let mut saw_left = false;
        while let Ok(msg) = bob_rx.try_recv() {
            if let ServerMessage::MemberLeft { nickname, reason } = msg {
                assert_eq!(nickname, "Alice1");
                assert_eq!(reason, LeaveReason::Kicked);
                saw_left = true;
            }
        }
        assert!(saw_left);

        assert_eq!(server.kick("Alice1").await, Err(ErrorCode::UserNotFound));

        let (_, _, first) = server.join("Alice1", 1, None).await;
        assert!(matches!(first, ServerMessage::JoinSuccess { .. }));
    }

    #[tokio::test]
    async fn test_member_moderation_permission() {
        let server = Harness::start(settings());
        let (alice, mut alice_rx, _) = server.join("Alice1", 1, Some("alice")).await;
        server.join("Bob1", 2, None).await;

        server
            .cmd_tx
            .send(ServerCommand::Kick {
                actor: Actor::Member(alice),
                nickname: "Bob1".to_string(),
                reply: None,
            })
            .await
            .unwrap();

        loop {
            match alice_rx.recv().await {
                Some(ServerMessage::Error { code, .. }) => {
                    assert_eq!(code, ErrorCode::InsufficientPermission);
                    break;
                }
                Some(ServerMessage::Kicked) | None => panic!("Alice1 was disconnected"),
                Some(_) => continue,
            }
        }
        assert_eq!(server.snapshot().await.roster.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_lost() {
        let server = Harness::start(settings());
        let (alice, _alice_rx, _) = server.join("Alice1", 1, None).await;
        let (_, mut bob_rx, _) = server.join("Bob1", 2, None).await;

        server
            .cmd_tx
            .send(ServerCommand::Disconnect { client_id: alice })
            .await
            .unwrap();

        let reason = loop {
            match bob_rx.recv().await {
                Some(ServerMessage::MemberLeft { reason, .. }) => break reason,
                Some(_) => continue,
                None => panic!("Bob1 channel closed"),
            }
        };
        assert_eq!(reason, LeaveReason::Lost);
        assert_eq!(server.snapshot().await.roster.len(), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_everyone() {
        let server = Harness::start(settings());
        let (_, mut alice_rx, _) = server.join("Alice1", 1, None).await;
        let (_, mut pending_rx) = server.connect(9).await;

        let (tx, rx) = oneshot::channel();
        server
            .cmd_tx
            .send(ServerCommand::Close { reply: tx })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), 1);

        let mut closed = false;
        while let Some(msg) = alice_rx.recv().await {
            closed |= matches!(msg, ServerMessage::RoomClosed);
        }
        assert!(closed);
        assert!(matches!(pending_rx.recv().await, Some(ServerMessage::RoomClosed)));
        assert!(pending_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_member_that_never_reads_is_dropped() {
        let server = Harness::start(settings());

        // Room for the join traffic and a few chats, never drained
        let (stalled, _stalled_rx) = server.connect_with_queue(1, 8).await;
        server
            .cmd_tx
            .send(ServerCommand::Join {
                client_id: stalled,
                request: request("Alice1", 1, None),
            })
            .await
            .unwrap();
        let (bob, mut bob_rx, _) = server.join("Bob1", 2, None).await;

        for n in 0..20 {
            server
                .cmd_tx
                .send(ServerCommand::Chat {
                    client_id: bob,
                    text: format!("message {}", n),
                })
                .await
                .unwrap();
        }

        let snapshot = tokio::time::timeout(std::time::Duration::from_secs(1), server.snapshot())
            .await
            .expect("room stalled behind a member that never reads");
        let names: Vec<_> = snapshot.roster.iter().map(|m| m.nickname.as_str()).collect();
        assert_eq!(names, vec!["Bob1"]);

        let reason = loop {
            match bob_rx.recv().await {
                Some(ServerMessage::MemberLeft { nickname, reason }) if nickname == "Alice1" => {
                    break reason
                }
                Some(_) => continue,
                None => panic!("Bob1 channel closed"),
            }
        };
        assert_eq!(reason, LeaveReason::Lost);

        let (tx, rx) = oneshot::channel();
        server
            .cmd_tx
            .send(ServerCommand::Close { reply: tx })
            .await
            .unwrap();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .expect("close reply timed out");
        assert_eq!(closed.unwrap(), 1);
    }
}
