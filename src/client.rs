//! Room client
//!
//! Connects to a room server, joins, and turns server messages into
//! `ClientEvent`s for the presentation layer. There is no automatic
//! reconnection: after `ConnectionLost` the caller connects again.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::ban_list::BanListEntry;
use crate::error::ErrorCode;
use crate::member::MemberInfo;
use crate::message::{ChatMessage, ClientMessage, LeaveReason, ServerMessage};
use crate::room::RoomInfo;
use crate::types::{ClientId, ConnectionState, DeviceId, GameInfo, MacAddress, PROTOCOL_VERSION};
use crate::validation::{validate_ipv4, validate_nickname, validate_port};

/// Default bound on connecting and joining
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Event queue depth towards the caller
const EVENT_BUFFER_SIZE: usize = 64;

/// Outbound queue depth towards the server
const OUTBOUND_BUFFER_SIZE: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Identifiers presented to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub hardware_address: MacAddress,
    pub device_id: DeviceId,
    /// Account credential; once the host verifies it, bans and moderator
    /// rights apply to the account
    pub credential: Option<String>,
}

impl Identity {
    /// Fresh random hardware address and device id, no account
    pub fn generate() -> Self {
        Self {
            hardware_address: MacAddress::generate(),
            device_id: DeviceId::generate(),
            credential: None,
        }
    }
}

/// Direct connect parameters
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// IPv4 address of the host
    pub address: String,
    pub port: i64,
    pub nickname: String,
    pub password: Option<String>,
    pub identity: Identity,
    pub current_game: Option<GameInfo>,
    pub timeout: Duration,
}

impl ConnectRequest {
    pub fn new(address: impl Into<String>, port: i64, nickname: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            nickname: nickname.into(),
            password: None,
            identity: Identity::generate(),
            current_game: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_game(mut self, game: GameInfo) -> Self {
        self.current_game = Some(game);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Local checks run before any network activity
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if !validate_ipv4(&self.address) {
            return Err(ErrorCode::InvalidIp);
        }
        if !validate_port(self.port) {
            return Err(ErrorCode::InvalidPort);
        }
        if !validate_nickname(&self.nickname) {
            return Err(ErrorCode::InvalidNickname);
        }
        Ok(())
    }
}

/// Events delivered to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    RosterChanged(Vec<MemberInfo>),
    ChatMessage(ChatMessage),
    MemberJoined { nickname: String },
    MemberLeft { nickname: String, reason: LeaveReason },
    Kicked,
    Banned,
    ConnectionLost,
    RoomClosed,
    BanList(Vec<BanListEntry>),
    Error(ErrorCode),
}

/// A joined room session
pub struct RoomClient {
    member_id: ClientId,
    nickname: String,
    room: RoomInfo,
    outgoing: mpsc::Sender<ClientMessage>,
    state: Arc<watch::Sender<ConnectionState>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RoomClient {
    /// Connect and join a room
    ///
    /// Validation errors return before any network activity. The whole
    /// connect-and-join exchange is bounded by `request.timeout`.
    pub async fn connect(
        request: ConnectRequest,
    ) -> Result<(RoomClient, mpsc::Receiver<ClientEvent>), ErrorCode> {
        request.validate()?;

        let state = Arc::new(watch::Sender::new(ConnectionState::Disconnected));
        transition(&state, ConnectionState::Connecting);

        let url = format!("ws://{}:{}", request.address, request.port);
        debug!("Connecting to {} as '{}'", url, request.nickname);

        let join = ClientMessage::Join {
            nickname: request.nickname.clone(),
            hardware_address: request.identity.hardware_address,
            device_id: request.identity.device_id,
            credential: request.identity.credential.clone(),
            password: request.password.clone(),
            protocol_version: PROTOCOL_VERSION,
            current_game: request.current_game.clone(),
        };

        let outcome = match timeout(request.timeout, handshake(&url, &join)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("Connecting to {} timed out", url);
                Err(ErrorCode::UnableToConnect)
            }
        };
        let (ws, welcome) = match outcome {
            Ok(joined) => joined,
            Err(code) => {
                transition(&state, ConnectionState::Disconnected);
                return Err(code);
            }
        };
        transition(&state, ConnectionState::Connected);
        info!("Joined room '{}' as '{}'", welcome.room.name, request.nickname);

        let (ws_sender, ws_receiver) = ws.split();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);

        // Initial roster so the caller can render without waiting
        let _ = events_tx
            .send(ClientEvent::RosterChanged(welcome.roster.clone()))
            .await;

        let writer = tokio::spawn(write_loop(ws_sender, outgoing_rx));
        let reader = tokio::spawn(read_loop(
            ws_receiver,
            events_tx,
            state.clone(),
            welcome.next_sequence,
        ));

        Ok((
            RoomClient {
                member_id: welcome.member_id,
                nickname: request.nickname,
                room: welcome.room,
                outgoing,
                state,
                reader,
                writer,
            },
            events_rx,
        ))
    }

    pub fn member_id(&self) -> ClientId {
        self.member_id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn room(&self) -> &RoomInfo {
        &self.room
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ErrorCode> {
        self.send(ClientMessage::Chat { text: text.into() }).await
    }

    pub async fn set_game(&self, game: Option<GameInfo>) -> Result<(), ErrorCode> {
        self.send(ClientMessage::SetGame { game }).await
    }

    /// Moderator only; failures arrive as `ClientEvent::Error`
    pub async fn kick(&self, nickname: impl Into<String>) -> Result<(), ErrorCode> {
        self.send(ClientMessage::Kick {
            nickname: nickname.into(),
        })
        .await
    }

    /// Moderator only; failures arrive as `ClientEvent::Error`
    pub async fn ban(&self, nickname: impl Into<String>) -> Result<(), ErrorCode> {
        self.send(ClientMessage::Ban {
            nickname: nickname.into(),
        })
        .await
    }

    /// Moderator only; failures arrive as `ClientEvent::Error`
    pub async fn unban(&self, entry: BanListEntry) -> Result<(), ErrorCode> {
        self.send(ClientMessage::Unban { entry }).await
    }

    /// Moderator only; the list arrives as `ClientEvent::BanList`
    pub async fn request_ban_list(&self) -> Result<(), ErrorCode> {
        self.send(ClientMessage::RequestBanList).await
    }

    /// Leave the room and close the connection
    ///
    /// Safe to call more than once; a session that already ended is left as is.
    pub async fn disconnect(&mut self) {
        if self.state() == ConnectionState::Connected {
            let _ = self.outgoing.send(ClientMessage::Leave).await;
            transition(&self.state, ConnectionState::Disconnected);
            if timeout(Duration::from_secs(2), &mut self.writer).await.is_err() {
                self.writer.abort();
            }
            info!("Left room '{}'", self.room.name);
        }
        self.reader.abort();
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ErrorCode> {
        if self.state() != ConnectionState::Connected {
            return Err(ErrorCode::ConnectionLost);
        }
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| ErrorCode::ConnectionLost)
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// What the server hands a member on join
struct Welcome {
    member_id: ClientId,
    room: RoomInfo,
    roster: Vec<MemberInfo>,
    next_sequence: u64,
}

/// Open the socket, send the join and wait for the verdict
async fn handshake(url: &str, join: &ClientMessage) -> Result<(WsStream, Welcome), ErrorCode> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| connect_error_code(&e))?;

    let json = serde_json::to_string(join).map_err(|_| ErrorCode::UnknownError)?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| connect_error_code(&e))?;

    while let Some(msg) = ws.next().await {
        let text = match msg.map_err(|e| connect_error_code(&e))? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        return match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::JoinSuccess {
                member_id,
                room,
                roster,
                next_sequence,
            }) => Ok((
                ws,
                Welcome {
                    member_id,
                    room,
                    roster,
                    next_sequence,
                },
            )),
            Ok(ServerMessage::JoinRejected { code }) => {
                debug!("Join rejected: {:?}", code);
                Err(code)
            }
            Ok(ServerMessage::RoomClosed) => Err(ErrorCode::UnableToConnect),
            Ok(other) => {
                warn!("Unexpected reply to join: {:?}", other);
                Err(ErrorCode::UnknownError)
            }
            Err(e) => {
                warn!("Invalid reply to join: {}", e);
                Err(ErrorCode::UnknownError)
            }
        };
    }
    Err(ErrorCode::UnableToConnect)
}

fn connect_error_code(err: &tungstenite::Error) -> ErrorCode {
    match err {
        tungstenite::Error::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NetworkUnreachable | io::ErrorKind::NetworkDown
            ) =>
        {
            ErrorCode::NoInternetConnection
        }
        _ => ErrorCode::UnableToConnect,
    }
}

/// Apply a state change if the state machine allows it
fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Outbound messages -> WebSocket; closes the socket after `Leave`
async fn write_loop(mut ws_sender: SplitSink<WsStream, Message>, mut outgoing: mpsc::Receiver<ClientMessage>) {
    while let Some(msg) = outgoing.recv().await {
        let leaving = matches!(msg, ClientMessage::Leave);
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    debug!("WebSocket send failed, ending write task");
                    break;
                }
            }
            Err(e) => warn!("Failed to serialize message: {}", e),
        }
        if leaving {
            break;
        }
    }
    let _ = ws_sender.close().await;
}

/// WebSocket -> events, tracking the connection state
async fn read_loop(
    mut ws_receiver: SplitStream<WsStream>,
    events: mpsc::Sender<ClientEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    mut next_sequence: u64,
) {
    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        };
        let server_msg = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Invalid message from server: {}", e);
                continue;
            }
        };
        let Some(event) = translate(server_msg, &state, &mut next_sequence) else {
            continue;
        };
        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, ending read task");
            break;
        }
    }

    // Only a session that was still live counts as lost
    if transition(&state, ConnectionState::Lost) {
        info!("Connection to room lost");
        let _ = events.send(ClientEvent::ConnectionLost).await;
    }
}

/// Map one server message to the event the caller sees
fn translate(
    msg: ServerMessage,
    state: &watch::Sender<ConnectionState>,
    next_sequence: &mut u64,
) -> Option<ClientEvent> {
    match msg {
        ServerMessage::RosterChanged { roster } => Some(ClientEvent::RosterChanged(roster)),
        ServerMessage::MemberJoined { nickname } => Some(ClientEvent::MemberJoined { nickname }),
        ServerMessage::MemberLeft { nickname, reason } => {
            Some(ClientEvent::MemberLeft { nickname, reason })
        }
        ServerMessage::Chat(message) => {
            if message.sequence < *next_sequence {
                warn!(
                    "Dropping out of order chat message {} (expected >= {})",
                    message.sequence, next_sequence
                );
                return None;
            }
            *next_sequence = message.sequence + 1;
            Some(ClientEvent::ChatMessage(message))
        }
        ServerMessage::Kicked => {
            transition(state, ConnectionState::Kicked);
            Some(ClientEvent::Kicked)
        }
        ServerMessage::Banned => {
            transition(state, ConnectionState::Banned);
            Some(ClientEvent::Banned)
        }
        ServerMessage::RoomClosed => {
            transition(state, ConnectionState::Disconnected);
            Some(ClientEvent::RoomClosed)
        }
        ServerMessage::BanList { entries } => Some(ClientEvent::BanList(entries)),
        ServerMessage::Error { code, .. } => Some(ClientEvent::Error(code)),
        ServerMessage::JoinSuccess { .. } | ServerMessage::JoinRejected { .. } => {
            warn!("Ignoring join reply outside of the handshake");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> watch::Sender<ConnectionState> {
        watch::Sender::new(ConnectionState::Connected)
    }

    fn chat(sequence: u64) -> ServerMessage {
        ServerMessage::Chat(ChatMessage {
            sequence,
            sender: "Alice1".to_string(),
            text: format!("message {}", sequence),
        })
    }

    #[test]
    fn test_request_validation_order() {
        assert_eq!(
            ConnectRequest::new("999.999.999.999", 24872, "Bob").validate(),
            Err(ErrorCode::InvalidIp)
        );
        assert_eq!(
            ConnectRequest::new("127.0.0.1", 70000, "Bob").validate(),
            Err(ErrorCode::InvalidPort)
        );
        assert_eq!(
            ConnectRequest::new("127.0.0.1", 24872, "Bob").validate(),
            Err(ErrorCode::InvalidNickname)
        );
        assert_eq!(ConnectRequest::new("127.0.0.1", 24872, "Bobby").validate(), Ok(()));
    }

    #[tokio::test]
    async fn test_invalid_ip_fails_without_network() {
        let result = RoomClient::connect(ConnectRequest::new("999.999.999.999", 24872, "Bob")).await;
        assert_eq!(result.err(), Some(ErrorCode::InvalidIp));
    }

    #[test]
    fn test_chat_order_is_enforced() {
        let state = connected();
        let mut next = 5;

        assert!(translate(chat(4), &state, &mut next).is_none());
        assert!(matches!(
            translate(chat(5), &state, &mut next),
            Some(ClientEvent::ChatMessage(m)) if m.sequence == 5
        ));
        assert!(translate(chat(5), &state, &mut next).is_none());
        assert!(translate(chat(6), &state, &mut next).is_some());
        assert_eq!(next, 7);
    }

    #[test]
    fn test_kick_is_terminal() {
        let state = connected();
        let mut next = 0;

        assert_eq!(
            translate(ServerMessage::Kicked, &state, &mut next),
            Some(ClientEvent::Kicked)
        );
        assert_eq!(*state.borrow(), ConnectionState::Kicked);

        // A later socket drop must not turn into ConnectionLost
        assert!(!transition(&state, ConnectionState::Lost));
        assert_eq!(*state.borrow(), ConnectionState::Kicked);
    }

    #[test]
    fn test_room_closed_is_not_lost() {
        let state = connected();
        let mut next = 0;
        assert_eq!(
            translate(ServerMessage::RoomClosed, &state, &mut next),
            Some(ClientEvent::RoomClosed)
        );
        assert!(!transition(&state, ConnectionState::Lost));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = ConnectRequest::new("127.0.0.1", i64::from(port), "Bobby")
            .with_timeout(Duration::from_secs(2));
        assert_eq!(
            RoomClient::connect(request).await.err(),
            Some(ErrorCode::UnableToConnect)
        );
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        // Accepts TCP but never completes the WebSocket handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let request = ConnectRequest::new("127.0.0.1", i64::from(port), "Bobby")
            .with_timeout(Duration::from_millis(300));
        assert_eq!(
            RoomClient::connect(request).await.err(),
            Some(ErrorCode::UnableToConnect)
        );
    }
}
