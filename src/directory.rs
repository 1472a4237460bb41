//! Lobby directory
//!
//! Public room listing. `LobbyDirectory` is the client used by hosts (announce,
//! delist) and by players (query). `DirectoryServer` is an in-memory directory
//! speaking the same JSON-over-WebSocket protocol; it checks announce
//! credentials against an account table and expires rooms that stop
//! re-announcing.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{AnnounceError, AppError, DirectoryError};
use crate::types::GameInfo;
use crate::validation::validate_room_name;

/// Default time limit for one directory exchange
pub const DEFAULT_DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Rooms not re-announced within this window disappear from queries
pub const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(60);

/// Lobby entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub name: String,
    pub description: String,
    pub preferred_game: Option<GameInfo>,
    /// Username of the host; filled in by the directory from the credential
    pub host: String,
    /// Address clients should connect to; empty means "the announcer's IP"
    pub address: String,
    pub port: u16,
    pub player_count: usize,
    pub max_players: usize,
    pub has_password: bool,
    pub members: Vec<String>,
}

impl RoomSummary {
    pub fn is_full(&self) -> bool {
        self.player_count >= self.max_players
    }
}

/// Lobby filters
#[derive(Debug, Clone, Default)]
pub struct LobbyFilter {
    /// Only rooms whose preferred game id is in `owned_games`
    pub owned_games_only: bool,
    pub owned_games: HashSet<u64>,
    pub hide_full: bool,
}

impl LobbyFilter {
    pub fn matches(&self, room: &RoomSummary) -> bool {
        if self.hide_full && room.is_full() {
            return false;
        }
        if self.owned_games_only {
            let owned = room
                .preferred_game
                .as_ref()
                .map(|game| self.owned_games.contains(&game.id))
                .unwrap_or(false);
            if !owned {
                return false;
            }
        }
        true
    }
}

/// Directory request, one per text frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryRequest {
    Announce { credential: String, room: RoomSummary },
    /// An empty `address` means the address the directory sees
    Delist {
        credential: String,
        address: String,
        port: u16,
    },
    Query,
    /// Resolve a credential to its account username
    Verify { credential: String },
}

/// Why the directory refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryRejection {
    /// Unknown credential, or the room belongs to another account
    Unauthorized,
    InvalidRoom,
    NotFound,
    InvalidRequest,
}

/// Directory response, one per request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryResponse {
    Announced,
    Delisted,
    Rooms { rooms: Vec<RoomSummary> },
    Account { username: String },
    Error { reason: DirectoryRejection },
}

/// Directory client
///
/// Every call opens a short-lived connection, so a dead directory never holds
/// resources between calls.
#[derive(Debug, Clone)]
pub struct LobbyDirectory {
    url: String,
    credential: Option<String>,
    timeout: Duration,
}

impl LobbyDirectory {
    /// `url` is a WebSocket URL such as `ws://lobby.example.org:5000`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: None,
            timeout: DEFAULT_DIRECTORY_TIMEOUT,
        }
    }

    /// Account credential required for announcing
    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential.filter(|c| !c.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish or refresh a room listing
    pub async fn announce(&self, room: &RoomSummary) -> Result<(), AnnounceError> {
        let credential = self.credential.clone().ok_or(AnnounceError::NoAccount)?;
        let response = self
            .request(&DirectoryRequest::Announce {
                credential,
                room: room.clone(),
            })
            .await
            .map_err(|e| AnnounceError::CommunicationError(e.to_string()))?;
        match response {
            DirectoryResponse::Announced => Ok(()),
            DirectoryResponse::Error {
                reason: DirectoryRejection::Unauthorized,
            } => Err(AnnounceError::NoAccount),
            other => Err(AnnounceError::CommunicationError(format!(
                "unexpected reply {:?}",
                other
            ))),
        }
    }

    /// Remove the listing announced for `address:port`
    ///
    /// Pass the address exactly as announced; empty means "as seen by the
    /// directory".
    pub async fn delist(&self, address: &str, port: u16) -> Result<(), AnnounceError> {
        let credential = self.credential.clone().ok_or(AnnounceError::NoAccount)?;
        let response = self
            .request(&DirectoryRequest::Delist {
                credential,
                address: address.to_string(),
                port,
            })
            .await
            .map_err(|e| AnnounceError::CommunicationError(e.to_string()))?;
        match response {
            DirectoryResponse::Delisted
            | DirectoryResponse::Error {
                reason: DirectoryRejection::NotFound,
            } => Ok(()),
            DirectoryResponse::Error {
                reason: DirectoryRejection::Unauthorized,
            } => Err(AnnounceError::NoAccount),
            other => Err(AnnounceError::CommunicationError(format!(
                "unexpected reply {:?}",
                other
            ))),
        }
    }

    /// List public rooms in directory order, filtered locally
    pub async fn query(&self, filter: &LobbyFilter) -> Result<Vec<RoomSummary>, DirectoryError> {
        match self.request(&DirectoryRequest::Query).await? {
            DirectoryResponse::Rooms { rooms } => {
                Ok(rooms.into_iter().filter(|r| filter.matches(r)).collect())
            }
            other => Err(DirectoryError::Protocol(format!("{:?}", other))),
        }
    }

    /// Resolve a member's credential to an account username
    ///
    /// `Ok(None)` when the directory does not know the credential.
    pub async fn verify(&self, credential: &str) -> Result<Option<String>, DirectoryError> {
        let request = DirectoryRequest::Verify {
            credential: credential.to_string(),
        };
        match self.request(&request).await? {
            DirectoryResponse::Account { username } => Ok(Some(username)),
            DirectoryResponse::Error {
                reason: DirectoryRejection::Unauthorized,
            } => Ok(None),
            other => Err(DirectoryError::Protocol(format!("{:?}", other))),
        }
    }

    async fn request(&self, request: &DirectoryRequest) -> Result<DirectoryResponse, DirectoryError> {
        timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| DirectoryError::Timeout)?
    }

    async fn exchange(&self, request: &DirectoryRequest) -> Result<DirectoryResponse, DirectoryError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;

        let json = serde_json::to_string(request).map_err(|e| DirectoryError::Protocol(e.to_string()))?;
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;

        while let Some(msg) = ws.next().await {
            match msg.map_err(|e| DirectoryError::Unreachable(e.to_string()))? {
                Message::Text(text) => {
                    let response = serde_json::from_str::<DirectoryResponse>(&text)
                        .map_err(|e| DirectoryError::Protocol(e.to_string()))?;
                    let _ = ws.close(None).await;
                    return Ok(response);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(DirectoryError::Unreachable("connection closed before reply".to_string()))
    }
}

/// A listing and who owns it
#[derive(Debug)]
struct Listing {
    owner: String,
    summary: RoomSummary,
    refreshed: Instant,
}

/// Commands sent from directory connection handlers to the directory actor
#[derive(Debug)]
pub struct DirectoryCommand {
    pub peer: IpAddr,
    pub request: DirectoryRequest,
    pub reply: oneshot::Sender<DirectoryResponse>,
}

/// In-memory directory actor
pub struct DirectoryServer {
    /// Credential -> account username
    accounts: HashMap<String, String>,
    /// Listings in first-announce order
    listings: Vec<Listing>,
    ttl: Duration,
    receiver: mpsc::Receiver<DirectoryCommand>,
}

impl DirectoryServer {
    pub fn new(
        accounts: HashMap<String, String>,
        ttl: Duration,
        receiver: mpsc::Receiver<DirectoryCommand>,
    ) -> Self {
        Self {
            accounts,
            listings: Vec::new(),
            ttl,
            receiver,
        }
    }

    /// Run the directory event loop until all senders are dropped
    pub async fn run(mut self) {
        info!("Directory started with {} account(s)", self.accounts.len());
        while let Some(cmd) = self.receiver.recv().await {
            let response = self.handle(cmd.peer, cmd.request);
            let _ = cmd.reply.send(response);
        }
        info!("Directory shutting down");
    }

    fn handle(&mut self, peer: IpAddr, request: DirectoryRequest) -> DirectoryResponse {
        self.expire();
        match request {
            DirectoryRequest::Announce { credential, room } => self.announce(peer, &credential, room),
            DirectoryRequest::Delist {
                credential,
                address,
                port,
            } => self.delist(peer, &credential, address, port),
            DirectoryRequest::Query => DirectoryResponse::Rooms {
                rooms: self.listings.iter().map(|l| l.summary.clone()).collect(),
            },
            DirectoryRequest::Verify { credential } => match self.accounts.get(&credential) {
                Some(username) => DirectoryResponse::Account {
                    username: username.clone(),
                },
                None => rejection(DirectoryRejection::Unauthorized),
            },
        }
    }

    fn announce(&mut self, peer: IpAddr, credential: &str, mut room: RoomSummary) -> DirectoryResponse {
        let Some(owner) = self.accounts.get(credential).cloned() else {
            warn!("Announce from {} with unknown credential", peer);
            return rejection(DirectoryRejection::Unauthorized);
        };
        if !validate_room_name(&room.name) || room.max_players == 0 {
            return rejection(DirectoryRejection::InvalidRoom);
        }
        if room.address.is_empty() {
            room.address = peer.to_string();
        }
        room.host = owner.clone();

        let existing = self
            .listings
            .iter_mut()
            .find(|l| l.summary.address == room.address && l.summary.port == room.port);
        match existing {
            Some(listing) if listing.owner != owner => rejection(DirectoryRejection::Unauthorized),
            Some(listing) => {
                debug!("Refreshed listing '{}'", room.name);
                listing.summary = room;
                listing.refreshed = Instant::now();
                DirectoryResponse::Announced
            }
            None => {
                info!("Listed room '{}' at {}:{} for {}", room.name, room.address, room.port, owner);
                self.listings.push(Listing {
                    owner,
                    summary: room,
                    refreshed: Instant::now(),
                });
                DirectoryResponse::Announced
            }
        }
    }

    fn delist(&mut self, peer: IpAddr, credential: &str, mut address: String, port: u16) -> DirectoryResponse {
        let Some(owner) = self.accounts.get(credential) else {
            return rejection(DirectoryRejection::Unauthorized);
        };
        if address.is_empty() {
            address = peer.to_string();
        }
        let before = self.listings.len();
        self.listings.retain(|l| {
            !(l.owner == *owner && l.summary.address == address && l.summary.port == port)
        });
        if self.listings.len() < before {
            info!("Delisted room of {} at {}:{}", owner, address, port);
            DirectoryResponse::Delisted
        } else {
            rejection(DirectoryRejection::NotFound)
        }
    }

    fn expire(&mut self) {
        let ttl = self.ttl;
        self.listings.retain(|l| l.refreshed.elapsed() < ttl);
    }
}

fn rejection(reason: DirectoryRejection) -> DirectoryResponse {
    DirectoryResponse::Error { reason }
}

/// Accept directory connections forever
///
/// Spawns the directory actor and one handler task per connection.
pub async fn serve_directory(
    listener: TcpListener,
    accounts: HashMap<String, String>,
    ttl: Duration,
) -> Result<(), AppError> {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    tokio::spawn(DirectoryServer::new(accounts, ttl, cmd_rx).run());
    info!("Directory listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let cmd_tx = cmd_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_directory_connection(stream, cmd_tx).await {
                        debug!("Directory connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept directory connection: {}", e);
            }
        }
    }
}

async fn handle_directory_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<DirectoryCommand>,
) -> Result<(), AppError> {
    let peer = stream
        .peer_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    while let Some(msg) = ws.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let response = match serde_json::from_str::<DirectoryRequest>(&text) {
            Ok(request) => {
                let (reply, rx) = oneshot::channel();
                cmd_tx
                    .send(DirectoryCommand {
                        peer,
                        request,
                        reply,
                    })
                    .await
                    .map_err(|_| AppError::ChannelSend)?;
                rx.await.map_err(|_| AppError::ChannelSend)?
            }
            Err(e) => {
                warn!("Invalid directory request from {}: {}", peer, e);
                rejection(DirectoryRejection::InvalidRequest)
            }
        };
        let json = serde_json::to_string(&response)?;
        ws.send(Message::Text(json.into())).await?;
    }
    Ok(())
}
