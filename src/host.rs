//! Room hosting
//!
//! Creates a room from a `HostConfig`: loads the ban list, binds the listener,
//! starts the `RoomServer` actor, the accept loop and (for public rooms) the
//! lobby announce loop. `RoomHandle` is the host's session object; dropping
//! it without `close` leaves the room running until the runtime stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::account::AccountService;
use crate::ban_list::{BanList, BanListEntry};
use crate::config::{DirectoryConfig, HostConfig};
use crate::directory::{LobbyDirectory, RoomSummary};
use crate::error::{AnnounceError, ErrorCode};
use crate::handler::handle_connection;
use crate::member::MemberInfo;
use crate::moderation::{Actor, ModerationController};
use crate::room::Room;
use crate::server::{HostEvent, RoomServer, RoomSnapshot, ServerCommand};
use crate::session::SessionState;
use crate::types::Visibility;

/// Channel buffer size for server commands
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Channel buffer size for host events
const EVENT_BUFFER_SIZE: usize = 256;

/// How long `close` waits for the room and for background tasks (e.g. delisting)
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Host-side session object
pub struct RoomHandle {
    cmd_tx: mpsc::Sender<ServerCommand>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Create and start a room
///
/// Returns the handle and the host event stream. Validation failures map to
/// their error codes; anything that prevents the room from starting maps to
/// `RoomCreationFailed`.
pub async fn start(config: HostConfig) -> Result<(RoomHandle, mpsc::Receiver<HostEvent>), ErrorCode> {
    config.validate()?;

    let ban_list = match (&config.ban_list_path, config.load_previous_ban_list) {
        (Some(path), true) => BanList::load(path).await.map_err(|e| {
            error!("Failed to load ban list {}: {}", path.display(), e);
            ErrorCode::RoomCreationFailed
        })?,
        (Some(path), false) => BanList::with_path(path),
        (None, _) => BanList::new(),
    };
    info!("Starting room with {} ban entries", ban_list.len());

    let listener = TcpListener::bind((config.bind_address, config.room.port))
        .await
        .map_err(|e| {
            error!("Failed to bind {}:{}: {}", config.bind_address, config.room.port, e);
            ErrorCode::RoomCreationFailed
        })?;
    let local_addr = listener.local_addr().map_err(|_| ErrorCode::RoomCreationFailed)?;

    let mut settings = config.room.clone();
    settings.port = local_addr.port();
    let visibility = settings.visibility;
    let session = SessionState::new(Room::new(settings));
    let moderation = ModerationController::new(ban_list, config.moderators.clone());

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        RoomServer::new(session, moderation, cmd_rx, Some(event_tx.clone())).run(),
    ));
    let accounts = Arc::new(config.account_service());
    tasks.push(tokio::spawn(accept_loop(
        listener,
        cmd_tx.clone(),
        accounts,
        config.join_timeout,
        shutdown_rx.clone(),
    )));

    match (&config.directory, visibility) {
        (Some(directory), Visibility::Public) => {
            tasks.push(tokio::spawn(announce_loop(
                directory.clone(),
                config.username.clone(),
                cmd_tx.clone(),
                event_tx,
                shutdown_rx,
            )));
        }
        (None, Visibility::Public) => {
            warn!("Public room without a lobby directory; it will not be listed");
        }
        _ => {}
    }

    info!("Room '{}' listening on {}", config.room.name, local_addr);

    Ok((
        RoomHandle {
            cmd_tx,
            local_addr,
            shutdown,
            tasks,
        },
        event_rx,
    ))
}

impl RoomHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn kick(&self, nickname: &str) -> Result<(), ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Kick {
            actor: Actor::Host,
            nickname: nickname.to_string(),
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ErrorCode::UnknownError)?
    }

    pub async fn ban(&self, nickname: &str) -> Result<(), ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Ban {
            actor: Actor::Host,
            nickname: nickname.to_string(),
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ErrorCode::UnknownError)?
    }

    pub async fn unban(&self, entry: BanListEntry) -> Result<(), ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Unban {
            actor: Actor::Host,
            entry,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ErrorCode::UnknownError)?
    }

    pub async fn ban_list(&self) -> Result<Vec<BanListEntry>, ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::BanList {
            actor: Actor::Host,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ErrorCode::UnknownError)?
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, ErrorCode> {
        request_snapshot(&self.cmd_tx).await
    }

    pub async fn roster(&self) -> Result<Vec<MemberInfo>, ErrorCode> {
        Ok(self.snapshot().await?.roster)
    }

    /// Close the room
    ///
    /// Every member is told the room closed and disconnected, the listener
    /// stops and a public listing is removed. Returns the number of members
    /// that were connected.
    pub async fn close(self) -> usize {
        let (reply, rx) = oneshot::channel();
        let request = async {
            self.cmd_tx.send(ServerCommand::Close { reply }).await.ok()?;
            rx.await.ok()
        };
        let count = match tokio::time::timeout(SHUTDOWN_GRACE, request).await {
            Ok(count) => count.unwrap_or(0),
            Err(_) => {
                warn!("Room did not acknowledge close in time");
                0
            }
        };
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                debug!("Background task did not stop in time");
            }
        }
        count
    }

    async fn send(&self, cmd: ServerCommand) -> Result<(), ErrorCode> {
        self.cmd_tx.send(cmd).await.map_err(|_| ErrorCode::UnknownError)
    }
}

async fn request_snapshot(cmd_tx: &mpsc::Sender<ServerCommand>) -> Result<RoomSnapshot, ErrorCode> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(ServerCommand::Snapshot { reply })
        .await
        .map_err(|_| ErrorCode::UnknownError)?;
    rx.await.map_err(|_| ErrorCode::UnknownError)
}

/// Connection accept loop
async fn accept_loop(
    listener: TcpListener,
    cmd_tx: mpsc::Sender<ServerCommand>,
    accounts: Arc<AccountService>,
    join_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let cmd_tx = cmd_tx.clone();
                    let accounts = Arc::clone(&accounts);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, cmd_tx, accounts, join_timeout).await {
                            debug!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Accept loop stopped");
}

/// Keep a public room listed until shutdown
///
/// A rejected credential stops the loop; communication errors are retried on
/// the next tick.
async fn announce_loop(
    config: DirectoryConfig,
    username: String,
    cmd_tx: mpsc::Sender<ServerCommand>,
    events: mpsc::Sender<HostEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let directory = LobbyDirectory::new(config.url.clone())
        .with_credential(config.credential.clone())
        .with_timeout(config.timeout);
    let mut ticker = tokio::time::interval(config.announce_interval);
    let mut listed = None;
    let mut announced = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Ok(snapshot) = request_snapshot(&cmd_tx).await else {
                    break;
                };
                let summary = summarize(&snapshot, &username, config.public_address.as_deref());
                match directory.announce(&summary).await {
                    Ok(()) => {
                        listed = Some((summary.address, summary.port));
                        if !announced {
                            info!("Room announced to lobby {}", config.url);
                            announced = true;
                            let _ = events.try_send(HostEvent::Announced);
                        }
                    }
                    Err(e) => {
                        warn!("Lobby announce failed: {}", e);
                        announced = false;
                        let no_account = e == AnnounceError::NoAccount;
                        let _ = events.try_send(HostEvent::AnnounceFailed(e.into()));
                        if no_account {
                            break;
                        }
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some((address, port)) = listed {
        if let Err(e) = directory.delist(&address, port).await {
            warn!("Failed to remove lobby listing: {}", e);
        }
    }
}

fn summarize(snapshot: &RoomSnapshot, username: &str, public_address: Option<&str>) -> RoomSummary {
    RoomSummary {
        name: snapshot.room.name.clone(),
        description: snapshot.room.description.clone(),
        preferred_game: snapshot.room.preferred_game.clone(),
        host: username.to_string(),
        address: public_address.unwrap_or_default().to_string(),
        port: snapshot.room.port,
        player_count: snapshot.roster.len(),
        max_players: snapshot.room.max_players,
        has_password: snapshot.room.has_password,
        members: snapshot.roster.iter().map(|m| m.nickname.clone()).collect(),
    }
}
