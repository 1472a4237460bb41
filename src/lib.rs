//! Multiplayer Room Sessions over WebSocket
//!
//! One process hosts a room that others join directly (IPv4 address and
//! port) or after picking it from a public lobby directory. Members chat in
//! a host-defined total order, and the host moderates with kick, ban and
//! unban.
//!
//! # Features
//! - Room hosting with name, description, preferred game, capacity and password
//! - Join sequence with capacity, ban, version, password and identity checks
//! - Nickname / hardware address / device id uniqueness within a room
//! - Host-ordered chat delivered in the same order to every member
//! - Kick, ban (account + IP) and unban, with a persistent ban list
//! - Moderator accounts, verified by credential, that may moderate from a client
//! - Public lobby directory with announce, delist and filtered queries
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `RoomServer` is the central actor owning `SessionState` and moderation
//! - Each connection has a `handler` task pair communicating with the server
//! - `RoomHandle` (host) and `RoomClient` (member) are explicit session
//!   objects; nothing is process-global
//!
//! # Example
//! ```ignore
//! use netplay_room::{host, ConnectRequest, HostConfig, RoomClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = HostConfig::from_env().unwrap();
//!     let (room, _host_events) = host::start(config).await.unwrap();
//!
//!     let port = i64::from(room.local_addr().port());
//!     let (client, mut events) = RoomClient::connect(ConnectRequest::new("127.0.0.1", port, "Alice1"))
//!         .await
//!         .unwrap();
//!     client.send_chat("hello").await.unwrap();
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

pub mod account;
pub mod ban_list;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod handler;
pub mod host;
pub mod member;
pub mod message;
pub mod moderation;
pub mod room;
pub mod server;
pub mod session;
pub mod types;
pub mod validation;

// Re-export main types for convenience
pub use account::AccountService;
pub use ban_list::{BanList, BanListEntry};
pub use client::{ClientEvent, ConnectRequest, Identity, RoomClient};
pub use config::{DirectoryConfig, HostConfig};
pub use directory::{LobbyDirectory, LobbyFilter, RoomSummary};
pub use error::{AnnounceError, AppError, ConflictKind, DirectoryError, ErrorCode};
pub use handler::handle_connection;
pub use host::RoomHandle;
pub use member::{Member, MemberInfo};
pub use message::{ChatMessage, ClientMessage, LeaveReason, ServerMessage};
pub use moderation::{Actor, ModerationController};
pub use room::{Room, RoomInfo, RoomSettings};
pub use server::{HostEvent, RoomServer, ServerCommand};
pub use session::SessionState;
pub use types::{BanType, ClientId, ConnectionState, DeviceId, GameInfo, MacAddress, Visibility};
