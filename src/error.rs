//! Error types for room sessions
//!
//! `ErrorCode` is the closed taxonomy surfaced on the join, connect, host and
//! moderation paths; its `Display` is the fixed user-facing message. The other
//! enums cover transport failures and the lobby directory.
//! Uses thiserror for ergonomic error definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-facing error codes
///
/// Produced locally (validation) or by the host (join sequence, moderation)
/// and transmitted to the client as a single code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("Nickname is not valid. Must be 4 to 20 alphanumeric characters.")]
    InvalidNickname,

    #[error("Room name is not valid. Must be 4 to 20 alphanumeric characters.")]
    InvalidRoomName,

    #[error("Nickname is already in use. Please choose another.")]
    NicknameInUse,

    #[error("IP is not a valid IPv4 address.")]
    InvalidIp,

    #[error("Port must be a number between 0 and 65535.")]
    InvalidPort,

    #[error("You must choose a preferred game to host a room.")]
    NoPreferredGame,

    #[error("Unable to find an internet connection. Check your network settings.")]
    NoInternetConnection,

    #[error("Unable to connect to the host. Verify that the address and port are correct.")]
    UnableToConnect,

    #[error("Unable to connect to the room because it is already full.")]
    RoomIsFull,

    #[error("Creating a room failed. Please retry.")]
    RoomCreationFailed,

    #[error("The host of the room has banned you. Speak with the host to be unbanned or try a different room.")]
    Banned,

    #[error("Version mismatch. The host runs a different protocol version; update before joining this room.")]
    VersionMismatch,

    #[error("Incorrect password.")]
    IncorrectPassword,

    #[error("An unknown error occurred.")]
    UnknownError,

    #[error("Connection to the room was lost. Try to reconnect.")]
    ConnectionLost,

    #[error("You have been kicked by the room host.")]
    Kicked,

    #[error("Hardware address is already in use in this room. Please regenerate it.")]
    HardwareAddressInUse,

    #[error("Your device ID conflicted with another member of the room. Please regenerate it.")]
    DeviceIdConflict,

    #[error("You do not have enough permission to perform this action.")]
    InsufficientPermission,

    #[error("The user could not be found. They may have left the room.")]
    UserNotFound,

    #[error("Failed to announce the room to the public lobby: a valid account is required to host publicly.")]
    AnnounceFailedNoAccount,

    #[error("Failed to announce the room to the public lobby: could not communicate with the directory.")]
    AnnounceCommunicationError,
}

impl ErrorCode {
    /// Errors that must not be retried against the same host without an upgrade
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::VersionMismatch)
    }

    /// Errors a caller may reasonably offer to retry
    ///
    /// Retrying is always a fresh call; nothing in this crate retries on its own.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::UnableToConnect
                | Self::NoInternetConnection
                | Self::AnnounceCommunicationError
        )
    }
}

/// Uniqueness violations detected when adding a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("nickname in use")]
    NicknameInUse,
    #[error("hardware address in use")]
    HardwareAddressInUse,
    #[error("device id conflict")]
    DeviceIdConflict,
}

impl From<ConflictKind> for ErrorCode {
    fn from(kind: ConflictKind) -> Self {
        match kind {
            ConflictKind::NicknameInUse => ErrorCode::NicknameInUse,
            ConflictKind::HardwareAddressInUse => ErrorCode::HardwareAddressInUse,
            ConflictKind::DeviceIdConflict => ErrorCode::DeviceIdConflict,
        }
    }
}

/// Transport-level errors
///
/// Fatal for the connection they occur on; never shown verbatim to users.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// The peer did not finish the handshake in time
    #[error("Handshake timed out")]
    HandshakeTimeout,
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The receiver is not keeping up and its queue is full
    #[error("Channel full")]
    Full,
}

/// Failure to publish a room on the lobby directory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnounceError {
    /// No credential configured, or the directory's account service rejected it
    #[error("no valid account configured for public hosting")]
    NoAccount,

    /// Transport failure, timeout or unexpected directory reply
    #[error("directory communication failed: {0}")]
    CommunicationError(String),
}

impl From<AnnounceError> for ErrorCode {
    fn from(err: AnnounceError) -> Self {
        match err {
            AnnounceError::NoAccount => ErrorCode::AnnounceFailedNoAccount,
            AnnounceError::CommunicationError(_) => ErrorCode::AnnounceCommunicationError,
        }
    }
}

/// Failure to list rooms from the lobby directory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Unreachable(String),

    #[error("directory request timed out")]
    Timeout,

    #[error("unexpected directory reply: {0}")]
    Protocol(String),
}

impl DirectoryError {
    /// Lobby refreshes are always safe to re-trigger
    pub fn is_retryable(&self) -> bool {
        true
    }
}
