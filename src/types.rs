//! Basic type definitions for room sessions
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based connection / member handle
//! - `MacAddress`: per-member hardware address, unique within a room
//! - `DeviceId`: per-member device identifier, unique within a room
//!
//! Also holds the small enums shared by host and client: connection state,
//! room visibility and ban entry type.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Protocol version spoken by this build. Joins with any other value are
/// rejected with `VersionMismatch`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default room port
pub const DEFAULT_PORT: u16 = 24872;

/// Unique client identifier (newtype pattern)
///
/// Wraps a UUID v4. Issued by the host for every accepted connection and
/// used as the member handle once the join succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware (MAC) address of a member
///
/// Serialized as the usual colon separated lowercase hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Generate a random locally administered unicast address
    pub fn generate() -> Self {
        let mut bytes: [u8; 6] = rand::thread_rng().gen();
        bytes[0] = (bytes[0] & 0xFC) | 0x02;
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Error returned when parsing a malformed MAC address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hardware address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseMacError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Device identifier of a member (console ID)
///
/// Two members presenting the same value are treated as a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Generate a new random device identifier
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Lifecycle of a single connection
///
/// `Connecting -> Connected -> {Disconnected | Kicked | Banned | Lost}`.
/// Terminal states never transition; a fresh connection attempt starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
    Kicked,
    Banned,
}

impl ConnectionState {
    /// States reached only through the end of a session
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Lost | Self::Kicked | Self::Banned)
    }

    /// Whether `self -> next` is a legal step of the state machine
    ///
    /// `Disconnected` is the idle starting point as well as the normal end of
    /// a session, so the only way out of it is a new `Connecting` attempt.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Lost)
                | (Connected, Disconnected)
                | (Connected, Lost)
                | (Connected, Kicked)
                | (Connected, Banned)
        )
    }
}

/// Whether a room is listed on the public lobby
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    #[default]
    Unlisted,
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "unlisted" => Ok(Self::Unlisted),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// Kind of subject a ban entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanType {
    Account,
    Ip,
}

impl fmt::Display for BanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account => f.write_str("account"),
            Self::Ip => f.write_str("ip"),
        }
    }
}

/// Game a room prefers or a member is currently running
///
/// Supplied by the embedding application; the room treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameInfo {
    pub name: String,
    pub id: u64,
}

impl GameInfo {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}
