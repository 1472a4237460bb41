//! Room definition
//!
//! A hosted room: its settings, as configured by the host, and its creation
//! time. Membership lives in `SessionState`.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::types::{GameInfo, Visibility, DEFAULT_PORT};
use crate::validation::validate_room_name;

/// Host-chosen room settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub name: String,
    pub description: String,
    pub preferred_game: Option<GameInfo>,
    pub max_players: usize,
    pub port: u16,
    pub password: Option<String>,
    pub visibility: Visibility,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            preferred_game: None,
            max_players: 8,
            port: DEFAULT_PORT,
            password: None,
            visibility: Visibility::Unlisted,
        }
    }
}

impl RoomSettings {
    /// Check the settings before a room is created
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if !validate_room_name(&self.name) {
            return Err(ErrorCode::InvalidRoomName);
        }
        match &self.preferred_game {
            Some(game) if !game.name.trim().is_empty() => {}
            _ => return Err(ErrorCode::NoPreferredGame),
        }
        if self.max_players == 0 {
            return Err(ErrorCode::RoomCreationFailed);
        }
        Ok(())
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }
}

/// A live room
#[derive(Debug)]
pub struct Room {
    pub settings: RoomSettings,
    /// Monotonic creation time
    pub created_at: Instant,
    /// Wall-clock creation time, seconds since the Unix epoch
    pub created_unix: u64,
}

impl Room {
    /// Create a new room from already validated settings
    pub fn new(settings: RoomSettings) -> Self {
        let created_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            settings,
            created_at: Instant::now(),
            created_unix,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Time since the room was created
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check a join password against the room's
    ///
    /// Rooms without a password accept anything.
    pub fn verify_password(&self, candidate: Option<&str>) -> bool {
        match self.settings.password.as_deref() {
            None => true,
            Some(expected) => candidate == Some(expected),
        }
    }

    /// Public projection sent to members (never includes the password)
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            name: self.settings.name.clone(),
            description: self.settings.description.clone(),
            preferred_game: self.settings.preferred_game.clone(),
            max_players: self.settings.max_players,
            port: self.settings.port,
            has_password: self.settings.has_password(),
            visibility: self.settings.visibility,
            created_unix: self.created_unix,
        }
    }
}

/// Room description as seen by members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub description: String,
    pub preferred_game: Option<GameInfo>,
    pub max_players: usize,
    pub port: u16,
    pub has_password: bool,
    pub visibility: Visibility,
    pub created_unix: u64,
}
