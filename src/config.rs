//! Host configuration
//!
//! Environment-based configuration with defaults. The CLI overrides
//! individual values after loading; `validate` is the final check before a
//! room is created.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::account::AccountService;
use crate::directory::{LobbyDirectory, DEFAULT_DIRECTORY_TIMEOUT};
use crate::error::ErrorCode;
use crate::handler::DEFAULT_JOIN_TIMEOUT;
use crate::room::RoomSettings;
use crate::types::{GameInfo, Visibility};
use crate::validation::{validate_nickname, validate_port};

/// Interval between lobby re-announcements
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15);

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Lobby directory settings for a public room
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// WebSocket URL of the directory
    pub url: String,
    /// Account credential; public rooms cannot be announced without one
    pub credential: Option<String>,
    /// Address advertised to players; defaults to what the directory sees
    pub public_address: Option<String>,
    pub announce_interval: Duration,
    pub timeout: Duration,
}

impl DirectoryConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: None,
            public_address: None,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            timeout: DEFAULT_DIRECTORY_TIMEOUT,
        }
    }
}

/// Everything needed to host a room
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub room: RoomSettings,
    /// Host's own nickname, shown in the lobby
    pub username: String,
    pub bind_address: IpAddr,
    /// Where the ban list is stored; `None` keeps it in memory
    pub ban_list_path: Option<PathBuf>,
    /// Start from the stored ban list instead of an empty one
    pub load_previous_ban_list: bool,
    /// Accounts allowed to kick, ban and unban
    pub moderators: Vec<String>,
    /// Member credential -> account username; empty defers to the directory
    pub accounts: HashMap<String, String>,
    /// Time a new connection has to finish the handshake and join
    pub join_timeout: Duration,
    pub directory: Option<DirectoryConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            room: RoomSettings::default(),
            username: String::new(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ban_list_path: None,
            load_previous_ban_list: false,
            moderators: Vec::new(),
            accounts: HashMap::new(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            directory: None,
        }
    }
}

impl HostConfig {
    /// Load from `NETPLAY_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by `from_env` and tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let room = &mut config.room;

        if let Some(name) = lookup("NETPLAY_ROOM_NAME") {
            room.name = name;
        }
        if let Some(description) = lookup("NETPLAY_ROOM_DESCRIPTION") {
            room.description = description;
        }
        if let Some(game) = lookup("NETPLAY_PREFERRED_GAME") {
            let id = match lookup("NETPLAY_PREFERRED_GAME_ID") {
                Some(v) => parse("NETPLAY_PREFERRED_GAME_ID", &v)?,
                None => 0,
            };
            room.preferred_game = Some(GameInfo::new(game, id));
        }
        if let Some(v) = lookup("NETPLAY_MAX_PLAYERS") {
            room.max_players = parse("NETPLAY_MAX_PLAYERS", &v)?;
        }
        if let Some(v) = lookup("NETPLAY_PORT") {
            room.port = parse_port("NETPLAY_PORT", &v)?;
        }
        if let Some(password) = lookup("NETPLAY_PASSWORD") {
            room.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(v) = lookup("NETPLAY_VISIBILITY") {
            room.visibility = v.parse::<Visibility>().map_err(|_| ConfigError::Invalid {
                key: "NETPLAY_VISIBILITY",
                value: v.clone(),
            })?;
        }

        if let Some(username) = lookup("NETPLAY_USERNAME") {
            config.username = username;
        }
        if let Some(v) = lookup("NETPLAY_BIND_ADDRESS") {
            config.bind_address = parse("NETPLAY_BIND_ADDRESS", &v)?;
        }
        if let Some(path) = lookup("NETPLAY_BAN_LIST") {
            config.ban_list_path = Some(PathBuf::from(path));
        }
        if let Some(v) = lookup("NETPLAY_LOAD_PREVIOUS_BAN_LIST") {
            config.load_previous_ban_list = parse("NETPLAY_LOAD_PREVIOUS_BAN_LIST", &v)?;
        }
        if let Some(v) = lookup("NETPLAY_MODERATORS") {
            config.moderators = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("NETPLAY_ACCOUNTS") {
            config.accounts = parse_accounts(&v).ok_or(ConfigError::Invalid {
                key: "NETPLAY_ACCOUNTS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("NETPLAY_JOIN_TIMEOUT_SECS") {
            config.join_timeout = Duration::from_secs(parse("NETPLAY_JOIN_TIMEOUT_SECS", &v)?);
        }
        if let Some(url) = lookup("NETPLAY_DIRECTORY_URL") {
            let mut directory = DirectoryConfig::new(url);
            directory.credential = lookup("NETPLAY_ACCOUNT_TOKEN");
            directory.public_address = lookup("NETPLAY_PUBLIC_ADDRESS");
            if let Some(v) = lookup("NETPLAY_ANNOUNCE_INTERVAL_SECS") {
                directory.announce_interval =
                    Duration::from_secs(parse("NETPLAY_ANNOUNCE_INTERVAL_SECS", &v)?);
            }
            config.directory = Some(directory);
        }

        Ok(config)
    }

    /// Check the configuration before creating the room
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if !validate_nickname(&self.username) {
            return Err(ErrorCode::InvalidNickname);
        }
        self.room.validate()
    }

    /// Where member credentials are verified
    ///
    /// A local account table wins; otherwise the lobby directory's accounts
    /// are used when one is configured.
    pub fn account_service(&self) -> AccountService {
        if !self.accounts.is_empty() {
            return AccountService::Local(self.accounts.clone());
        }
        match &self.directory {
            Some(directory) => AccountService::Directory(
                LobbyDirectory::new(directory.url.clone()).with_timeout(directory.timeout),
            ),
            None => AccountService::Disabled,
        }
    }
}

/// Parse `TOKEN=USERNAME` pairs separated by commas
pub fn parse_accounts(value: &str) -> Option<HashMap<String, String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (token, username) = pair.split_once('=')?;
            let (token, username) = (token.trim(), username.trim());
            if token.is_empty() || username.is_empty() {
                return None;
            }
            Some((token.to_string(), username.to_string()))
        })
        .collect()
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_port(key: &'static str, value: &str) -> Result<u16, ConfigError> {
    let port: i64 = parse(key, value)?;
    if !validate_port(port) {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    u16::try_from(port).map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
