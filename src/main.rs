//! Room session CLI - Entry Point
//!
//! `host` runs a room, `join` connects to one, `lobby` lists public rooms and
//! `directory` runs a lobby directory.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netplay_room::config::parse_accounts;
use netplay_room::directory::{serve_directory, DEFAULT_ROOM_TTL};
use netplay_room::{
    host, BanListEntry, BanType, ClientEvent, ConnectRequest, DirectoryConfig, GameInfo, HostConfig,
    HostEvent, Identity, LobbyDirectory, LobbyFilter, RoomClient, RoomHandle, Visibility,
};

/// How long a second Ctrl-C confirms closing a room with members
const CLOSE_CONFIRM_WINDOW: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "netplay_room")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a room (settings default to NETPLAY_* environment variables)
    Host {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Preferred game name
        #[arg(long)]
        game: Option<String>,
        #[arg(long, default_value_t = 0)]
        game_id: u64,
        #[arg(long)]
        max_players: Option<usize>,
        #[arg(long, allow_negative_numbers = true)]
        port: Option<i64>,
        #[arg(long)]
        password: Option<String>,
        /// Your nickname
        #[arg(long)]
        username: Option<String>,
        /// List the room on the lobby directory
        #[arg(long)]
        public: bool,
        #[arg(long)]
        ban_list: Option<PathBuf>,
        /// Start from the stored ban list
        #[arg(long)]
        load_ban_list: bool,
        /// Account allowed to moderate (repeatable)
        #[arg(long = "moderator")]
        moderators: Vec<String>,
        /// Lobby directory WebSocket URL
        #[arg(long)]
        directory: Option<String>,
        /// Account credential for the lobby directory
        #[arg(long)]
        token: Option<String>,
        /// Member account as TOKEN=USERNAME (repeatable)
        #[arg(long = "account")]
        accounts: Vec<String>,
    },
    /// Join a room
    Join {
        address: String,
        #[arg(allow_negative_numbers = true)]
        port: i64,
        nickname: String,
        #[arg(long)]
        password: Option<String>,
        /// Account credential; the host verifies it before bans or moderator rights apply
        #[arg(long)]
        token: Option<String>,
    },
    /// List public rooms
    Lobby {
        #[arg(long)]
        directory: String,
        #[arg(long)]
        hide_full: bool,
        /// Owned game id (repeatable); enables the owned-games filter
        #[arg(long = "owned-game")]
        owned_games: Vec<u64>,
    },
    /// Run a lobby directory
    Directory {
        #[arg(long, default_value = "0.0.0.0:24873")]
        bind: String,
        /// Account as TOKEN=USERNAME (repeatable)
        #[arg(long = "account")]
        accounts: Vec<String>,
        /// Seconds before a silent room is dropped
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=netplay_room=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netplay_room=info")),
        )
        .init();

    match Args::parse().command {
        Command::Host {
            name,
            description,
            game,
            game_id,
            max_players,
            port,
            password,
            username,
            public,
            ban_list,
            load_ban_list,
            moderators,
            directory,
            token,
            accounts,
        } => {
            let mut config = HostConfig::from_env()?;
            if let Some(name) = name {
                config.room.name = name;
            }
            if let Some(description) = description {
                config.room.description = description;
            }
            if let Some(game) = game {
                config.room.preferred_game = Some(GameInfo::new(game, game_id));
            }
            if let Some(max_players) = max_players {
                config.room.max_players = max_players;
            }
            if let Some(port) = port {
                config.room.port = u16::try_from(port)
                    .map_err(|_| netplay_room::ErrorCode::InvalidPort)?;
            }
            if password.is_some() {
                config.room.password = password;
            }
            if let Some(username) = username {
                config.username = username;
            }
            if public {
                config.room.visibility = Visibility::Public;
            }
            if ban_list.is_some() {
                config.ban_list_path = ban_list;
            }
            config.load_previous_ban_list |= load_ban_list;
            config.moderators.extend(moderators);
            let accounts = parse_accounts(&accounts.join(","))
                .ok_or("accounts must be given as TOKEN=USERNAME")?;
            config.accounts.extend(accounts);
            if let Some(url) = directory {
                let mut directory = config.directory.take().unwrap_or_else(|| DirectoryConfig::new(url.clone()));
                directory.url = url;
                if token.is_some() {
                    directory.credential = token;
                }
                config.directory = Some(directory);
            }
            run_host(config).await?;
        }
        Command::Join {
            address,
            port,
            nickname,
            password,
            token,
        } => {
            let mut identity = Identity::generate();
            identity.credential = token;
            let mut request = ConnectRequest::new(address, port, nickname).with_identity(identity);
            request.password = password;
            run_client(request).await?;
        }
        Command::Lobby {
            directory,
            hide_full,
            owned_games,
        } => {
            let filter = LobbyFilter {
                owned_games_only: !owned_games.is_empty(),
                owned_games: owned_games.into_iter().collect::<HashSet<_>>(),
                hide_full,
            };
            let rooms = LobbyDirectory::new(directory).query(&filter).await?;
            if rooms.is_empty() {
                println!("No rooms");
            }
            for room in rooms {
                println!(
                    "{:<20} {:<24} {:<20} {}/{} {}:{}{}",
                    room.name,
                    room.preferred_game.map(|g| g.name).unwrap_or_default(),
                    room.host,
                    room.player_count,
                    room.max_players,
                    room.address,
                    room.port,
                    if room.has_password { " (password)" } else { "" }
                );
            }
        }
        Command::Directory { bind, accounts, ttl } => {
            let accounts: HashMap<String, String> = accounts
                .iter()
                .filter_map(|a| a.split_once('='))
                .map(|(token, user)| (token.to_string(), user.to_string()))
                .collect();
            let listener = TcpListener::bind(&bind).await?;
            let ttl = ttl.map(Duration::from_secs).unwrap_or(DEFAULT_ROOM_TTL);
            serve_directory(listener, accounts, ttl).await?;
        }
    }

    Ok(())
}

async fn run_host(config: HostConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (room, mut events) = host::start(config).await?;
    info!("Room listening on {}", room.local_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                if line.trim() == "/close" {
                    break;
                }
                if let Err(code) = run_host_input(&room, line.trim()).await {
                    error!("{}", code);
                }
            }
            event = events.recv() => match event {
                Some(HostEvent::Chat(msg)) => println!("[{}] {}: {}", msg.sequence, msg.sender, msg.text),
                Some(HostEvent::MemberJoined { nickname }) => println!("{} has joined", nickname),
                Some(HostEvent::MemberLeft { nickname, reason }) => println!("{} left ({:?})", nickname, reason),
                Some(HostEvent::Announced) => println!("Room listed on the public lobby"),
                Some(HostEvent::AnnounceFailed(code)) => println!("{}", code),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let members = room.roster().await.map(|r| r.len()).unwrap_or(0);
                if members > 0 {
                    warn!(
                        "{} member(s) connected; their sessions will be lost. Press Ctrl-C again within {}s to close.",
                        members,
                        CLOSE_CONFIRM_WINDOW.as_secs()
                    );
                    if tokio::time::timeout(CLOSE_CONFIRM_WINDOW, tokio::signal::ctrl_c()).await.is_err() {
                        info!("Close cancelled");
                        continue;
                    }
                }
                break;
            }
        }
    }

    let disconnected = room.close().await;
    info!("Room closed, {} member(s) disconnected", disconnected);
    Ok(())
}

/// One of `/kick NICK`, `/ban NICK`, `/unban account|ip SUBJECT`, `/bans`,
/// `/members`, `/close`
async fn run_host_input(room: &RoomHandle, line: &str) -> Result<(), netplay_room::ErrorCode> {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("/kick") => room.kick(parts.next().unwrap_or_default()).await,
        Some("/ban") => room.ban(parts.next().unwrap_or_default()).await,
        Some("/unban") => match parse_unban(parts.next(), parts.next()) {
            Some(entry) => room.unban(entry).await,
            None => {
                println!("usage: /unban account|ip SUBJECT");
                Ok(())
            }
        },
        Some("/bans") => {
            for entry in room.ban_list().await? {
                println!("banned {} {}", entry.ban_type, entry.subject);
            }
            Ok(())
        }
        Some("/members") => {
            let names: Vec<_> = room.roster().await?.into_iter().map(|m| m.nickname).collect();
            println!("Members: {}", names.join(", "));
            Ok(())
        }
        Some("") | None => Ok(()),
        Some(other) => {
            println!("unknown command {}", other);
            Ok(())
        }
    }
}

fn parse_unban(ban_type: Option<&str>, subject: Option<&str>) -> Option<BanListEntry> {
    let ban_type = match ban_type? {
        "account" => BanType::Account,
        "ip" => BanType::Ip,
        _ => return None,
    };
    Some(BanListEntry {
        subject: subject?.trim().to_string(),
        ban_type,
    })
}

async fn run_client(request: ConnectRequest) -> Result<(), Box<dyn std::error::Error>> {
    let (mut client, mut events) = RoomClient::connect(request).await?;
    println!("Joined '{}' as {}", client.room().name, client.nickname());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let finished = matches!(
                    event,
                    ClientEvent::Kicked | ClientEvent::Banned | ClientEvent::ConnectionLost | ClientEvent::RoomClosed
                );
                print_event(event);
                if finished {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(code) = run_input(&client, line.trim()).await {
                    error!("{}", code);
                }
                if line.trim() == "/quit" {
                    break;
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

/// Chat text, or one of `/kick NICK`, `/ban NICK`, `/unban account|ip SUBJECT`,
/// `/bans`, `/quit`
async fn run_input(client: &RoomClient, line: &str) -> Result<(), netplay_room::ErrorCode> {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("/kick") => client.kick(parts.next().unwrap_or_default()).await,
        Some("/ban") => client.ban(parts.next().unwrap_or_default()).await,
        Some("/unban") => match parse_unban(parts.next(), parts.next()) {
            Some(entry) => client.unban(entry).await,
            None => {
                println!("usage: /unban account|ip SUBJECT");
                Ok(())
            }
        },
        Some("/bans") => client.request_ban_list().await,
        Some("/quit") | Some("") | None => Ok(()),
        Some(_) => client.send_chat(line).await,
    }
}

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::RosterChanged(roster) => {
            let names: Vec<_> = roster.into_iter().map(|m| m.nickname).collect();
            println!("Members: {}", names.join(", "));
        }
        ClientEvent::ChatMessage(msg) => println!("{}: {}", msg.sender, msg.text),
        ClientEvent::MemberJoined { nickname } => println!("{} has joined", nickname),
        ClientEvent::MemberLeft { nickname, reason } => println!("{} left ({:?})", nickname, reason),
        ClientEvent::Kicked => println!("{}", netplay_room::ErrorCode::Kicked),
        ClientEvent::Banned => println!("{}", netplay_room::ErrorCode::Banned),
        ClientEvent::ConnectionLost => println!("{}", netplay_room::ErrorCode::ConnectionLost),
        ClientEvent::RoomClosed => println!("The host closed the room"),
        ClientEvent::BanList(entries) => {
            for entry in entries {
                println!("banned {} {}", entry.ban_type, entry.subject);
            }
        }
        ClientEvent::Error(code) => println!("{}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unban() {
        assert_eq!(
            parse_unban(Some("account"), Some("bob")),
            Some(BanListEntry::account("bob"))
        );
        assert_eq!(
            parse_unban(Some("ip"), Some("10.0.0.2")).map(|e| e.ban_type),
            Some(BanType::Ip)
        );
        assert_eq!(parse_unban(Some("mac"), Some("bob")), None);
        assert_eq!(parse_unban(Some("account"), None), None);
    }
}
