//! WebSocket connection handler
//!
//! Handles individual member connections: WebSocket handshake,
//! message parsing, and bidirectional communication with the RoomServer.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::account::AccountService;
use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};
use crate::moderation::Actor;
use crate::server::{JoinRequest, ServerCommand};
use crate::types::ClientId;

/// Outbound queue depth per connection
pub const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Longest a single frame may take to reach a peer
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the WebSocket handshake plus the `Join` message
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, sets up bidirectional communication,
/// and manages the connection lifecycle. Returns once either direction
/// ends; the room server is always told about the disconnect. The peer must
/// complete the handshake and send `Join` within `join_timeout`.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    accounts: Arc<AccountService>,
    join_timeout: Duration,
) -> Result<(), AppError> {
    let ip = stream
        .peer_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    debug!("New TCP connection from {}", ip);

    let deadline = Instant::now() + join_timeout;

    // WebSocket handshake
    let ws_stream = timeout_at(deadline, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| AppError::HandshakeTimeout)??;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = ClientId::new();
    info!("Connection {} from {}", client_id, ip);

    // Channel for server -> client messages
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER_SIZE);

    // Register with RoomServer
    if cmd_tx
        .send(ServerCommand::Connect {
            client_id,
            ip,
            sender: msg_tx,
        })
        .await
        .is_err()
    {
        error!("Failed to register {} - room closed", client_id);
        return Err(AppError::ChannelSend);
    }

    let cmd_tx_read = cmd_tx.clone();

    // Read task (WebSocket -> ServerCommand)
    let mut read_task = tokio::spawn(async move {
        let mut joined = false;
        loop {
            let next = if joined {
                ws_receiver.next().await
            } else {
                match timeout_at(deadline, ws_receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!("{} did not join in time", client_id);
                        break;
                    }
                }
            };
            let Some(msg_result) = next else {
                break;
            };
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        joined |= matches!(client_msg, ClientMessage::Join { .. });
                        let cmd = client_message_to_command(client_id, client_msg, &accounts).await;
                        if cmd_tx_read.send(cmd).await.is_err() {
                            debug!("Room closed, ending read task for {}", client_id);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid JSON from {}: {}", client_id, e);
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("{} sent close frame", client_id);
                    break;
                }
                Ok(_) => {
                    // Binary, ping and pong frames; pongs are answered by tungstenite
                }
                Err(e) => {
                    debug!("WebSocket error for {}: {}", client_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", client_id);
    });

    // Write task (ServerMessage -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => match timeout(WRITE_TIMEOUT, ws_sender.send(Message::Text(json.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                    Err(_) => {
                        warn!("{} is not reading, closing connection", client_id);
                        break;
                    }
                },
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                }
            }
        }

        // The room dropped this connection: flush and close
        let _ = timeout(WRITE_TIMEOUT, ws_sender.close()).await;
    });

    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", client_id);
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", client_id);
            read_task.abort();
        }
    }

    let _ = cmd_tx.send(ServerCommand::Disconnect { client_id }).await;

    info!("Connection {} closed", client_id);

    Ok(())
}

/// Convert a ClientMessage to a ServerCommand
///
/// A join credential is resolved here, off the room actor; the room only
/// ever sees verified accounts.
async fn client_message_to_command(
    client_id: ClientId,
    msg: ClientMessage,
    accounts: &AccountService,
) -> ServerCommand {
    let actor = Actor::Member(client_id);
    match msg {
        ClientMessage::Join {
            nickname,
            hardware_address,
            device_id,
            credential,
            password,
            protocol_version,
            current_game,
        } => ServerCommand::Join {
            client_id,
            request: JoinRequest {
                nickname,
                hardware_address,
                device_id,
                account: accounts.verify(credential.as_deref()).await,
                password,
                protocol_version,
                current_game,
            },
        },
        ClientMessage::Chat { text } => ServerCommand::Chat { client_id, text },
        ClientMessage::SetGame { game } => ServerCommand::SetGame { client_id, game },
        ClientMessage::Kick { nickname } => ServerCommand::Kick {
            actor,
            nickname,
            reply: None,
        },
        ClientMessage::Ban { nickname } => ServerCommand::Ban {
            actor,
            nickname,
            reply: None,
        },
        ClientMessage::Unban { entry } => ServerCommand::Unban {
            actor,
            entry,
            reply: None,
        },
        ClientMessage::RequestBanList => ServerCommand::BanList { actor, reply: None },
        ClientMessage::Leave => ServerCommand::Leave { client_id },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::types::{DeviceId, MacAddress};

    fn accounts() -> AccountService {
        AccountService::Local(HashMap::from([(
            "alice-token".to_string(),
            "alice".to_string(),
        )]))
    }

    fn join(credential: Option<&str>) -> ClientMessage {
        ClientMessage::Join {
            nickname: "Alice1".to_string(),
            hardware_address: MacAddress([2, 0, 0, 0, 0, 1]),
            device_id: DeviceId(5),
            credential: credential.map(str::to_string),
            password: Some("pw".to_string()),
            protocol_version: 7,
            current_game: None,
        }
    }

    #[tokio::test]
    async fn test_moderation_messages_carry_member_actor() {
        let id = ClientId::new();
        let msg = ClientMessage::Kick {
            nickname: "Bob1".to_string(),
        };
        match client_message_to_command(id, msg, &accounts()).await {
            ServerCommand::Kick {
                actor,
                nickname,
                reply,
            } => {
                assert_eq!(actor, Actor::Member(id));
                assert_eq!(nickname, "Bob1");
                assert!(reply.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_resolves_credential() {
        let id = ClientId::new();
        match client_message_to_command(id, join(Some("alice-token")), &accounts()).await {
            ServerCommand::Join { client_id, request } => {
                assert_eq!(client_id, id);
                assert_eq!(request.device_id, DeviceId(5));
                assert_eq!(request.account.as_deref(), Some("alice"));
                assert_eq!(request.password.as_deref(), Some("pw"));
                assert_eq!(request.protocol_version, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_claimed_account_name_is_not_trusted() {
        let id = ClientId::new();
        match client_message_to_command(id, join(Some("alice")), &accounts()).await {
            ServerCommand::Join { request, .. } => assert!(request.account.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_connection_is_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        let handler = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(
                stream,
                cmd_tx,
                Arc::new(AccountService::Disabled),
                Duration::from_millis(200),
            )
            .await
        });

        let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();

        let client_id = match cmd_rx.recv().await {
            Some(ServerCommand::Connect { client_id, .. }) => client_id,
            other => panic!("unexpected {:?}", other),
        };
        match timeout(Duration::from_secs(5), cmd_rx.recv()).await.unwrap() {
            Some(ServerCommand::Disconnect { client_id: gone }) => assert_eq!(gone, client_id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(handler.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        // Raw TCP, no WebSocket upgrade
        let _raw = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let result = handle_connection(
            stream,
            cmd_tx,
            Arc::new(AccountService::Disabled),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(AppError::HandshakeTimeout)));
        assert!(cmd_rx.recv().await.is_none());
    }
}
