//! Home Assistant WebSocket API client
//!
//! Used for the registry and exposure lists, which have no REST endpoint.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// WebSocket message types from Home Assistant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum WsMessage {
    AuthRequired {
        ha_version: String,
    },
    AuthOk {
        ha_version: String,
    },
    AuthInvalid {
        message: String,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<WsError>,
    },
    /// Events, pongs and anything else this client does not ask for
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsError {
    pub code: String,
    pub message: String,
}

/// Home Assistant WebSocket client
pub struct WsClient {
    sender: mpsc::Sender<String>,
    receiver: mpsc::Receiver<WsMessage>,
    msg_id: u64,
}

fn websocket_url(server_url: &str) -> String {
    let ws_url = server_url
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    format!("{}/api/websocket", ws_url.trim_end_matches('/'))
}

impl WsClient {
    /// Connect and authenticate
    pub async fn connect(server_url: &str, token: &str) -> Result<Self> {
        let ws_url = websocket_url(server_url);
        log::debug!("Connecting to WebSocket: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .context("connecting to WebSocket")?;

        let (mut write, mut read) = ws_stream.split();

        let (tx_send, mut rx_send) = mpsc::channel::<String>(32);
        let (tx_recv, rx_recv) = mpsc::channel::<WsMessage>(32);

        tokio::spawn(async move {
            while let Some(msg) = rx_send.recv().await {
                if write.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(text) = msg {
                    match serde_json::from_str::<WsMessage>(&text) {
                        Ok(ws_msg) => {
                            if tx_recv.send(ws_msg).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => log::trace!("Ignoring WebSocket message: {err}"),
                    }
                }
            }
        });

        let mut client = Self {
            sender: tx_send,
            receiver: rx_recv,
            msg_id: 0,
        };

        match client.receive().await? {
            WsMessage::AuthRequired { ha_version } => {
                log::debug!("Connected to Home Assistant {}", ha_version);
            }
            _ => return Err(anyhow!("unexpected message, expected auth_required")),
        }

        let auth_msg = json!({
            "type": "auth",
            "access_token": token
        });
        client.send_raw(&auth_msg.to_string()).await?;

        match client.receive().await? {
            WsMessage::AuthOk { ha_version } => {
                log::debug!("Authenticated with Home Assistant {}", ha_version);
            }
            WsMessage::AuthInvalid { message } => {
                return Err(anyhow!("Authentication failed: {}", message));
            }
            _ => return Err(anyhow!("unexpected auth response")),
        }

        Ok(client)
    }

    async fn send_raw(&self, msg: &str) -> Result<()> {
        self.sender
            .send(msg.to_string())
            .await
            .context("sending WebSocket message")
    }

    fn next_id(&mut self) -> u64 {
        self.msg_id += 1;
        self.msg_id
    }

    async fn send(&mut self, msg: &Value) -> Result<u64> {
        let id = self.next_id();
        let mut msg = msg.clone();
        msg["id"] = json!(id);
        self.send_raw(&msg.to_string()).await?;
        Ok(id)
    }

    async fn receive(&mut self) -> Result<WsMessage> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| anyhow!("WebSocket connection closed"))
    }

    /// Send a command of `command_type` and wait for its result
    pub async fn request(&mut self, command_type: &str) -> Result<Value> {
        let sent = self.send(&json!({ "type": command_type })).await?;

        loop {
            match self.receive().await? {
                WsMessage::Result {
                    id,
                    success,
                    result,
                    error,
                } if id == sent => {
                    if success {
                        return Ok(result);
                    }
                    return Err(match error {
                        Some(err) => {
                            anyhow!("{command_type} failed: {} ({})", err.message, err.code)
                        }
                        None => anyhow!("{command_type} failed"),
                    });
                }
                _ => continue,
            }
        }
    }
}
