//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the push-channel configuration for one
//! ComfyUI server. Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`] scoped to a freshly generated client ID.

use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upper bound on the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw WebSocket stream type used by the monitor.
pub type ComfyUIStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for the push channel of a ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Unique client ID sent during the WebSocket handshake. The server
    /// routes events for prompts submitted with this ID to this socket.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// * `ws_url` - push-channel URL including its path, e.g. `ws://host:8188/ws`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// WebSocket URL (e.g. `ws://host:8188/ws`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Full connection URL for `client_id`.
    pub fn connection_url(&self, client_id: &str) -> String {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{}clientId={}", self.ws_url, separator, client_id)
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// Generates a unique `client_id` (UUID v4) and appends it as a
    /// query parameter so that ComfyUI can address messages back to
    /// this specific client. Every call yields a new ID, so concurrent
    /// connections never share one.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = self.connection_url(&client_id);

        let (ws_stream, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ComfyUIClientError::Connection(format!(
                    "Timed out connecting to ComfyUI at {}",
                    self.ws_url
                ))
            })?
            .map_err(|e| {
                ComfyUIClientError::Connection(format!(
                    "Failed to connect to ComfyUI at {}: {e}",
                    self.ws_url
                ))
            })?;

        tracing::debug!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
