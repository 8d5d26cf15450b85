//! Shared helpers for the ComfyUI integration tests: a one-shot local
//! WebSocket server standing in for the ComfyUI push channel.

#![allow(dead_code)]

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

pub type ServerSocket = WebSocketStream<TcpStream>;

/// A push-channel server that accepts exactly one connection and runs a
/// script against it.
pub struct WsServer {
    /// URL to hand to `ComfyUIClient::new`.
    pub url: String,
    /// Request URI of the accepted handshake (path + query).
    pub request_uri: oneshot::Receiver<String>,
    pub task: JoinHandle<()>,
}

pub async fn ws_server<F, Fut>(script: F) -> WsServer
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(req.uri().to_string());
            Ok(resp)
        };
        let ws = accept_hdr_async(tcp, callback).await.unwrap();
        script(ws).await;
    });

    WsServer {
        url: format!("ws://{addr}/ws"),
        request_uri: uri_rx,
        task,
    }
}

/// Send a JSON text frame.
pub async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Read until the client goes away. Reading keeps automatic pong
/// replies flowing. Returns whether a close frame was received.
pub async fn drain(ws: &mut ServerSocket) -> bool {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Close(_)) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}

pub fn executing(node: Option<&str>, prompt_id: &str) -> serde_json::Value {
    serde_json::json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}})
}

pub fn progress(value: i32, max: i32, prompt_id: &str) -> serde_json::Value {
    serde_json::json!({"type": "progress", "data": {"value": value, "max": max, "prompt_id": prompt_id}})
}
