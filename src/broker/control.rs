//! Control plane
//!
//! A strict request/reply channel: every request frame gets exactly one
//! response frame, in order, and a connection does not read its next request
//! until the previous one has been answered. Requests are JSON
//! `{"id", "method", "params"}`; responses are `{"result", "error", "id"}`
//! with exactly one of `result`/`error` set.
//!
//! Requests are answered by the broker core (which owns the presence table),
//! so the socket tasks only shuttle bytes and a `oneshot` reply.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::presence::PresenceTracker;
use crate::utils::{BusError, Result};

pub const MALFORMED_REQUEST: &str = "malformed request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn err(id: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
            id,
        }
    }

    pub fn malformed() -> Self {
        Self::err(None, MALFORMED_REQUEST)
    }
}

/// A request travelling from a control connection to the broker core.
#[derive(Debug)]
pub struct RpcCall {
    pub request: Vec<u8>,
    pub reply: oneshot::Sender<RpcResponse>,
}

impl RpcRequest {
    /// Parse a request; only a JSON object with `id` and `method` qualifies.
    pub fn parse(raw: &[u8]) -> serde_json::Result<Self> {
        let fields: Map<String, Value> = serde_json::from_slice(raw)?;
        serde_json::from_value(Value::Object(fields))
    }
}

/// Answer one raw request against the current presence table.
pub fn handle_request(raw: &[u8], presence: &PresenceTracker) -> RpcResponse {
    let request = match RpcRequest::parse(raw) {
        Ok(request) => request,
        Err(e) => {
            warn!(
                "malformed rpc request ({e}): {}",
                String::from_utf8_lossy(&raw[..raw.len().min(100)])
            );
            return RpcResponse::malformed();
        }
    };

    match dispatch(&request, presence) {
        Ok(result) => RpcResponse::ok(request.id, result),
        Err(BusError::UnknownMethod(method)) => {
            warn!("error while handling rpc message: unknown method {method}");
            RpcResponse::err(Some(request.id), format!("unknown method {method}"))
        }
        Err(e) => {
            warn!("error while handling rpc method {}: {e:?}", request.method);
            RpcResponse::err(Some(request.id), format!("{}: {e}", e.kind()))
        }
    }
}

fn dispatch(request: &RpcRequest, presence: &PresenceTracker) -> Result<Value> {
    match request.method.as_str() {
        "info" => Ok(serde_json::to_value(presence.modules())?),
        other => Err(BusError::UnknownMethod(other.to_string())),
    }
}

/// Accept control connections and pass their requests to the core.
pub async fn serve_control(listener: TcpListener, calls: mpsc::Sender<RpcCall>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("control accept failed: {e}");
                continue;
            }
        };
        let calls = calls.clone();

        tokio::spawn(async move {
            let mut ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake error from {addr}: {e}");
                    return;
                }
            };

            while let Some(Ok(msg)) = ws_stream.next().await {
                let request = match msg {
                    WsMessage::Text(text) => text.as_str().as_bytes().to_vec(),
                    WsMessage::Binary(data) => data.to_vec(),
                    WsMessage::Close(_) => break,
                    _ => continue,
                };

                let (reply, response) = oneshot::channel();
                if calls.send(RpcCall { request, reply }).await.is_err() {
                    debug!("broker core stopped, closing control connection from {addr}");
                    return;
                }
                let Ok(response) = response.await else {
                    return;
                };
                let text = match serde_json::to_string(&response) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to serialize rpc response: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_stream.send(WsMessage::text(text)).await {
                    debug!("failed to answer {addr}: {e}");
                    break;
                }
            }
        });
    }
}
