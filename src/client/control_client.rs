//! Control-plane client
//!
//! `call` is the generic request/reply primitive; typed wrappers such as
//! `info` are written by hand on top of it.

use std::collections::BTreeMap;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::control::{RpcRequest, RpcResponse};
use crate::broker::presence::ModulePresence;
use crate::transport::endpoint::Endpoint;
use crate::utils::{BusError, Result};

pub struct ControlClient {
    endpoint: Endpoint,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl ControlClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let url = endpoint.ws_url()?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| BusError::Connect {
                endpoint: endpoint.to_string(),
                source: Box::new(e),
            })?;
        debug!("connected to control endpoint {endpoint}");
        Ok(Self {
            endpoint: endpoint.clone(),
            ws,
            next_id: 1,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one raw request and wait for its raw response.
    pub async fn call_raw(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.ws.send(WsMessage::binary(request.to_vec())).await?;
        while let Some(msg) = self.ws.next().await {
            match msg? {
                WsMessage::Text(text) => return Ok(text.as_str().as_bytes().to_vec()),
                WsMessage::Binary(data) => return Ok(data.to_vec()),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Err(BusError::Closed)
    }

    /// Call `method` and return its result, or its error as `BusError::Rpc`.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let request = RpcRequest {
            id: json!(self.next_id),
            method: method.to_string(),
            params,
        };
        self.next_id += 1;

        let raw = self.call_raw(&serde_json::to_vec(&request)?).await?;
        let response: RpcResponse = serde_json::from_slice(&raw)?;
        match response.error {
            Some(error) => Err(BusError::Rpc(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// The broker's presence table, keyed by module name.
    pub async fn info(&mut self) -> Result<BTreeMap<String, ModulePresence>> {
        let result = self.call("info", json!({})).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
