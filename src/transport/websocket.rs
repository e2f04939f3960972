//! WebSocket transport
//!
//! This file implements the socket plumbing of the data plane:
//! - `serve_outlet`: accept subscriber connections onto an `Outlet`, honoring
//!   their subscribe/unsubscribe control frames
//! - `serve_inlet`: accept publisher connections and queue every data frame
//!   they send
//! - `push_frames`: the publisher side, draining a local queue into a remote
//!   inlet and reconnecting when the connection drops
//! - `pull_frames`: the subscriber side, receiving frames from a remote
//!   outlet and replaying the current subscriptions after every reconnect
//!
//! Data frames are binary WebSocket messages; control frames are JSON text.

use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::transport::endpoint::Endpoint;
use crate::transport::message::ClientMessage;
use crate::transport::outlet::{PEER_QUEUE_CAPACITY, SharedOutlet};
use crate::utils::lock;

/// Delay between attempts to (re)establish an outbound connection.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(250);

pub async fn serve_outlet(listener: TcpListener, outlet: SharedOutlet) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("outlet accept failed: {e}");
                continue;
            }
        };
        let outlet = outlet.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake error from {addr}: {e}");
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PEER_QUEUE_CAPACITY);
            let peer_id = lock(&outlet).register(tx);
            debug!("outlet peer {peer_id} connected from {addr}");

            let send_loop = {
                let peer_id = peer_id.clone();
                spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if let Err(e) = ws_sender.send(WsMessage::binary(frame)).await {
                            debug!("failed to send frame to {peer_id}: {e}");
                            break;
                        }
                    }
                })
            };

            while let Some(Ok(msg)) = ws_receiver.next().await {
                match msg {
                    WsMessage::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Subscribe { prefix }) => {
                                debug!("{peer_id} subscribed to {prefix:?}");
                                lock(&outlet).subscribe(&peer_id, &prefix);
                            }
                            Ok(ClientMessage::Unsubscribe { prefix }) => {
                                debug!("{peer_id} unsubscribed from {prefix:?}");
                                lock(&outlet).unsubscribe(&peer_id, &prefix);
                            }
                            Err(err) => {
                                warn!(
                                    "Invalid control frame from {peer_id}: {err} | {}",
                                    text.as_str().chars().take(100).collect::<String>()
                                );
                            }
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }

            lock(&outlet).remove(&peer_id);
            send_loop.abort();
            debug!("outlet peer {peer_id} disconnected");
        });
    }
}

pub async fn serve_inlet(listener: TcpListener, queue: UnboundedSender<Vec<u8>>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("inlet accept failed: {e}");
                continue;
            }
        };
        let queue = queue.clone();

        tokio::spawn(async move {
            let mut ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake error from {addr}: {e}");
                    return;
                }
            };
            debug!("publisher connected from {addr}");

            while let Some(msg) = ws_stream.next().await {
                let frame = match msg {
                    Ok(WsMessage::Binary(data)) => data.to_vec(),
                    Ok(WsMessage::Text(text)) => text.as_str().as_bytes().to_vec(),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("publisher connection from {addr} failed: {e}");
                        break;
                    }
                };
                if queue.send(frame).is_err() {
                    // forwarder is gone, the broker is shutting down
                    return;
                }
            }
            debug!("publisher from {addr} disconnected");
        });
    }
}

/// Drain `frames` into the inlet at `endpoint`. Frames queued while the
/// connection is down wait in the channel. Returns once the sending side of
/// `frames` has been dropped; frames still queued are discarded if the remote
/// end is unreachable at that point.
pub async fn push_frames(endpoint: Endpoint, mut frames: UnboundedReceiver<Vec<u8>>) {
    let url = match endpoint.ws_url() {
        Ok(url) => url,
        Err(e) => {
            error!("cannot publish to {endpoint}: {e}");
            return;
        }
    };

    loop {
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                info!("connected to central at {endpoint}");
                loop {
                    let Some(frame) = frames.recv().await else {
                        let _ = ws.close(None).await;
                        return;
                    };
                    if let Err(e) = ws.send(WsMessage::binary(frame)).await {
                        warn!("lost connection to {endpoint}: {e}");
                        break;
                    }
                }
            }
            Err(e) => debug!("connecting to {endpoint} failed: {e}"),
        }
        if frames.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Receive frames from the outlet at `endpoint`, handing each one to
/// `on_frame`. On every (re)connect the prefixes returned by `prefixes` are
/// subscribed; afterwards subscription changes arrive through `control`.
/// Returns once the sending side of `control` has been dropped.
pub async fn pull_frames<P, F>(
    endpoint: Endpoint,
    mut control: UnboundedReceiver<ClientMessage>,
    prefixes: P,
    mut on_frame: F,
) where
    P: Fn() -> Vec<String> + Send,
    F: FnMut(Vec<u8>) + Send,
{
    let url = match endpoint.ws_url() {
        Ok(url) => url,
        Err(e) => {
            error!("cannot subscribe to {endpoint}: {e}");
            return;
        }
    };

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("connected to outlet at {endpoint}");
                let (mut sink, mut stream) = ws.split();
                let mut subscribed = true;
                for prefix in prefixes() {
                    if send_control(&mut sink, &ClientMessage::Subscribe { prefix })
                        .await
                        .is_err()
                    {
                        subscribed = false;
                        break;
                    }
                }

                while subscribed {
                    tokio::select! {
                        incoming = stream.next() => match incoming {
                            Some(Ok(WsMessage::Binary(data))) => on_frame(data.to_vec()),
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("lost connection to {endpoint}: {e}");
                                break;
                            }
                        },
                        command = control.recv() => match command {
                            Some(command) => {
                                if send_control(&mut sink, &command).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        },
                    }
                }
            }
            Err(e) => debug!("connecting to {endpoint} failed: {e}"),
        }
        if control.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn send_control<S>(sink: &mut S, message: &ClientMessage) -> Result<(), tungstenite::Error>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to serialize control frame: {e}");
            return Ok(());
        }
    };
    sink.send(WsMessage::text(text)).await
}
