//! The forwarder bridges the inlet queue to the outlet. It runs as its own
//! task and never calls application code, so a slow log write or control
//! request cannot stall the data plane.

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::transport::codec;
use crate::transport::outlet::SharedOutlet;
use crate::utils::lock;

/// Start forwarding. Frames sent on the returned queue are rebroadcast, in
/// order, to every interested outlet peer.
pub fn spawn_forwarder(outlet: SharedOutlet) -> (UnboundedSender<Vec<u8>>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            lock(&outlet).publish(&frame);
        }
        debug!("forwarder stopped");
    });
    (tx, handle)
}

/// Publishes broker-generated messages into the forwarder queue, so they are
/// tapped and delivered exactly like traffic from any module.
#[derive(Debug, Clone)]
pub struct Injector {
    queue: UnboundedSender<Vec<u8>>,
}

impl Injector {
    pub fn new(queue: UnboundedSender<Vec<u8>>) -> Self {
        Self { queue }
    }

    pub fn inject(&self, topic: &str, body: &[u8]) {
        if self.queue.send(codec::encode(topic, body)).is_err() {
            debug!("dropping injected message on {topic}: forwarder stopped");
        }
    }

    pub fn inject_json(&self, topic: &str, body: &Value) {
        match serde_json::to_vec(body) {
            Ok(bytes) => self.inject(topic, &bytes),
            Err(e) => error!("failed to serialize injected message on {topic}: {e}"),
        }
    }
}
