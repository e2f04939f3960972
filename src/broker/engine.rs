//! Broker engine
//!
//! `Central` wires the broker together:
//! - the inlet accepts publishers and feeds the forwarder queue
//! - the forwarder rebroadcasts every frame to the outlet, which serves
//!   subscribers and the in-process monitor tap
//! - the core task owns the presence table and the message log and handles,
//!   one at a time, tapped frames, control requests, the presence sweep and
//!   shutdown
//!
//! Concurrency notes: the forwarder and socket tasks never touch broker
//! state, so slow log writes or control requests cannot stall forwarding.
//! Everything that does touch broker state runs on the single core task, so
//! it needs no locking. Frames accepted by the forwarder but not yet seen by
//! the monitor when shutdown starts may go unlogged.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::control::{self, RpcCall};
use crate::broker::presence::{HEARTBEAT_PREFIX, PresenceTracker};
use crate::config::{
    CentralSettings, DEFAULT_CENTRAL_PUBLISH_PORT, DEFAULT_CENTRAL_RPC_PORT,
    DEFAULT_CENTRAL_SUBSCRIBE_PORT,
};
use crate::persistence::message_log::{DISABLED, MessageLog};
use crate::transport::codec;
use crate::transport::endpoint::{self, BIND_INTERFACE_TOKEN, Endpoint, Port};
use crate::transport::forwarder::{Injector, spawn_forwarder};
use crate::transport::message::ClientMessage;
use crate::transport::outlet::Outlet;
use crate::transport::websocket::{pull_frames, serve_inlet, serve_outlet};
use crate::utils::{BusError, Result, lock, timestamp_us};

/// Pending control requests the core may have queued.
const RPC_QUEUE_DEPTH: usize = 64;

/// Endpoints the broker actually bound, with random ports resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEndpoints {
    pub rpc: Endpoint,
    pub subscribe: Endpoint,
    pub publish: Endpoint,
}

/// A running broker.
#[derive(Debug)]
pub struct CentralHandle {
    pub endpoints: BoundEndpoints,
    pub message_log: Option<PathBuf>,
    shutdown: Option<oneshot::Sender<()>>,
    core: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CentralHandle {
    /// Stop the broker: the core closes (and flushes) the message log, then
    /// every socket task is aborted.
    pub async fn shutdown(mut self) {
        self.stop().await;
    }

    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(core) = self.core.take() {
            if let Err(e) = core.await {
                warn!("broker core ended abnormally: {e}");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for CentralHandle {
    fn drop(&mut self) {
        if let Some(core) = &self.core {
            core.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// State owned by the core task.
pub struct Central {
    presence: PresenceTracker,
    message_log: Option<MessageLog>,
}

impl Central {
    /// Bind every endpoint, open the message log and start all tasks.
    ///
    /// Any failure here is fatal for the broker: nothing is left running.
    pub async fn start(settings: &CentralSettings) -> Result<CentralHandle> {
        let template = |value: &str| endpoint::expand(value, BIND_INTERFACE_TOKEN, &settings.bind_interface);
        let rpc = Endpoint::parse_with_default(
            &template(&settings.rpc_endpoint),
            Some(Port::Fixed(DEFAULT_CENTRAL_RPC_PORT)),
        )?;
        let subscribe = Endpoint::parse_with_default(
            &template(&settings.subscribe_endpoint),
            Some(Port::Fixed(DEFAULT_CENTRAL_SUBSCRIBE_PORT)),
        )?;
        let publish = Endpoint::parse_with_default(
            &template(&settings.publish_endpoint),
            Some(Port::Fixed(DEFAULT_CENTRAL_PUBLISH_PORT)),
        )?;
        let bridged = settings
            .subscribe_to
            .iter()
            .map(|entry| parse_subscribe_to(entry))
            .collect::<Result<Vec<_>>>()?;

        let message_log = if settings.message_log == DISABLED {
            None
        } else {
            let log_dir = std::path::absolute(&settings.log_dir)?;
            Some(MessageLog::open(&log_dir, &settings.message_log, Utc::now())?)
        };

        let (rpc_listener, rpc) = rpc.bind().await?;
        info!("bound rpc endpoint {rpc}");
        let (subscribe_listener, subscribe) = subscribe.bind().await?;
        info!("bound subscribe endpoint {subscribe}");
        let (publish_listener, publish) = publish.bind().await?;
        info!("bound publish endpoint {publish}");

        let outlet = Outlet::shared();
        let (_, monitor) = lock(&outlet).attach("");
        let (queue, forwarder) = spawn_forwarder(outlet.clone());
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_QUEUE_DEPTH);

        let mut tasks = vec![
            forwarder,
            tokio::spawn(serve_inlet(subscribe_listener, queue.clone())),
            tokio::spawn(serve_outlet(publish_listener, outlet)),
            tokio::spawn(control::serve_control(rpc_listener, rpc_tx)),
        ];

        let mut presence = PresenceTracker::new(Injector::new(queue.clone()));
        for (module, endpoint) in bridged {
            info!("bridging in {module} from {endpoint}");
            presence.seed(&module, &endpoint.to_string());
            tasks.push(tokio::spawn(relay(endpoint, queue.clone())));
        }

        let message_log_path = message_log.as_ref().map(|log| log.path().to_path_buf());
        let central = Central {
            presence,
            message_log,
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let sweep_interval = Duration::from_millis(settings.sweep_interval_ms.max(1));
        let core = tokio::spawn(central.run(monitor, rpc_rx, sweep_interval, shutdown_rx));

        Ok(CentralHandle {
            endpoints: BoundEndpoints {
                rpc,
                subscribe,
                publish,
            },
            message_log: message_log_path,
            shutdown: Some(shutdown_tx),
            core: Some(core),
            tasks,
        })
    }

    async fn run(
        mut self,
        mut monitor: UnboundedReceiver<Vec<u8>>,
        mut rpc: mpsc::Receiver<RpcCall>,
        sweep_interval: Duration,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(frame) = monitor.recv() => self.handle_frame(&frame),
                Some(call) = rpc.recv() => {
                    let response = control::handle_request(&call.request, &self.presence);
                    let _ = call.reply.send(response);
                }
                _ = sweep.tick() => {
                    let expired = self.presence.sweep(timestamp_us());
                    if !expired.is_empty() {
                        debug!("swept {} expired modules", expired.len());
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        if let Some(log) = self.message_log.take() {
            if let Err(e) = log.close() {
                error!("failed to close message log: {e}");
            }
        }
        info!("broker core stopped");
    }

    /// Log a tapped frame and feed heartbeats to the presence tracker.
    fn handle_frame(&mut self, frame: &[u8]) {
        if let Some(log) = self.message_log.as_mut() {
            log.log_message(frame);
        }
        if !frame.starts_with(HEARTBEAT_PREFIX.as_bytes()) {
            return;
        }
        let result = codec::split(frame)
            .map_err(BusError::from)
            .and_then(|(topic, body)| {
                let payload: Value = serde_json::from_slice(body)?;
                self.presence.handle_heartbeat(topic, payload, timestamp_us())
            });
        if let Err(e) = result {
            warn!(
                "error while handling heartbeat: {e} | {}",
                String::from_utf8_lossy(&frame[..frame.len().min(100)])
            );
        }
    }
}

/// Parse a `<moduleName>@<endpoint>` bridge entry.
fn parse_subscribe_to(entry: &str) -> Result<(String, Endpoint)> {
    let (module, endpoint) = entry.split_once('@').ok_or_else(|| BusError::Endpoint {
        endpoint: entry.to_string(),
        reason: "--subscribe-to argument is not in the format \"<moduleName>@<endpoint>\"".to_string(),
    })?;
    if module.is_empty() {
        return Err(BusError::Endpoint {
            endpoint: entry.to_string(),
            reason: "missing module name".to_string(),
        });
    }
    Ok((module.to_string(), endpoint.parse()?))
}

/// Pull everything a non-central-aware publisher emits into the forwarder.
async fn relay(endpoint: Endpoint, queue: UnboundedSender<Vec<u8>>) {
    // Keeping the control sender alive keeps the connection loop running.
    let (_control, control_rx) = mpsc::unbounded_channel::<ClientMessage>();
    pull_frames(
        endpoint,
        control_rx,
        || vec![String::new()],
        move |frame| {
            let _ = queue.send(frame);
        },
    )
    .await;
}
