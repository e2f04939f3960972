//! Subscriber
//!
//! Handlers are registered per topic prefix. Several handlers may share a
//! prefix; the transport-level subscription for a prefix is only sent when
//! its first handler is registered and only withdrawn when its last handler
//! is removed.
//!
//! An incoming frame is decoded once and handed to every handler of every
//! registered prefix that is a literal prefix of its topic.

use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{DEFAULT_CENTRAL_PUBLISH_PORT, SubscriberSettings};
use crate::persistence::log_reader::{LogParser, open_log};
use crate::transport::codec;
use crate::transport::endpoint::{self, CENTRAL_HOST_TOKEN, Endpoint, Port};
use crate::transport::message::ClientMessage;
use crate::transport::websocket::pull_frames;
use crate::utils::{Result, lock};

/// Replay progress is logged every this many records.
const REPLAY_PROGRESS_INTERVAL: usize = 10_000;

/// Replay source name meaning standard input.
pub const STDIN: &str = "-";

pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Identifies one registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId {
    pub prefix: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records read from the logs.
    pub replayed: usize,
    /// Records that reached at least one handler.
    pub handled: usize,
}

#[derive(Default)]
struct Registry {
    prefixes: BTreeMap<String, BTreeMap<u64, Handler>>,
    next_seq: u64,
}

impl Registry {
    fn prefixes(&self) -> Vec<String> {
        self.prefixes.keys().cloned().collect()
    }

    fn matching(&self, topic: &str) -> Vec<Handler> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .flat_map(|(_, handlers)| handlers.values().cloned())
            .collect()
    }
}

/// Decode `frame` and call every matching handler. Returns whether any
/// handler was called.
fn dispatch(registry: &Mutex<Registry>, frame: &[u8]) -> bool {
    let (topic, body) = match codec::split(frame) {
        Ok(parts) => parts,
        Err(e) => {
            warn!(
                "dropping undecodable frame ({e}): {}",
                String::from_utf8_lossy(&frame[..frame.len().min(100)])
            );
            return false;
        }
    };
    // handlers run without the registry lock so they may (un)subscribe
    let handlers = lock(registry).matching(topic);
    for handler in &handlers {
        handler(topic, body);
    }
    !handlers.is_empty()
}

struct Link {
    control: UnboundedSender<ClientMessage>,
    task: JoinHandle<()>,
}

pub struct Subscriber {
    settings: SubscriberSettings,
    registry: Arc<Mutex<Registry>>,
    links: Vec<Link>,
}

impl Subscriber {
    pub fn new(settings: SubscriberSettings) -> Self {
        Self {
            settings,
            registry: Arc::new(Mutex::new(Registry::default())),
            links: Vec::new(),
        }
    }

    /// Connect to central's publish endpoint.
    pub fn start(&mut self) -> Result<()> {
        let central = Endpoint::parse_with_default(
            &endpoint::expand(
                &self.settings.central_publish_endpoint,
                CENTRAL_HOST_TOKEN,
                &self.settings.central_host,
            ),
            Some(Port::Fixed(DEFAULT_CENTRAL_PUBLISH_PORT)),
        )?;
        info!(
            "{} subscribing to central at {central}",
            self.settings.module_name
        );
        self.connect(central);
        Ok(())
    }

    /// Additionally receive from another outlet, e.g. a publisher's own
    /// endpoint.
    pub fn connect(&mut self, endpoint: Endpoint) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let snapshot = self.registry.clone();
        let registry = self.registry.clone();
        let task = tokio::spawn(pull_frames(
            endpoint,
            control_rx,
            move || lock(&snapshot).prefixes(),
            move |frame| {
                dispatch(&registry, &frame);
            },
        ));
        self.links.push(Link { control, task });
    }

    /// Close every connection. Registered handlers are kept.
    pub fn stop(&mut self) {
        for link in self.links.drain(..) {
            link.task.abort();
        }
    }

    fn broadcast(&self, message: ClientMessage) {
        for link in &self.links {
            let _ = link.control.send(message.clone());
        }
    }

    /// Register `handler` for every message whose topic starts with `prefix`.
    pub fn subscribe_raw<F>(&self, prefix: &str, handler: F) -> HandlerId
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let seq = registry.next_seq;
        registry.next_seq += 1;
        let handlers = registry.prefixes.entry(prefix.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.insert(seq, Arc::new(handler));
        if first {
            self.broadcast(ClientMessage::Subscribe {
                prefix: prefix.to_string(),
            });
        }
        HandlerId {
            prefix: prefix.to_string(),
            seq,
        }
    }

    /// Like `subscribe_raw`, with the body decoded as JSON. Bodies that are
    /// not JSON are logged and skipped.
    pub fn subscribe_json<F>(&self, prefix: &str, handler: F) -> HandlerId
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        self.subscribe_raw(prefix, move |topic, body| {
            match serde_json::from_slice::<Value>(body) {
                Ok(value) => handler(topic, value),
                Err(e) => warn!("dropping message on {topic}: body is not json: {e}"),
            }
        })
    }

    /// Subscribe to structured records sent as `{"data": <record>}`. The
    /// record's `Deserialize` implementation turns `data` into a `T`.
    pub fn subscribe_record<T, F>(&self, prefix: &str, handler: F) -> HandlerId
    where
        T: DeserializeOwned,
        F: Fn(&str, T) + Send + Sync + 'static,
    {
        self.subscribe_json(prefix, move |topic, mut value| {
            let Some(data) = value.get_mut("data").map(Value::take) else {
                warn!("dropping message on {topic}: no data field");
                return;
            };
            match serde_json::from_value::<T>(data) {
                Ok(record) => handler(topic, record),
                Err(e) => warn!("dropping message on {topic}: {e}"),
            }
        })
    }

    /// Remove one handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: &HandlerId) -> bool {
        let mut registry = lock(&self.registry);
        let Some(handlers) = registry.prefixes.get_mut(&id.prefix) else {
            return false;
        };
        if handlers.remove(&id.seq).is_none() {
            return false;
        }
        if handlers.is_empty() {
            registry.prefixes.remove(&id.prefix);
            self.broadcast(ClientMessage::Unsubscribe {
                prefix: id.prefix.clone(),
            });
        }
        true
    }

    /// Prefixes with at least one handler.
    pub fn prefixes(&self) -> Vec<String> {
        lock(&self.registry).prefixes()
    }

    /// Dispatch one encoded frame as if it had arrived from the network.
    pub fn route(&self, frame: &[u8]) -> bool {
        dispatch(&self.registry, frame)
    }

    /// Feed every record of the configured replay logs through the handlers.
    pub fn replay(&self) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        for source in &self.settings.replay {
            info!("replaying {source}");
            if source == STDIN {
                self.replay_from(LogParser::new(io::stdin().lock()), &mut stats);
            } else {
                self.replay_from(open_log(source)?, &mut stats);
            }
        }
        info!(
            "replayed {} records, {} handled",
            stats.replayed, stats.handled
        );
        Ok(stats)
    }

    fn replay_from<R: BufRead>(&self, parser: LogParser<R>, stats: &mut ReplayStats) {
        for record in parser {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("stopping replay: {e}");
                    return;
                }
            };
            stats.replayed += 1;
            if self.route(&record.raw) {
                stats.handled += 1;
            }
            if stats.replayed % REPLAY_PROGRESS_INTERVAL == 0 {
                info!("replay progress: {} records", stats.replayed);
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop();
    }
}
