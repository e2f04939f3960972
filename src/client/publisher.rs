//! Publisher
//!
//! A `Publisher` pushes frames to central's inlet and heartbeats on
//! `central.heartbeat.<module>` so central knows it is alive. Every frame is
//! also offered on the publisher's own bound outlet, so subscribers that do
//! not go through central can connect to it directly.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info};

use crate::broker::presence::HEARTBEAT_PREFIX;
use crate::config::{DEFAULT_CENTRAL_SUBSCRIBE_PORT, PublisherSettings};
use crate::transport::codec::{self, Attachment};
use crate::transport::endpoint::{self, CENTRAL_HOST_TOKEN, Endpoint, Port};
use crate::transport::outlet::{Outlet, SharedOutlet};
use crate::transport::websocket::{push_frames, serve_outlet};
use crate::utils::{BusError, Result, lock, short_host_name, timestamp_us};

/// How long `stop` waits for queued frames to reach central.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// The sending half shared by the publisher and its heartbeat task.
#[derive(Debug, Clone)]
struct Link {
    module: String,
    host: String,
    endpoint: Endpoint,
    keepalive_us: Option<i64>,
    central: UnboundedSender<Vec<u8>>,
    outlet: SharedOutlet,
}

impl Link {
    fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        lock(&self.outlet).publish(&frame);
        self.central.send(frame).map_err(|_| BusError::Closed)
    }

    fn send_json(&self, topic: &str, mut body: Value) -> Result<()> {
        if let Value::Object(fields) = &mut body {
            fields
                .entry("module")
                .or_insert_with(|| Value::String(self.module.clone()));
            fields
                .entry("timestamp")
                .or_insert_with(|| Value::String(timestamp_us().to_string()));
        }
        self.send_frame(codec::encode(topic, &serde_json::to_vec(&body)?))
    }

    fn heartbeat(&self) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("host".to_string(), Value::String(self.host.clone()));
        payload.insert("pub".to_string(), Value::String(self.endpoint.to_string()));
        if let Some(keepalive) = self.keepalive_us {
            payload.insert("keepalive".to_string(), json!(keepalive));
        }
        self.send_json(
            &format!("{HEARTBEAT_PREFIX}{}", self.module),
            Value::Object(payload),
        )
    }
}

pub struct Publisher {
    settings: PublisherSettings,
    link: Option<Link>,
    pusher: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Publisher {
    pub fn new(settings: PublisherSettings) -> Self {
        Self {
            settings,
            link: None,
            pusher: None,
            tasks: Vec::new(),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.settings.module_name
    }

    /// Bind the publish endpoint, start pushing to central and heartbeat
    /// immediately, then every `heartbeat_period_ms`.
    pub async fn start(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }

        let central = Endpoint::parse_with_default(
            &endpoint::expand(
                &self.settings.central_subscribe_endpoint,
                CENTRAL_HOST_TOKEN,
                &self.settings.central_host,
            ),
            Some(Port::Fixed(DEFAULT_CENTRAL_SUBSCRIBE_PORT)),
        )?;
        let publish = Endpoint::parse_with_default(&self.settings.publish_endpoint, Some(Port::Random))?;
        let (listener, publish) = publish.bind().await?;
        info!(
            "{} publishing on {publish}, central at {central}",
            self.settings.module_name
        );

        let outlet = Outlet::shared();
        self.tasks.push(tokio::spawn(serve_outlet(listener, outlet.clone())));
        let (tx, rx) = mpsc::unbounded_channel();
        self.pusher = Some(tokio::spawn(push_frames(central, rx)));

        let link = Link {
            module: self.settings.module_name.clone(),
            host: short_host_name(),
            endpoint: publish,
            keepalive_us: self
                .settings
                .keepalive_ms
                .map(|ms| i64::try_from(ms.saturating_mul(1000)).unwrap_or(i64::MAX)),
            central: tx,
            outlet,
        };
        link.heartbeat()?;

        let period = Duration::from_millis(self.settings.heartbeat_period_ms.max(1));
        let heartbeat = link.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if heartbeat.heartbeat().is_err() {
                    debug!("heartbeat stopped: link closed");
                    return;
                }
            }
        }));

        self.link = Some(link);
        Ok(())
    }

    /// Stop heartbeating, give queued frames a moment to reach central, then
    /// close every connection.
    pub async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.link = None;
        if let Some(mut pusher) = self.pusher.take() {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut pusher).await.is_err() {
                debug!("dropping frames central did not accept in time");
                pusher.abort();
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.link.is_some()
    }

    /// Resolved endpoint of the publisher's own outlet.
    pub fn publish_endpoint(&self) -> Option<&Endpoint> {
        self.link.as_ref().map(|link| &link.endpoint)
    }

    fn link(&self) -> Result<&Link> {
        self.link.as_ref().ok_or(BusError::NotStarted("publisher"))
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.link()?.heartbeat()
    }

    /// Send a frame that is already encoded as `<topic>:<body>`.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.link()?.send_frame(frame)
    }

    pub fn send_raw(&self, topic: &str, body: &[u8]) -> Result<()> {
        self.send_frame(codec::encode(topic, body))
    }

    /// Send a JSON body. Objects get `module` and `timestamp` fields unless
    /// they already have them.
    pub fn send_json(&self, topic: &str, body: Value) -> Result<()> {
        self.link()?.send_json(topic, body)
    }

    /// Send a structured record wrapped as `{"data": <record>}`.
    pub fn send_record<T: Serialize>(&self, topic: &str, record: &T) -> Result<()> {
        self.send_json(topic, json!({ "data": serde_json::to_value(record)? }))
    }

    /// Send a JSON payload together with named binary attachments.
    pub fn send_with_attachments(
        &self,
        topic: &str,
        body: &Value,
        attachments: &[Attachment],
    ) -> Result<()> {
        let json = serde_json::to_vec(body)?;
        self.send_raw(topic, &codec::encode_multipart(&json, attachments))
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
