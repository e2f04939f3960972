//! Presence tracking
//!
//! Every module announces itself with heartbeats on
//! `central.heartbeat.<module>`. The tracker keeps one record per module and
//! drives a small state machine:
//! - first heartbeat: the module becomes alive, `central.connect.<module>` is
//!   announced with the heartbeat payload
//! - heartbeat with the same publish endpoint: the deadline is refreshed
//! - heartbeat with a different publish endpoint: the old instance is
//!   considered gone, so a disconnect is announced before a new connect
//! - sweep past the deadline: `central.disconnect.<module>` is announced and
//!   the record is dropped
//!
//! Announcements go back through the `Injector`, so subscribers and the
//! message log see them exactly like module traffic.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::transport::forwarder::Injector;
use crate::utils::Result;

pub const HEARTBEAT_PREFIX: &str = "central.heartbeat.";
pub const CONNECT_PREFIX: &str = "central.connect.";
pub const DISCONNECT_PREFIX: &str = "central.disconnect.";

/// Keepalive applied when a heartbeat does not carry its own, in µs.
pub const DEFAULT_KEEPALIVE_US: i64 = 10_000_000;

/// What the broker knows about one live module.
///
/// The known heartbeat fields are typed; anything else the module sends is
/// kept in `extra` and reported back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulePresence {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "pub", default, skip_serializing_if = "Option::is_none")]
    pub publish_endpoint: Option<String>,
    /// Microseconds the module may stay silent.
    #[serde(
        default,
        deserialize_with = "keepalive_from_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub keepalive: Option<i64>,
    /// Absolute deadline in µs. Modules bridged in with `subscribe_to` have
    /// none and are never swept.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Any JSON number is a keepalive; floats are truncated and negative values
/// clamp to zero. Anything else falls back to the tracker's default.
fn keepalive_from_number<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let keepalive = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|_| i64::MAX))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    };
    Ok(keepalive.map(|us| us.max(0)))
}

impl ModulePresence {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            host: None,
            publish_endpoint: None,
            keepalive: None,
            deadline: None,
            extra: Map::new(),
        }
    }

    pub fn expired(&self, now_us: i64) -> bool {
        self.deadline.is_some_and(|deadline| now_us > deadline)
    }
}

#[derive(Debug)]
pub struct PresenceTracker {
    modules: BTreeMap<String, ModulePresence>,
    injector: Injector,
    default_keepalive_us: i64,
}

impl PresenceTracker {
    pub fn new(injector: Injector) -> Self {
        Self::with_keepalive(injector, DEFAULT_KEEPALIVE_US)
    }

    pub fn with_keepalive(injector: Injector, default_keepalive_us: i64) -> Self {
        Self {
            modules: BTreeMap::new(),
            injector,
            default_keepalive_us,
        }
    }

    pub fn modules(&self) -> &BTreeMap<String, ModulePresence> {
        &self.modules
    }

    pub fn get(&self, module: &str) -> Option<&ModulePresence> {
        self.modules.get(module)
    }

    /// Register a module that never heartbeats (bridged in by configuration).
    pub fn seed(&mut self, module: &str, publish_endpoint: &str) {
        let mut record = ModulePresence::new(module);
        record.publish_endpoint = Some(publish_endpoint.to_string());
        self.modules.insert(module.to_string(), record);
    }

    /// Process a heartbeat frame's topic and decoded body.
    pub fn handle_heartbeat(&mut self, topic: &str, mut payload: Value, now_us: i64) -> Result<()> {
        if let Value::Object(fields) = &mut payload {
            if !fields.contains_key("module") {
                let name = topic.strip_prefix(HEARTBEAT_PREFIX).unwrap_or(topic);
                fields.insert("module".to_string(), Value::String(name.to_string()));
            }
            fields
                .entry("timestamp")
                .or_insert_with(|| Value::String(now_us.to_string()));
        }

        let mut record: ModulePresence = serde_json::from_value(payload.clone())?;
        match self.modules.get(&record.module) {
            Some(old) if old.publish_endpoint != record.publish_endpoint => {
                self.announce_disconnect(&record.module, now_us);
                self.announce_connect(&record.module, &payload);
            }
            Some(_) => {}
            None => self.announce_connect(&record.module, &payload),
        }

        let keepalive = record.keepalive.unwrap_or(self.default_keepalive_us).max(0);
        record.deadline = Some(now_us.saturating_add(keepalive));
        self.modules.insert(record.module.clone(), record);
        Ok(())
    }

    /// Remove every module whose deadline has passed. Returns their names.
    pub fn sweep(&mut self, now_us: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .modules
            .values()
            .filter(|record| record.expired(now_us))
            .map(|record| record.module.clone())
            .collect();
        for module in &expired {
            self.announce_disconnect(module, now_us);
            self.modules.remove(module);
        }
        expired
    }

    fn announce_connect(&self, module: &str, payload: &Value) {
        info!("module {module} connected");
        self.injector
            .inject_json(&format!("{CONNECT_PREFIX}{module}"), payload);
    }

    fn announce_disconnect(&self, module: &str, now_us: i64) {
        info!("module {module} disconnected");
        self.injector.inject_json(
            &format!("{DISCONNECT_PREFIX}{module}"),
            &json!({ "timestamp": now_us.to_string() }),
        );
    }
}
