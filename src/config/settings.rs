use serde::Deserialize;

pub const DEFAULT_CENTRAL_RPC_PORT: u16 = 7500;
pub const DEFAULT_CENTRAL_SUBSCRIBE_PORT: u16 = 7501;
pub const DEFAULT_CENTRAL_PUBLISH_PORT: u16 = 7502;

/// Top-level configuration settings for the application.
///
/// Includes settings for the central broker, the publisher and subscriber
/// client library, and logging. Every field has a default, so a partial
/// configuration file only needs the values it changes.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub central: CentralSettings,
    pub publisher: PublisherSettings,
    pub subscriber: SubscriberSettings,
    pub logging: LoggingSettings,
}

/// Configuration of the central broker.
///
/// Endpoint values are templates: `{bindInterface}` is replaced by
/// `bind_interface` at startup.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CentralSettings {
    pub bind_interface: String,
    pub rpc_endpoint: String,
    pub subscribe_endpoint: String,
    pub publish_endpoint: String,
    /// Non-central-aware publishers to bridge in, as `<moduleName>@<endpoint>`.
    pub subscribe_to: Vec<String>,
    pub log_dir: String,
    /// Message log file name template, or `none`.
    pub message_log: String,
    /// Console (diagnostic) log file name template, or `none`.
    pub console_log: String,
    pub foreground: bool,
    pub sweep_interval_ms: u64,
}

/// Configuration of a publishing module.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublisherSettings {
    pub central_host: String,
    pub module_name: String,
    pub central_subscribe_endpoint: String,
    /// Central's control endpoint, used by `centralbus info`.
    pub central_rpc_endpoint: String,
    pub publish_endpoint: String,
    pub heartbeat_period_ms: u64,
    /// How long central should wait for the next heartbeat before declaring
    /// the module dead. Central's default applies when unset.
    pub keepalive_ms: Option<u64>,
}

/// Configuration of a subscribing module.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SubscriberSettings {
    pub central_host: String,
    pub module_name: String,
    pub central_publish_endpoint: String,
    /// Message logs to replay through the handlers; `-` reads stdin.
    pub replay: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for CentralSettings {
    fn default() -> Self {
        Self {
            bind_interface: "127.0.0.1".to_string(),
            rpc_endpoint: format!("tcp://{{bindInterface}}:{DEFAULT_CENTRAL_RPC_PORT}"),
            subscribe_endpoint: format!("tcp://{{bindInterface}}:{DEFAULT_CENTRAL_SUBSCRIBE_PORT}"),
            publish_endpoint: format!("tcp://{{bindInterface}}:{DEFAULT_CENTRAL_PUBLISH_PORT}"),
            subscribe_to: Vec::new(),
            log_dir: "log".to_string(),
            message_log: "central-messages-%s.txt".to_string(),
            console_log: "central-console-%s.txt".to_string(),
            foreground: false,
            sweep_interval_ms: 5000,
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            central_host: "127.0.0.1".to_string(),
            module_name: "module".to_string(),
            central_subscribe_endpoint: format!(
                "tcp://{{centralHost}}:{DEFAULT_CENTRAL_SUBSCRIBE_PORT}"
            ),
            central_rpc_endpoint: format!("tcp://{{centralHost}}:{DEFAULT_CENTRAL_RPC_PORT}"),
            publish_endpoint: "tcp://127.0.0.1:random".to_string(),
            heartbeat_period_ms: 5000,
            keepalive_ms: None,
        }
    }
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            central_host: "127.0.0.1".to_string(),
            module_name: "module".to_string(),
            central_publish_endpoint: format!(
                "tcp://{{centralHost}}:{DEFAULT_CENTRAL_PUBLISH_PORT}"
            ),
            replay: Vec::new(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
