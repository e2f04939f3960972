mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    CentralSettings, DEFAULT_CENTRAL_PUBLISH_PORT, DEFAULT_CENTRAL_RPC_PORT,
    DEFAULT_CENTRAL_SUBSCRIBE_PORT, LoggingSettings, PublisherSettings, Settings,
    SubscriberSettings,
};

/// Prefix of environment variables, e.g. `CENTRALBUS_CENTRAL__LOG_DIR`.
pub const ENV_PREFIX: &str = "CENTRALBUS";

/// Loads the configuration from the default file and environment variables.
/// Anything not specified keeps its built-in default.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(File::with_name("config/default").required(false))
}

/// Loads the configuration from an explicit file plus environment variables.
pub fn load_config_from(path: &Path) -> Result<Settings, ConfigError> {
    build(File::from(path).required(true))
}

fn build<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests;
