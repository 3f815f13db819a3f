//! Configuration loading.
//!
//! Sources, lowest priority first: built-in defaults, a TOML file, then
//! environment variables such as `TOPICMQ_BROKER__MAX_QOS=1`.

mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File, Source};

pub use settings::{
    BrokerSettings, PartialBrokerSettings, PartialServerSettings, PartialSettings, ServerSettings,
    Settings,
};

/// File consulted by `load_config`, relative to the working directory.
pub const DEFAULT_CONFIG: &str = "config/default";

pub const ENV_PREFIX: &str = "TOPICMQ";

/// Loads the configuration from the default file (if present) and the
/// environment, merged onto the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(File::with_name(DEFAULT_CONFIG).required(false))
}

/// Like `load_config` but reads `path`, which must exist.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    load(File::from(path.as_ref()).required(true))
}

fn load<S>(file: S) -> Result<Settings, ConfigError>
where
    S: Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = Settings::merge(partial);
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests;
