mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    ChannelSettings, CircuitBreakerSettings, ConsumerSettings, DeadLetterSettings,
    LoggingSettings, ProducerSettings, RetrierSettings, Settings, StorageSettings,
};

/// Loads the configuration from the default file and environment variables.
///
/// Sources, lowest priority first: built-in defaults, `config/default.*`,
/// then `LINKBUS_*` environment variables (nested keys use `__`, lists are
/// comma separated, e.g. `LINKBUS_CONSUMER__TOPICS=links,updates`).
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Like [`load_config`], with an extra file layered over `config/default`.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder().add_source(File::with_name("config/default").required(false));
    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path));
    }
    let builder = builder.add_source(
        Environment::with_prefix("LINKBUS")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("brokers")
            .with_list_parse_key("consumer.topics")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available, then merge with defaults
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge(Settings::default());
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    /// Rejects settings the pipeline cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Message("at least one broker address is required".into()));
        }
        if self.consumer.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::Message("at least one consumer topic is required".into()));
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker.failure_ratio) {
            return Err(ConfigError::Message(format!(
                "circuit_breaker.failure_ratio must be within 0.0..=1.0, got {}",
                self.circuit_breaker.failure_ratio
            )));
        }
        if self.retrier.check_interval_ms == 0 || self.retrier.initial_delay_ms == 0 {
            return Err(ConfigError::Message(
                "retrier.check_interval_ms and retrier.initial_delay_ms must be positive".into(),
            ));
        }
        if self.channels.output_buffer == 0 || self.channels.publish_buffer == 0 {
            return Err(ConfigError::Message("channel buffers must be positive".into()));
        }
        Ok(())
    }
}
