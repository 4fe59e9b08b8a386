use std::time::Duration;

use serde::Deserialize;

use crate::broker::{Partitioner, RequiredAcks};

/// Top-level configuration settings for the pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Broker address list. Required.
    pub brokers: Vec<String>,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub retrier: RetrierSettings,
    pub dead_letter: DeadLetterSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub storage: StorageSettings,
    pub channels: ChannelSettings,
    pub logging: LoggingSettings,
}

/// Producer-side settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ProducerSettings {
    /// Retries after the first attempt before a publish is reported as failed.
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub required_acks: RequiredAcks,
    pub partitioner: Partitioner,
}

/// Consumer-group settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    /// Topics to subscribe to. Required.
    pub topics: Vec<String>,
    pub group_id: String,
    /// Log claim-level errors instead of swallowing them silently.
    pub return_errors: bool,
    pub reconnect_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrierSettings {
    pub max_retries: u32,
    pub table: String,
    pub check_interval_ms: u64,
    pub initial_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeadLetterSettings {
    pub table: String,
}

/// Circuit breaker guarding the publish path.
#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerSettings {
    /// Probe requests allowed through while half-open.
    pub max_half_open_requests: u32,
    /// Rolling window after which closed-state counts are cleared.
    pub interval_secs: u64,
    /// How long the breaker stays open before probing.
    pub timeout_secs: u64,
    pub min_requests: u32,
    pub consecutive_failures: u32,
    /// Failure rate in `0.0..=1.0` that trips the breaker once `min_requests` is reached.
    pub failure_ratio: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
}

/// Capacities of the application-facing channels.
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSettings {
    pub output_buffer: usize,
    pub publish_buffer: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl ProducerSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl ConsumerSettings {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl RetrierSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl CircuitBreakerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from [`Settings::default`].
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub brokers: Option<Vec<String>>,
    pub producer: Option<PartialProducerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub retrier: Option<PartialRetrierSettings>,
    pub dead_letter: Option<PartialDeadLetterSettings>,
    pub circuit_breaker: Option<PartialCircuitBreakerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub channels: Option<PartialChannelSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialProducerSettings {
    pub retry_max: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub required_acks: Option<RequiredAcks>,
    pub partitioner: Option<Partitioner>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialConsumerSettings {
    pub topics: Option<Vec<String>>,
    pub group_id: Option<String>,
    pub return_errors: Option<bool>,
    pub reconnect_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialRetrierSettings {
    pub max_retries: Option<u32>,
    pub table: Option<String>,
    pub check_interval_ms: Option<u64>,
    pub initial_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialDeadLetterSettings {
    pub table: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialCircuitBreakerSettings {
    pub max_half_open_requests: Option<u32>,
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub min_requests: Option<u32>,
    pub consecutive_failures: Option<u32>,
    pub failure_ratio: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialChannelSettings {
    pub output_buffer: Option<usize>,
    pub publish_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let producer = self.producer.unwrap_or_default();
        let consumer = self.consumer.unwrap_or_default();
        let retrier = self.retrier.unwrap_or_default();
        let dead_letter = self.dead_letter.unwrap_or_default();
        let breaker = self.circuit_breaker.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let channels = self.channels.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            brokers: self.brokers.unwrap_or(default.brokers),
            producer: ProducerSettings {
                retry_max: producer.retry_max.unwrap_or(default.producer.retry_max),
                retry_backoff_ms: producer
                    .retry_backoff_ms
                    .unwrap_or(default.producer.retry_backoff_ms),
                required_acks: producer
                    .required_acks
                    .unwrap_or(default.producer.required_acks),
                partitioner: producer.partitioner.unwrap_or(default.producer.partitioner),
            },
            consumer: ConsumerSettings {
                topics: consumer.topics.unwrap_or(default.consumer.topics),
                group_id: consumer.group_id.unwrap_or(default.consumer.group_id),
                return_errors: consumer
                    .return_errors
                    .unwrap_or(default.consumer.return_errors),
                reconnect_backoff_ms: consumer
                    .reconnect_backoff_ms
                    .unwrap_or(default.consumer.reconnect_backoff_ms),
            },
            retrier: RetrierSettings {
                max_retries: retrier.max_retries.unwrap_or(default.retrier.max_retries),
                table: retrier.table.unwrap_or(default.retrier.table),
                check_interval_ms: retrier
                    .check_interval_ms
                    .unwrap_or(default.retrier.check_interval_ms),
                initial_delay_ms: retrier
                    .initial_delay_ms
                    .unwrap_or(default.retrier.initial_delay_ms),
            },
            dead_letter: DeadLetterSettings {
                table: dead_letter.table.unwrap_or(default.dead_letter.table),
            },
            circuit_breaker: CircuitBreakerSettings {
                max_half_open_requests: breaker
                    .max_half_open_requests
                    .unwrap_or(default.circuit_breaker.max_half_open_requests),
                interval_secs: breaker
                    .interval_secs
                    .unwrap_or(default.circuit_breaker.interval_secs),
                timeout_secs: breaker
                    .timeout_secs
                    .unwrap_or(default.circuit_breaker.timeout_secs),
                min_requests: breaker
                    .min_requests
                    .unwrap_or(default.circuit_breaker.min_requests),
                consecutive_failures: breaker
                    .consecutive_failures
                    .unwrap_or(default.circuit_breaker.consecutive_failures),
                failure_ratio: breaker
                    .failure_ratio
                    .unwrap_or(default.circuit_breaker.failure_ratio),
            },
            storage: StorageSettings {
                path: storage.path.unwrap_or(default.storage.path),
            },
            channels: ChannelSettings {
                output_buffer: channels
                    .output_buffer
                    .unwrap_or(default.channels.output_buffer),
                publish_buffer: channels
                    .publish_buffer
                    .unwrap_or(default.channels.publish_buffer),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
///
/// Broker addresses and consumer topics have no sensible default and are left
/// empty; [`Settings::validate`] rejects them.
impl Default for Settings {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            producer: ProducerSettings {
                retry_max: 3,
                retry_backoff_ms: 100,
                required_acks: RequiredAcks::Leader,
                partitioner: Partitioner::Random,
            },
            consumer: ConsumerSettings {
                topics: Vec::new(),
                group_id: "default".to_string(),
                return_errors: true,
                reconnect_backoff_ms: 5000,
            },
            retrier: RetrierSettings {
                max_retries: 3,
                table: "retry_messages".to_string(),
                check_interval_ms: 600_000,
                initial_delay_ms: 600_000,
            },
            dead_letter: DeadLetterSettings {
                table: "dead_letter_messages".to_string(),
            },
            circuit_breaker: CircuitBreakerSettings {
                max_half_open_requests: 1,
                interval_secs: 60,
                timeout_secs: 30,
                min_requests: 5,
                consecutive_failures: 5,
                failure_ratio: 0.6,
            },
            storage: StorageSettings {
                path: "linkbus_db".to_string(),
            },
            channels: ChannelSettings {
                output_buffer: 64,
                publish_buffer: 64,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
