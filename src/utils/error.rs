//! The `error` module defines the error types used within `linkbus`.
//!
//! Errors are split by the layer that raises them so callers can tell a broker
//! outage apart from a storage failure or an open circuit breaker.

use thiserror::Error;

/// Errors raised by a [`Broker`](crate::broker::Broker) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),

    #[error("topic `{0}` has no partitions")]
    NoPartitions(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("consumer group session closed")]
    SessionClosed,

    #[error("invalid broker configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to encode or decode stored record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Top-level error for the delivery pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The publish circuit breaker is open.
    #[error("service unavailable: circuit breaker is open")]
    CircuitOpen,

    /// The breaker is half-open and its probe budget is used up.
    #[error("service unavailable: too many requests while circuit breaker is half-open")]
    TooManyRequests,

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("failed to decode message payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Returns `true` when the error means "try later or use a fallback"
    /// rather than a fault in the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen | Self::TooManyRequests | Self::Broker(BrokerError::Unavailable(_))
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
