//! The `utils` module provides the pieces shared by every layer of `linkbus`:
//! the error taxonomy and logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, PipelineError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("bogus");
    }

    #[test]
    fn unavailable_errors_are_distinguishable() {
        assert!(PipelineError::CircuitOpen.is_unavailable());
        assert!(PipelineError::TooManyRequests.is_unavailable());
        assert!(PipelineError::Broker(BrokerError::Unavailable("down".into())).is_unavailable());
        assert!(!PipelineError::ChannelClosed("ack").is_unavailable());
        assert!(!PipelineError::Broker(BrokerError::UnknownTopic("t".into())).is_unavailable());
    }
}
