//! The delivery pipeline.
//!
//! [`Pipeline::start`] opens the durable tables, creates the lifecycle signal
//! channels and wires every component to them:
//!
//! ```text
//!  app ──PublisherHandle──▶ Publisher ──(breaker)──▶ broker
//!  broker ──▶ Subscriber ──messages──▶ app
//!  app ──ack──▶ Subscriber (commit)
//!  app ──nack──▶ Retrier ──(due)──▶ messages
//!  app / Retrier ──quarantine──▶ DeadLetterSink ──ack──▶ Subscriber
//! ```
//!
//! The application only ever touches the two surfaces on [`Pipeline`]: the
//! `messages` receiver and the `publisher` handle.

pub mod channels;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod message;
pub mod publisher;
pub mod retrier;
pub mod subscriber;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::Broker;
use crate::config::Settings;
use crate::persistence::Store;
use crate::utils::error::{PipelineError, Result};

pub use channels::{SignalReceivers, Signals, signal_channels};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Counts};
pub use dead_letter::DeadLetterSink;
pub use message::Message;
pub use publisher::{PublishRequest, Publisher, PublisherHandle};
pub use retrier::{Retrier, retry_at};
pub use subscriber::Subscriber;

/// A running pipeline and its two application-facing surfaces.
pub struct Pipeline {
    /// Delivered and redelivered messages, in arrival order.
    pub messages: mpsc::Receiver<Message>,
    pub publisher: PublisherHandle,
    pub handle: PipelineHandle,
}

impl Pipeline {
    /// Open the tables, join the consumer group and spawn every component.
    ///
    /// Table creation and the first group join are the only fatal errors;
    /// everything after that is logged by the component that hit it.
    pub async fn start(
        settings: &Settings,
        broker: Arc<dyn Broker>,
        store: Store,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let retry_store = store.retry_table(&settings.retrier.table)?;
        // Rows claimed by a previous run were never settled; serve them again.
        let recovered = retry_store.recover_claimed()?;
        if recovered > 0 {
            info!(recovered, "returned unfinished redeliveries to the retry table");
        }
        let dead_letter_store = store.dead_letter_table(&settings.dead_letter.table)?;

        let (signals, receivers) = signal_channels();
        let (output_tx, output_rx) = mpsc::channel(settings.channels.output_buffer);

        let retrier = Retrier::new(
            retry_store,
            settings.retrier.clone(),
            receivers.nack,
            output_tx.clone(),
            signals.clone(),
        );
        let dead_letter = DeadLetterSink::new(dead_letter_store, receivers.quarantine);
        let mut subscriber = Subscriber::new(
            broker.clone(),
            settings.consumer.clone(),
            signals,
            output_tx,
            receivers.ack,
            retrier,
            dead_letter,
        );
        subscriber.connect().await?;

        let breaker = Arc::new(CircuitBreaker::new(
            "publisher",
            CircuitBreakerConfig::from(&settings.circuit_breaker),
        ));
        let publisher = Publisher::new(broker, settings.producer.clone(), breaker);
        let (publisher_handle, requests) = publisher.channel(settings.channels.publish_buffer);

        let subscriber_task = tokio::spawn(subscriber.run(shutdown.clone()));
        let publisher_task = tokio::spawn(publisher.run(requests, shutdown.clone()));

        info!(
            brokers = ?settings.brokers,
            topics = ?settings.consumer.topics,
            group = %settings.consumer.group_id,
            "pipeline started"
        );
        Ok(Self {
            messages: output_rx,
            publisher: publisher_handle,
            handle: PipelineHandle {
                shutdown,
                subscriber: subscriber_task,
                publisher: publisher_task,
                store,
            },
        })
    }
}

/// Controls the background tasks of a [`Pipeline`].
pub struct PipelineHandle {
    shutdown: CancellationToken,
    subscriber: JoinHandle<Result<()>>,
    publisher: JoinHandle<()>,
    store: Store,
}

impl PipelineHandle {
    /// Ask every component to stop. Returns immediately; use [`wait`](Self::wait).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// `false` once the consuming side has stopped, for whatever reason.
    pub fn is_running(&self) -> bool {
        !self.subscriber.is_finished()
    }

    /// Wait until the consuming side stops, then stop the publisher and flush
    /// the store.
    ///
    /// Returns the first component error, if any.
    pub async fn wait(self) -> Result<()> {
        let consumed = self
            .subscriber
            .await
            .map_err(|e| PipelineError::Task(format!("subscriber: {e}")))
            .and_then(|result| result);

        self.shutdown.cancel();
        if let Err(e) = self.publisher.await {
            error!(error = %e, "publisher task failed");
        }
        if let Err(e) = self.store.flush().await {
            error!(error = %e, "failed to flush durable store");
        }
        info!("pipeline stopped");
        consumed
    }
}
