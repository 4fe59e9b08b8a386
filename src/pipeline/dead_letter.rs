//! Quarantine sink.
//!
//! Persists every quarantined message as a [`DeadLetterRecord`], then acks it
//! so a live session commits the offset and the broker does not hand the
//! record out again. Nothing reads dead letters back into the pipeline.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::persistence::{DeadLetterRecord, DeadLetterStore};
use crate::pipeline::message::Message;
use crate::utils::error::Result;

pub struct DeadLetterSink {
    store: DeadLetterStore,
    quarantined: mpsc::Receiver<Message>,
}

impl DeadLetterSink {
    pub fn new(store: DeadLetterStore, quarantined: mpsc::Receiver<Message>) -> Self {
        Self { store, quarantined }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!("quarantine sink started");
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = self.quarantined.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            self.handle(message, &shutdown).await;
        }
        info!("quarantine sink stopped");
        Ok(())
    }

    async fn handle(&self, message: Message, shutdown: &CancellationToken) {
        let record = DeadLetterRecord {
            id: 0,
            value: message.payload().to_string(),
            topic: message.topic().to_string(),
            partition: message.partition(),
            kafka_offset: message.offset(),
            retry_count: message.redelivery_count(),
            created_at: Utc::now(),
        };
        match self.store.insert(record) {
            Ok(stored) => warn!(
                id = stored.id,
                topic = %stored.topic,
                partition = stored.partition,
                offset = stored.kafka_offset,
                retry_count = stored.retry_count,
                "message quarantined"
            ),
            Err(e) => {
                // Without a row there is nothing to hold the message, so leave
                // the offset uncommitted for the broker to redeliver.
                error!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    error = %e,
                    "failed to persist dead letter, dropping message"
                );
                return;
            }
        }

        let acked = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            acked = message.ack() => acked,
        };
        if let Err(e) = acked {
            warn!(error = %e, "could not ack quarantined message");
        }
    }
}
