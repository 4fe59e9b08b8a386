//! The unit of work handed to application code.
//!
//! A `Message` is created by the subscriber for a live broker record
//! (`redelivery_count == 0`) or by the retrier when a stored retry comes due
//! (`redelivery_count > 0`). Application code must finish it with exactly one
//! of [`Message::ack`], [`Message::nack`] or [`Message::quarantine`]; they take
//! the message by value, so a second call does not compile. Dropping a message
//! without calling any of them leaves its offset uncommitted, or, for a
//! redelivered message, leaves its retry row claimed until the next start.

use serde::de::DeserializeOwned;

use crate::broker::Record;
use crate::pipeline::channels::Signals;
use crate::persistence::{RetryRecord, RetryStore};
use crate::utils::error::{PipelineError, Result};

#[derive(Debug)]
pub struct Message {
    topic: String,
    partition: i32,
    offset: i64,
    key: String,
    payload: String,
    redelivery_count: u32,
    signals: Signals,
    claim: Option<RetryClaim>,
}

/// The claimed retry row a redelivered message came from.
#[derive(Debug)]
pub(crate) struct RetryClaim {
    store: RetryStore,
    id: u64,
}

impl RetryClaim {
    pub(crate) fn settle(self) -> Result<()> {
        self.store.settle(self.id)?;
        Ok(())
    }
}

impl Message {
    /// Wrap a record delivered by a live consumer-group session.
    pub(crate) fn delivered(record: Record, signals: Signals) -> Self {
        Self {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            payload: record.payload,
            redelivery_count: 0,
            signals,
            claim: None,
        }
    }

    /// Rebuild a message from a due retry row.
    pub(crate) fn redelivered(record: RetryRecord, signals: Signals) -> Self {
        Self {
            topic: record.topic,
            partition: record.partition,
            offset: record.kafka_offset,
            key: record.key,
            payload: record.value,
            redelivery_count: record.retry_count,
            signals,
            claim: None,
        }
    }

    /// Tie the message to the claimed row `id` of `store`; the row is
    /// settled when the message reaches a terminal state.
    pub(crate) fn claimed_from(mut self, store: &RetryStore, id: u64) -> Self {
        self.claim = Some(RetryClaim {
            store: store.clone(),
            id,
        });
        self
    }

    pub(crate) fn take_claim(&mut self) -> Option<RetryClaim> {
        self.claim.take()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// `0` on first delivery, otherwise the number of nacks so far.
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    /// Decode the JSON payload into `T`.
    ///
    /// A decode error leaves the message untouched; since retrying will not
    /// fix the payload, the usual response is [`Message::quarantine`].
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload).map_err(PipelineError::Decode)
    }

    /// Report success.
    ///
    /// Only a first delivery is forwarded to the offset committer. A
    /// redelivered message has no live session to commit against; acking it
    /// only settles the retry row it was claimed from.
    pub async fn ack(mut self) -> Result<()> {
        if self.redelivery_count > 0 {
            return match self.take_claim() {
                Some(claim) => claim.settle(),
                None => Ok(()),
            };
        }
        let tx = self.signals.ack.clone();
        tx.send(self).await.map_err(|_| PipelineError::ChannelClosed("ack"))
    }

    /// Report a failure that may succeed later. The retrier takes over.
    pub async fn nack(mut self) -> Result<()> {
        self.redelivery_count += 1;
        let tx = self.signals.nack.clone();
        tx.send(self).await.map_err(|_| PipelineError::ChannelClosed("nack"))
    }

    /// Send the message straight to the dead-letter table.
    pub async fn quarantine(self) -> Result<()> {
        let tx = self.signals.quarantine.clone();
        tx.send(self)
            .await
            .map_err(|_| PipelineError::ChannelClosed("quarantine"))
    }
}
