//! The broker interface consumed by the pipeline, and an in-process engine
//! implementing it.
//!
//! The pipeline only relies on consumer-group semantics (group id, topic list,
//! partition assignment, per-partition committed offsets), at-least-once
//! delivery and a synchronous produce call. [`InMemoryBroker`] provides all of
//! that inside one process; a networked client plugs in by implementing
//! [`Broker`].

pub mod engine;
pub mod message;
pub mod topic;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::error::BrokerError;

pub use engine::InMemoryBroker;
pub use message::{Partitioner, ProduceRecord, Record, RecordMetadata, RequiredAcks};

/// A partitioned log broker with consumer groups.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Append a record to one partition of `record.topic`.
    async fn produce(
        &self,
        record: ProduceRecord,
        partitioner: Partitioner,
        acks: RequiredAcks,
    ) -> Result<RecordMetadata, BrokerError>;

    /// Join `group` as `member_id` and claim this member's share of the
    /// partitions of `topics`.
    ///
    /// The returned session ends (yields `None`) when the group rebalances;
    /// the member is expected to join again.
    async fn join(&self, group: &str, member_id: &str, topics: &[String]) -> Result<GroupSession, BrokerError>;

    /// Mark `offset` of `topic/partition` as processed for `group`.
    async fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;

    /// Next offset `group` will read from `topic/partition`, if anything was committed.
    async fn committed(&self, group: &str, topic: &str, partition: i32) -> Result<Option<i64>, BrokerError>;

    /// Leave `group`, handing this member's partitions to the others.
    async fn leave(&self, group: &str, member_id: &str);
}

/// A partition a session owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Claim {
    pub topic: String,
    pub partition: i32,
}

/// One consumer-group membership session.
#[derive(Debug)]
pub struct GroupSession {
    pub member_id: String,
    pub generation: u64,
    pub claims: Vec<Claim>,
    records: mpsc::Receiver<Record>,
}

impl GroupSession {
    pub fn new(member_id: String, generation: u64, claims: Vec<Claim>, records: mpsc::Receiver<Record>) -> Self {
        Self {
            member_id,
            generation,
            claims,
            records,
        }
    }

    /// Next record of any claimed partition, in broker order per partition.
    ///
    /// Returns `None` once the session has been revoked.
    pub async fn next(&mut self) -> Option<Record> {
        self.records.recv().await
    }
}
