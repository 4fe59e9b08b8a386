//! Record definitions for the broker
//!
//! `Record` is what a consumer-group session hands out: one entry of one
//! partition log, identified by `(topic, partition, offset)`.
//! `ProduceRecord` is the producer-side input and `RecordMetadata` reports
//! where it landed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub topic: String,
    /// Empty means "no key".
    pub key: String,
    pub payload: String,
}

/// Placement of a produced record. `offset` is `-1` when the producer did
/// not wait for any acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

/// Partition selection strategy for produced records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Partitioner {
    #[default]
    Random,
    RoundRobin,
    /// Hash of the key; records without a key fall back to round-robin.
    Hash,
}

/// Acknowledgement level the producer waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequiredAcks {
    /// Fire and forget (`0`).
    None,
    /// Wait for the partition leader (`1`).
    #[default]
    Leader,
    /// Wait for every in-sync replica (`-1`).
    All,
}

impl RequiredAcks {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::None => 0,
            Self::Leader => 1,
            Self::All => -1,
        }
    }
}
