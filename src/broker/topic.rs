use chrono::Utc;

use crate::broker::message::Record;

/// A topic in the in-process broker: a fixed set of append-only partition logs.
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<Vec<Record>>,
}

impl Topic {
    /// Creates a new topic with `partitions` empty logs.
    pub fn new(name: &str, partitions: usize) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Appends a record to `partition` and returns its offset.
    ///
    /// Offsets are the record's index in the partition log, so they start at
    /// zero and increase by one.
    pub fn append(&mut self, partition: i32, key: String, payload: String) -> Option<i64> {
        let log = self.partitions.get_mut(usize::try_from(partition).ok()?)?;
        let offset = log.len() as i64;
        log.push(Record {
            topic: self.name.clone(),
            partition,
            offset,
            key,
            payload,
            timestamp: Utc::now(),
        });
        Some(offset)
    }

    /// Records of `partition` starting at `from`.
    pub fn read_from(&self, partition: i32, from: i64) -> &[Record] {
        let Some(log) = usize::try_from(partition).ok().and_then(|p| self.partitions.get(p)) else {
            return &[];
        };
        let start = usize::try_from(from).unwrap_or(0).min(log.len());
        &log[start..]
    }
}
