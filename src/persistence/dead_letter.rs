use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::utils::error::StoreError;

/// A permanently quarantined message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub id: u64,
    pub value: String,
    pub topic: String,
    pub partition: i32,
    pub kafka_offset: i64,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

/// The dead-letter table. Rows are keyed by id and never removed by the pipeline.
#[derive(Clone)]
pub struct DeadLetterStore {
    db: Db,
    tree: Tree,
}

impl DeadLetterStore {
    pub(crate) fn new(db: Db, tree: Tree) -> Self {
        Self { db, tree }
    }

    pub fn insert(&self, mut record: DeadLetterRecord) -> Result<DeadLetterRecord, StoreError> {
        record.id = self.db.generate_id()?;
        let value = serde_json::to_vec(&record)?;
        self.tree.insert(record.id.to_be_bytes(), value)?;
        Ok(record)
    }

    pub fn get(&self, id: u64) -> Result<Option<DeadLetterRecord>, StoreError> {
        match self.tree.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All rows in insertion order.
    pub fn list(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        self.tree
            .iter()
            .values()
            .map(|value| -> Result<DeadLetterRecord, StoreError> { Ok(serde_json::from_slice(&value?)?) })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("tree", &String::from_utf8_lossy(&self.tree.name()))
            .finish()
    }
}
