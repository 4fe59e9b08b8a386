use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::utils::error::StoreError;

/// A nacked message waiting for `retry_at`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryRecord {
    /// Assigned by the store on insert.
    pub id: u64,
    pub key: String,
    pub value: String,
    pub topic: String,
    pub partition: i32,
    pub kafka_offset: i64,
    pub retry_count: u32,
    pub retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// The retry table.
///
/// Row keys are `retry_at` (milliseconds, big-endian) followed by the row id,
/// so iteration order is due-time order.
///
/// A claimed row is not deleted. It moves to a companion `<table>.claimed`
/// tree keyed by id and stays there until the redelivered message is settled
/// (acked, nacked into a new row, or quarantined). Rows still claimed when
/// the process stops are handed back by [`RetryStore::recover_claimed`].
#[derive(Clone)]
pub struct RetryStore {
    db: Db,
    tree: Tree,
    claimed: Tree,
}

fn row_key(retry_at: DateTime<Utc>, id: u64) -> [u8; 16] {
    let millis = u64::try_from(retry_at.timestamp_millis()).unwrap_or(0);
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&millis.to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

fn claim_key(key: &[u8]) -> Option<[u8; 8]> {
    key.get(8..16)?.try_into().ok()
}

impl RetryStore {
    pub(crate) fn new(db: Db, tree: Tree, claimed: Tree) -> Self {
        Self { db, tree, claimed }
    }

    /// Persist `record`, assigning it a fresh id.
    pub fn insert(&self, mut record: RetryRecord) -> Result<RetryRecord, StoreError> {
        record.id = self.db.generate_id()?;
        let value = serde_json::to_vec(&record)?;
        self.tree.insert(row_key(record.retry_at, record.id), value)?;
        Ok(record)
    }

    /// Claim every row with `retry_at <= now`, oldest first.
    ///
    /// Each row is copied to the claimed tree before it leaves the pending
    /// tree, and only the call whose removal succeeds returns it, so a row is
    /// returned once even when scans overlap.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        let upper = row_key(now, u64::MAX);
        let rows: Vec<_> = self.tree.range(..=upper).collect::<Result<_, _>>()?;

        let mut claimed = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let record = match serde_json::from_slice::<RetryRecord>(&value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable retry row");
                    self.tree.remove(&key)?;
                    continue;
                }
            };
            let Some(id) = claim_key(&key) else {
                continue;
            };
            self.claimed.insert(id, value)?;
            if self.tree.remove(&key)?.is_some() {
                claimed.push(record);
            }
        }
        Ok(claimed)
    }

    /// Forget a claimed row whose message reached a terminal state.
    pub fn settle(&self, id: u64) -> Result<(), StoreError> {
        self.claimed.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// Put a claimed row back into the pending tree.
    pub fn restore(&self, record: &RetryRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        self.tree.insert(row_key(record.retry_at, record.id), value)?;
        self.claimed.remove(record.id.to_be_bytes())?;
        Ok(())
    }

    /// Return every row left claimed by an earlier run to the pending tree.
    pub fn recover_claimed(&self) -> Result<usize, StoreError> {
        let leftovers: Vec<_> = self.claimed.iter().collect::<Result<_, _>>()?;
        let mut recovered = 0;
        for (key, value) in leftovers {
            match serde_json::from_slice::<RetryRecord>(&value) {
                Ok(record) => {
                    self.restore(&record)?;
                    recovered += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable claimed retry row");
                    self.claimed.remove(&key)?;
                }
            }
        }
        Ok(recovered)
    }

    /// All pending rows in due-time order.
    pub fn list(&self) -> Result<Vec<RetryRecord>, StoreError> {
        self.tree
            .iter()
            .values()
            .map(|value| -> Result<RetryRecord, StoreError> { Ok(serde_json::from_slice(&value?)?) })
            .collect()
    }

    /// Pending rows.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Rows claimed by a scan and not yet settled.
    pub fn claimed_len(&self) -> usize {
        self.claimed.len()
    }
}

impl std::fmt::Debug for RetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryStore")
            .field("tree", &String::from_utf8_lossy(&self.tree.name()))
            .finish()
    }
}
