//! Durable store bootstrap backed by `sled`.
//!
//! One database is shared by the retrier and the quarantine sink. Each issues
//! self-contained single-row operations, so the handles need no locking of
//! their own.

use sled::Db;

use crate::persistence::{DeadLetterStore, RetryStore};
use crate::utils::error::StoreError;

#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Store {
    /// Open or create the sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        tracing::debug!(path, "durable store opened");
        Ok(Self { db })
    }

    /// Open (creating it if needed) the retry table called `name` and its
    /// claimed-row companion.
    pub fn retry_table(&self, name: &str) -> Result<RetryStore, StoreError> {
        let tree = self.db.open_tree(name)?;
        let claimed = self.db.open_tree(format!("{name}.claimed"))?;
        Ok(RetryStore::new(self.db.clone(), tree, claimed))
    }

    /// Open (creating it if needed) the dead-letter table called `name`.
    pub fn dead_letter_table(&self, name: &str) -> Result<DeadLetterStore, StoreError> {
        let tree = self.db.open_tree(name)?;
        Ok(DeadLetterStore::new(self.db.clone(), tree))
    }

    /// Flush dirty pages to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("db", &"sled::Db").finish()
    }
}
