//! The `persistence` module provides the durable store behind the retry and
//! quarantine paths.
//!
//! It uses `sled` as an embedded store. Each "table" is a sled tree, opened
//! idempotently at startup by [`Store`]; rows are JSON documents.
//!
//! - [`RetryStore`]: nacked messages waiting for their retry time. Keys are
//!   ordered by `retry_at`, so due rows can be claimed with one range scan.
//! - [`DeadLetterStore`]: quarantined messages kept for operator inspection.
//!   Nothing in the pipeline reads them back.

pub mod dead_letter;
pub mod retry;
pub mod sled_store;

pub use dead_letter::{DeadLetterRecord, DeadLetterStore};
pub use retry::{RetryRecord, RetryStore};
pub use sled_store::Store;

#[cfg(test)]
mod tests;
