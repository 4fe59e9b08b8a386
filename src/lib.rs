//! # linkbus
//!
//! `linkbus` is an at-least-once message delivery pipeline over a partitioned
//! log broker with consumer groups. Failed messages are retried from a durable
//! store with linear backoff; messages that keep failing are quarantined in a
//! dead-letter table for operators.
//!
//! ## Core Modules
//!
//! - `broker`: The broker interface the pipeline consumes, plus an in-process engine implementing it.
//! - `config`: Loads settings from defaults, `config/default.*` and `LINKBUS_*` environment variables.
//! - `persistence`: The `sled`-backed retry and dead-letter tables.
//! - `pipeline`: Publisher, subscriber, retrier and quarantine sink, wired over the message lifecycle channels.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod pipeline;
pub mod utils;

#[cfg(test)]
mod tests;
