//! Retrier: owns nacked messages until they are due again.
//!
//! Two tasks share one [`RetryStore`]:
//! - the event loop takes nacked messages. A message already nacked
//!   `max_retries` times goes to the quarantine channel without touching the
//!   store; anything else is persisted with `retry_at = now + initial_delay *
//!   redelivery_count`.
//! - the scan loop wakes every `check_interval`, claims every row with
//!   `retry_at <= now` and pushes it back onto the subscriber's output channel
//!   as a redelivered [`Message`]. The claimed row is kept until that message
//!   is acked, nacked into a new row or quarantined.
//!
//! A store error while persisting drops the message for this cycle after
//! logging it. The retry loop keeps serving other messages.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetrierSettings;
use crate::persistence::{RetryRecord, RetryStore};
use crate::pipeline::channels::Signals;
use crate::pipeline::message::Message;
use crate::utils::error::{PipelineError, Result};

/// Due time of the `count`-th retry of a message first seen at `created_at`.
pub fn retry_at(created_at: DateTime<Utc>, initial_delay: Duration, count: u32) -> DateTime<Utc> {
    let delay = TimeDelta::from_std(initial_delay.saturating_mul(count)).unwrap_or(TimeDelta::MAX);
    created_at
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct Retrier {
    store: RetryStore,
    settings: RetrierSettings,
    nacked: mpsc::Receiver<Message>,
    output: mpsc::Sender<Message>,
    signals: Signals,
}

impl Retrier {
    pub fn new(
        store: RetryStore,
        settings: RetrierSettings,
        nacked: mpsc::Receiver<Message>,
        output: mpsc::Sender<Message>,
        signals: Signals,
    ) -> Self {
        Self {
            store,
            settings,
            nacked,
            output,
            signals,
        }
    }

    /// Run the event loop and the scan loop until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Retrier {
            store,
            settings,
            mut nacked,
            output,
            signals,
        } = self;

        let scan_token = shutdown.child_token();
        let scanner = tokio::spawn(scan_loop(
            store.clone(),
            settings.check_interval(),
            output,
            signals,
            scan_token.clone(),
        ));

        info!(
            max_retries = settings.max_retries,
            check_interval_ms = settings.check_interval_ms,
            initial_delay_ms = settings.initial_delay_ms,
            "retrier started"
        );
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = nacked.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            handle_nack(&store, &settings, message, &shutdown).await;
        }

        scan_token.cancel();
        scanner
            .await
            .map_err(|e| PipelineError::Task(format!("retry scan: {e}")))?;
        info!("retrier stopped");
        Ok(())
    }
}

async fn handle_nack(
    store: &RetryStore,
    settings: &RetrierSettings,
    mut message: Message,
    shutdown: &CancellationToken,
) {
    let count = message.redelivery_count();
    if count >= settings.max_retries {
        info!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            retry_count = count,
            "retries exhausted, quarantining"
        );
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            sent = message.quarantine() => sent,
        };
        if let Err(e) = sent {
            warn!(error = %e, "could not hand message to the quarantine sink");
        }
        return;
    }

    let created_at = Utc::now();
    let record = RetryRecord {
        id: 0,
        key: message.key().to_string(),
        value: message.payload().to_string(),
        topic: message.topic().to_string(),
        partition: message.partition(),
        kafka_offset: message.offset(),
        retry_count: count,
        retry_at: retry_at(created_at, settings.initial_delay(), count),
        created_at,
    };
    match store.insert(record) {
        Ok(stored) => {
            debug!(
                id = stored.id,
                topic = %stored.topic,
                retry_count = stored.retry_count,
                retry_at = %stored.retry_at,
                "retry scheduled"
            );
            // The new row supersedes the one this delivery was claimed from.
            if let Some(claim) = message.take_claim() {
                if let Err(e) = claim.settle() {
                    warn!(error = %e, "failed to settle superseded retry row");
                }
            }
        }
        Err(e) => error!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            error = %e,
            "failed to persist retry, dropping message"
        ),
    }
}

async fn scan_loop(
    store: RetryStore,
    period: Duration,
    output: mpsc::Sender<Message>,
    signals: Signals,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so a fresh start does not
    // scan before anything could be due.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match requeue_due(&store, &output, &signals, Utc::now(), &shutdown).await {
            Ok(0) => {}
            Ok(n) => debug!(requeued = n, "retry scan finished"),
            Err(e) => error!(error = %e, "retry scan failed"),
        }
    }
}

/// Claim every row due at `now` and push it onto `output`.
///
/// Rows that cannot be delivered because the pipeline is stopping are put
/// back, so they are picked up by the next run.
pub(crate) async fn requeue_due(
    store: &RetryStore,
    output: &mpsc::Sender<Message>,
    signals: &Signals,
    now: DateTime<Utc>,
    shutdown: &CancellationToken,
) -> Result<usize> {
    let due = store.claim_due(now)?;
    let mut requeued = 0;
    let mut pending = due.into_iter();

    while let Some(record) = pending.next() {
        let message = Message::redelivered(record.clone(), signals.clone()).claimed_from(store, record.id);
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            sent = output.send(message) => sent.is_ok(),
        };
        if !sent {
            for unsent in std::iter::once(record).chain(pending) {
                if let Err(e) = store.restore(&unsent) {
                    error!(id = unsent.id, error = %e, "failed to restore claimed retry");
                }
            }
            return Ok(requeued);
        }
        requeued += 1;
    }
    Ok(requeued)
}
