//! Subscriber: consumer-group member and supervisor of the consuming side.
//!
//! [`Subscriber::run`] drives four tasks in one `JoinSet`:
//! - the claim loop, which turns records of the current group session into
//!   [`Message`]s on the output channel and rejoins whenever a rebalance ends
//!   the session,
//! - the ack listener, which commits the offset of every acked message,
//! - the [`Retrier`],
//! - the [`DeadLetterSink`].
//!
//! They share one child cancellation token. The first task to return, with
//! an error or not, cancels the others; the supervisor waits for all of them
//! and reports the first error.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, GroupSession};
use crate::config::ConsumerSettings;
use crate::pipeline::channels::Signals;
use crate::pipeline::dead_letter::DeadLetterSink;
use crate::pipeline::message::Message;
use crate::pipeline::retrier::Retrier;
use crate::utils::error::{BrokerError, PipelineError, Result};

pub struct Subscriber {
    broker: Arc<dyn Broker>,
    settings: ConsumerSettings,
    member_id: String,
    session: Option<GroupSession>,
    signals: Signals,
    output: mpsc::Sender<Message>,
    acks: mpsc::Receiver<Message>,
    retrier: Retrier,
    dead_letter: DeadLetterSink,
}

impl Subscriber {
    pub fn new(
        broker: Arc<dyn Broker>,
        settings: ConsumerSettings,
        signals: Signals,
        output: mpsc::Sender<Message>,
        acks: mpsc::Receiver<Message>,
        retrier: Retrier,
        dead_letter: DeadLetterSink,
    ) -> Self {
        let member_id = format!("{}-{}", settings.group_id, Uuid::new_v4());
        Self {
            broker,
            settings,
            member_id,
            session: None,
            signals,
            output,
            acks,
            retrier,
            dead_letter,
        }
    }

    /// Join the consumer group.
    ///
    /// Failing here is fatal: nothing has started yet, and a broker that
    /// refuses the first join is treated as misconfigured rather than busy.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = self
            .broker
            .join(&self.settings.group_id, &self.member_id, &self.settings.topics)
            .await?;
        info!(
            group = %self.settings.group_id,
            member = %self.member_id,
            generation = session.generation,
            partitions = session.claims.len(),
            "joined consumer group"
        );
        self.session = Some(session);
        Ok(())
    }

    /// Run every consuming component until `shutdown` fires or one of them stops.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.connect().await?;

        let Subscriber {
            broker,
            settings,
            member_id,
            session,
            signals,
            output,
            acks,
            retrier,
            dead_letter,
        } = self;
        let group = settings.group_id.clone();
        let token = shutdown.child_token();

        let mut tasks = JoinSet::new();
        tasks.spawn(claim_loop(
            broker.clone(),
            settings,
            member_id.clone(),
            session,
            signals,
            output,
            token.clone(),
        ));
        tasks.spawn(ack_listener(broker.clone(), group.clone(), acks, token.clone()));
        tasks.spawn(retrier.run(token.clone()));
        tasks.spawn(dead_letter.run(token.clone()));

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            token.cancel();
            let outcome = joined
                .map_err(|e| PipelineError::Task(e.to_string()))
                .and_then(|result| result);
            match outcome {
                Ok(()) => {}
                Err(e) if first_error.is_none() => {
                    error!(error = %e, "subscriber component failed, stopping");
                    first_error = Some(e);
                }
                Err(e) => warn!(error = %e, "subscriber component failed during shutdown"),
            }
        }

        broker.leave(&group, &member_id).await;
        info!(group = %group, member = %member_id, "subscriber stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn report_claim_error(settings: &ConsumerSettings, err: &BrokerError) {
    if settings.return_errors {
        error!(group = %settings.group_id, error = %err, "consumer group claim failed");
    } else {
        debug!(group = %settings.group_id, error = %err, "consumer group claim failed");
    }
}

async fn claim_loop(
    broker: Arc<dyn Broker>,
    settings: ConsumerSettings,
    member_id: String,
    mut session: Option<GroupSession>,
    signals: Signals,
    output: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let mut current = match session.take() {
            Some(current) => current,
            None => {
                let joined = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(()),
                    joined = broker.join(&settings.group_id, &member_id, &settings.topics) => joined,
                };
                match joined {
                    Ok(current) => {
                        info!(
                            member = %member_id,
                            generation = current.generation,
                            partitions = current.claims.len(),
                            "rejoined consumer group"
                        );
                        current
                    }
                    Err(e) => {
                        report_claim_error(&settings, &e);
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(settings.reconnect_backoff()) => continue,
                        }
                    }
                }
            }
        };

        loop {
            let record = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = output.closed() => {
                    info!("output channel closed, claim loop exiting");
                    return Ok(());
                }
                record = current.next() => record,
            };
            let Some(record) = record else {
                debug!(member = %member_id, generation = current.generation, "session ended, rejoining");
                break;
            };

            let message = Message::delivered(record, signals.clone());
            let sent = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                sent = output.send(message) => sent,
            };
            if sent.is_err() {
                info!("output channel closed, claim loop exiting");
                return Ok(());
            }
        }
    }
}

async fn ack_listener(
    broker: Arc<dyn Broker>,
    group: String,
    mut acks: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = acks.recv() => message,
        };
        let Some(message) = message else {
            return Ok(());
        };
        commit(broker.as_ref(), &group, &message).await;
    }

    // Commit what was acked before shutdown, then refuse further acks.
    acks.close();
    while let Ok(message) = acks.try_recv() {
        commit(broker.as_ref(), &group, &message).await;
    }
    Ok(())
}

async fn commit(broker: &dyn Broker, group: &str, message: &Message) {
    match broker
        .commit(group, message.topic(), message.partition(), message.offset())
        .await
    {
        Ok(()) => debug!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "offset committed"
        ),
        Err(e) => error!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            error = %e,
            "offset commit failed"
        ),
    }
}
