//! Publisher: drains [`PublishRequest`]s into the broker.
//!
//! Each request is tried `1 + retry_max` times against the broker, and the
//! whole retried call runs inside the circuit breaker, so a broker outage
//! trips the breaker after a few requests and later requests fail fast with
//! [`PipelineError::CircuitOpen`]. Every request's result channel is resolved
//! exactly once, including requests still queued at shutdown.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, ProduceRecord, RecordMetadata};
use crate::config::ProducerSettings;
use crate::pipeline::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::utils::error::{BrokerError, PipelineError, Result};

/// A pending publish with its one-shot result slot.
#[derive(Debug)]
pub struct PublishRequest {
    pub topic: String,
    pub key: String,
    pub payload: String,
    result: oneshot::Sender<Result<RecordMetadata>>,
}

impl PublishRequest {
    /// Build a request and the receiver its result will arrive on.
    pub fn new(
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: impl Into<String>,
    ) -> (Self, oneshot::Receiver<Result<RecordMetadata>>) {
        let (result, rx) = oneshot::channel();
        let request = Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
            result,
        };
        (request, rx)
    }

    fn resolve(self, outcome: Result<RecordMetadata>) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.result.send(outcome);
    }
}

/// Application-facing input surface of the pipeline.
#[derive(Clone, Debug)]
pub struct PublisherHandle {
    requests: mpsc::Sender<PublishRequest>,
    breaker: Arc<CircuitBreaker>,
}

impl PublisherHandle {
    /// Publish one record and wait for the broker's answer.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<RecordMetadata> {
        let (request, rx) = PublishRequest::new(topic, key, payload);
        self.requests
            .send(request)
            .await
            .map_err(|_| PipelineError::ChannelClosed("publish"))?;
        rx.await.map_err(|_| PipelineError::ChannelClosed("publish result"))?
    }

    /// Raw request sender, for callers that correlate results themselves.
    pub fn sender(&self) -> mpsc::Sender<PublishRequest> {
        self.requests.clone()
    }

    /// Current state of the publish circuit breaker.
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    settings: ProducerSettings,
    breaker: Arc<CircuitBreaker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, settings: ProducerSettings, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            broker,
            settings,
            breaker,
        }
    }

    /// Create the request channel and the handle feeding it.
    pub fn channel(&self, capacity: usize) -> (PublisherHandle, mpsc::Receiver<PublishRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = PublisherHandle {
            requests: tx,
            breaker: self.breaker.clone(),
        };
        (handle, rx)
    }

    /// Publish one record through the breaker.
    pub async fn publish(&self, record: ProduceRecord) -> Result<RecordMetadata> {
        self.breaker.execute(self.send_with_retries(record)).await
    }

    async fn send_with_retries(&self, record: ProduceRecord) -> Result<RecordMetadata> {
        let attempts = self.settings.retry_max + 1;
        let mut attempt = 1;
        loop {
            let res = self
                .broker
                .produce(record.clone(), self.settings.partitioner, self.settings.required_acks)
                .await;
            match res {
                Ok(meta) => return Ok(meta),
                Err(err @ BrokerError::Unavailable(_)) if attempt < attempts => {
                    warn!(topic = %record.topic, attempt, error = %err, "publish attempt failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.settings.retry_backoff()).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Serve requests until `shutdown` fires or every handle is dropped.
    pub async fn run(self, mut requests: mpsc::Receiver<PublishRequest>, shutdown: CancellationToken) {
        info!(
            acks = self.settings.required_acks.as_i16(),
            partitioner = ?self.settings.partitioner,
            "publisher started"
        );
        loop {
            let request = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = requests.recv() => request,
            };
            let Some(request) = request else {
                break;
            };
            self.handle(request).await;
        }

        // Nobody will serve what is still queued; fail it instead of leaving callers hanging.
        requests.close();
        while let Ok(request) = requests.try_recv() {
            request.resolve(Err(PipelineError::ChannelClosed("publisher")));
        }
        info!("publisher stopped");
    }

    async fn handle(&self, request: PublishRequest) {
        let record = ProduceRecord {
            topic: request.topic.clone(),
            key: request.key.clone(),
            payload: request.payload.clone(),
        };
        let outcome = self.publish(record).await;
        match &outcome {
            Ok(meta) => debug!(topic = %request.topic, partition = meta.partition, offset = meta.offset, "published"),
            Err(err) if err.is_unavailable() => warn!(topic = %request.topic, error = %err, "publish rejected"),
            Err(err) => warn!(topic = %request.topic, error = %err, "publish failed"),
        }
        request.resolve(outcome);
    }
}
