//! Broker engine
//!
//! An in-process partitioned log with consumer groups. It backs the binary
//! when no external broker is wired in, and the test suite.
//!
//! Concurrency and usage notes:
//! - All state lives behind one `std::sync::Mutex`; it is only taken inside
//!   the synchronous helpers on `Inner`, never across an `.await`.
//! - Every session is served by a pump task that copies new records from the
//!   partition logs into the session channel. Appends wake pumps through a
//!   `Notify`; a rebalance cancels the pump, which closes the session.
//! - A group's committed offset is the next offset to read. Sessions start
//!   from it, so records that were delivered but never committed are handed
//!   out again after a rebalance.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::broker::message::{Partitioner, ProduceRecord, Record, RecordMetadata, RequiredAcks};
use crate::broker::topic::Topic;
use crate::broker::{Broker, Claim, GroupSession};
use crate::utils::error::BrokerError;

/// Partitions given to topics created on first use.
pub const DEFAULT_PARTITIONS: usize = 3;

const SESSION_BUFFER: usize = 64;
const MAX_FETCH: usize = 256;

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    appended: Notify,
    partitions_per_topic: usize,
    available: AtomicBool,
    round_robin: AtomicUsize,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    generation: u64,
    members: BTreeMap<String, Member>,
    committed: HashMap<Claim, i64>,
}

struct Member {
    topics: Vec<String>,
    session: Option<CancellationToken>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl InMemoryBroker {
    /// Creates a broker whose auto-created topics get `partitions_per_topic` partitions.
    pub fn new(partitions_per_topic: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                partitions_per_topic: partitions_per_topic.max(1),
                available: AtomicBool::new(true),
                round_robin: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate the broker (or the network path to it) going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of records in `topic/partition`.
    pub fn log_len(&self, topic: &str, partition: i32) -> usize {
        let state = self.inner.lock();
        state
            .topics
            .get(topic)
            .map(|t| t.read_from(partition, 0).len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("broker is not reachable".into()))
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another task panicked mid-update; the
        // logs themselves are append-only and stay consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, record: ProduceRecord, partitioner: Partitioner) -> Result<(i32, i64), BrokerError> {
        let mut state = self.lock();
        let topic = state
            .topics
            .entry(record.topic.clone())
            .or_insert_with(|| Topic::new(&record.topic, self.partitions_per_topic));
        let count = topic.partition_count();
        if count == 0 {
            return Err(BrokerError::NoPartitions(record.topic));
        }

        let index = match partitioner {
            Partitioner::Random => rand::thread_rng().gen_range(0..count),
            Partitioner::Hash if !record.key.is_empty() => (seahash::hash(record.key.as_bytes()) % count as u64) as usize,
            Partitioner::RoundRobin | Partitioner::Hash => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        };
        let partition = index as i32;
        let offset = topic
            .append(partition, record.key, record.payload)
            .ok_or_else(|| BrokerError::NoPartitions(record.topic.clone()))?;
        Ok((partition, offset))
    }

    /// Register `member_id` and compute its claims and starting offsets.
    fn join(&self, group: &str, member_id: &str, topics: &[String]) -> (u64, Vec<(Claim, i64)>, CancellationToken) {
        let mut state = self.lock();
        let State { topics: logs, groups } = &mut *state;
        for name in topics {
            logs.entry(name.clone())
                .or_insert_with(|| Topic::new(name, self.partitions_per_topic));
        }

        let group = groups.entry(group.to_string()).or_default();
        let membership_changed = group
            .members
            .get(member_id)
            .map(|m| m.topics != topics)
            .unwrap_or(true);
        if membership_changed {
            group.generation += 1;
            for member in group.members.values_mut() {
                if let Some(token) = member.session.take() {
                    token.cancel();
                }
            }
        }

        let token = CancellationToken::new();
        let previous = group.members.insert(
            member_id.to_string(),
            Member {
                topics: topics.to_vec(),
                session: Some(token.clone()),
            },
        );
        if let Some(token) = previous.and_then(|m| m.session) {
            token.cancel();
        }

        let claims = assignment(logs, group, member_id)
            .into_iter()
            .map(|claim| {
                let from = group.committed.get(&claim).copied().unwrap_or(0);
                (claim, from)
            })
            .collect();
        (group.generation, claims, token)
    }

    fn leave(&self, group: &str, member_id: &str) {
        let mut state = self.lock();
        let Some(group) = state.groups.get_mut(group) else {
            return;
        };
        if group.members.remove(member_id).is_none() {
            return;
        }
        group.generation += 1;
        for member in group.members.values_mut() {
            if let Some(token) = member.session.take() {
                token.cancel();
            }
        }
    }

    fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.topics.contains_key(topic) {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        let group = state.groups.entry(group.to_string()).or_default();
        let next = group
            .committed
            .entry(Claim {
                topic: topic.to_string(),
                partition,
            })
            .or_insert(0);
        *next = (*next).max(offset + 1);
        Ok(())
    }

    fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.lock();
        state.groups.get(group).and_then(|g| {
            g.committed
                .get(&Claim {
                    topic: topic.to_string(),
                    partition,
                })
                .copied()
        })
    }

    /// Copy unread records into a batch, advancing `positions`.
    fn fetch(&self, positions: &mut [(Claim, i64)]) -> Vec<Record> {
        let state = self.lock();
        let mut batch = Vec::new();
        for (claim, position) in positions.iter_mut() {
            let Some(topic) = state.topics.get(&claim.topic) else {
                continue;
            };
            let fresh = topic.read_from(claim.partition, *position);
            let take = fresh.len().min(MAX_FETCH.saturating_sub(batch.len()));
            batch.extend_from_slice(&fresh[..take]);
            *position += take as i64;
        }
        batch
    }
}

/// Partitions of every topic `member_id` subscribes to, spread round-robin
/// over the members subscribed to the same topic (ordered by member id).
fn assignment(logs: &HashMap<String, Topic>, group: &Group, member_id: &str) -> Vec<Claim> {
    let Some(member) = group.members.get(member_id) else {
        return Vec::new();
    };
    let mut claims = Vec::new();
    for name in &member.topics {
        let peers: Vec<&String> = group
            .members
            .iter()
            .filter(|(_, m)| m.topics.contains(name))
            .map(|(id, _)| id)
            .collect();
        let Some(slot) = peers.iter().position(|id| id.as_str() == member_id) else {
            continue;
        };
        let count = logs.get(name).map(Topic::partition_count).unwrap_or(0);
        for partition in (0..count).filter(|p| p % peers.len() == slot) {
            claims.push(Claim {
                topic: name.clone(),
                partition: partition as i32,
            });
        }
    }
    claims
}

/// Feed a session channel until the session is revoked or dropped.
async fn pump(inner: Arc<Inner>, mut positions: Vec<(Claim, i64)>, tx: mpsc::Sender<Record>, revoked: CancellationToken) {
    loop {
        let notified = inner.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = inner.fetch(&mut positions);
        if batch.is_empty() {
            tokio::select! {
                _ = notified => continue,
                _ = revoked.cancelled() => return,
                _ = tx.closed() => return,
            }
        }

        for record in batch {
            tokio::select! {
                res = tx.send(record) => if res.is_err() { return },
                _ = revoked.cancelled() => return,
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn produce(
        &self,
        record: ProduceRecord,
        partitioner: Partitioner,
        acks: RequiredAcks,
    ) -> Result<RecordMetadata, BrokerError> {
        self.check_available()?;
        let (partition, offset) = self.inner.append(record, partitioner)?;
        self.inner.appended.notify_waiters();

        let offset = match acks {
            RequiredAcks::None => -1,
            RequiredAcks::Leader | RequiredAcks::All => offset,
        };
        Ok(RecordMetadata { partition, offset })
    }

    async fn join(&self, group: &str, member_id: &str, topics: &[String]) -> Result<GroupSession, BrokerError> {
        self.check_available()?;
        if topics.is_empty() {
            return Err(BrokerError::InvalidConfig("no topics to subscribe to".into()));
        }

        let (generation, positions, token) = self.inner.join(group, member_id, topics);
        let claims = positions.iter().map(|(claim, _)| claim.clone()).collect();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        tokio::spawn(pump(self.inner.clone(), positions, tx, token));

        tracing::debug!(group, member_id, generation, "consumer group session opened");
        Ok(GroupSession::new(member_id.to_string(), generation, claims, rx))
    }

    async fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        self.check_available()?;
        self.inner.commit(group, topic, partition, offset)
    }

    async fn committed(&self, group: &str, topic: &str, partition: i32) -> Result<Option<i64>, BrokerError> {
        self.check_available()?;
        Ok(self.inner.committed(group, topic, partition))
    }

    async fn leave(&self, group: &str, member_id: &str) {
        self.inner.leave(group, member_id);
        tracing::debug!(group, member_id, "left consumer group");
    }
}
