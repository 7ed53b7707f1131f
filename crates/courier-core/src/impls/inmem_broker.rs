//! In-memory broker implementation.
//!
//! Single-process stand-in for a durable queue: FIFO ready list, per-message
//! lease deadlines, and a bounded operation journal for inspection.
//! Settled messages are kept for status polls until `purge_settled` drops them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{
    BusinessId, Lease, LeasedMessage, MessageBody, MessageId, MessageState, WorkerId,
};
use crate::ports::{Broker, BrokerError, Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::typed::MessageCodec;

/// Journal entries kept by default; older ones are dropped first.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

/// One entry of the broker journal. `seq` is strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerEvent {
    pub seq: u64,
    pub message_id: MessageId,
    pub kind: BrokerEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEventKind {
    Enqueued,
    Leased { worker_id: WorkerId, delivery: u32 },
    Acked { worker_id: WorkerId },
    Requeued,
    Discarded,
    Reclaimed { worker_id: WorkerId, delivery: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerCounts {
    pub queued: usize,
    pub leased: usize,
    pub orphaned: usize,
    pub acked: usize,
    pub discarded: usize,
}

#[derive(Debug)]
struct Entry {
    body: MessageBody,
    state: MessageState,
    delivery: u32,
    lease: Option<(Lease, Instant)>,
    /// When the message was acked or discarded.
    settled_at: Option<Instant>,
}

impl Entry {
    /// Does `lease` refer to the delivery this entry is currently in?
    fn holds(&self, lease: &Lease) -> bool {
        self.delivery == lease.delivery
            && self
                .lease
                .as_ref()
                .is_some_and(|(current, _)| current.worker_id == lease.worker_id)
    }
}

#[derive(Debug)]
struct InMemoryBrokerState {
    entries: HashMap<MessageId, Entry>,
    ready: VecDeque<MessageId>,
    by_business: HashMap<BusinessId, MessageId>,
    journal: VecDeque<BrokerEvent>,
    journal_capacity: usize,
    next_seq: u64,
}

impl Default for InMemoryBrokerState {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            ready: VecDeque::new(),
            by_business: HashMap::new(),
            journal: VecDeque::new(),
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            next_seq: 0,
        }
    }
}

impl InMemoryBrokerState {
    fn record(&mut self, message_id: MessageId, kind: BrokerEventKind) {
        self.next_seq += 1;
        if self.journal_capacity == 0 {
            return;
        }
        while self.journal.len() >= self.journal_capacity {
            self.journal.pop_front();
        }
        self.journal.push_back(BrokerEvent {
            seq: self.next_seq,
            message_id,
            kind,
        });
    }

    fn settle(&mut self, message_id: MessageId, state: MessageState) {
        if let Some(entry) = self.entries.get_mut(&message_id) {
            entry.state = state;
            entry.lease = None;
            entry.settled_at = Some(Instant::now());
        }
    }

    fn counts(&self) -> BrokerCounts {
        let mut counts = BrokerCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                MessageState::Queued => counts.queued += 1,
                MessageState::Leased => counts.leased += 1,
                MessageState::Orphaned => counts.orphaned += 1,
                MessageState::Acked => counts.acked += 1,
                MessageState::Discarded => counts.discarded += 1,
            }
        }
        counts
    }

    /// Hand out up to `max_batch` ready messages to `worker_id`.
    fn take_ready(
        &mut self,
        worker_id: WorkerId,
        max_batch: usize,
        visibility_timeout: Duration,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<LeasedMessage> {
        let mut batch = Vec::new();
        while batch.len() < max_batch {
            let Some(message_id) = self.ready.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&message_id) else {
                continue;
            };
            if !entry.state.is_leasable() {
                continue;
            }

            entry.delivery += 1;
            entry.state = MessageState::Leased;
            let lease = Lease {
                message_id,
                worker_id,
                delivery: entry.delivery,
                acquired_at: now,
                visibility_timeout,
            };
            entry.lease = Some((lease.clone(), Instant::now() + visibility_timeout));
            let body = entry.body.clone();
            let delivery = entry.delivery;

            self.record(message_id, BrokerEventKind::Leased { worker_id, delivery });
            batch.push(LeasedMessage { lease, body });
        }
        batch
    }
}

/// In-memory broker.
pub struct InMemoryBroker {
    state: Mutex<InMemoryBrokerState>,
    notify: Arc<Notify>,
    online: AtomicBool,
    poll_interval: Duration,
    codec: MessageCodec,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBroker {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(InMemoryBrokerState::default()),
            notify: Arc::new(Notify::new()),
            online: AtomicBool::new(true),
            poll_interval,
            codec: MessageCodec::json(),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_codec(mut self, codec: MessageCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Keep at most `capacity` journal entries. 0 turns the journal off.
    pub fn with_journal_capacity(mut self, capacity: usize) -> Self {
        let state = self.state.get_mut();
        state.journal_capacity = capacity;
        state.journal.truncate(capacity);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    /// Make every call fail with `BrokerError::Unavailable` until `reconnect`.
    pub fn disconnect(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.online.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn counts(&self) -> BrokerCounts {
        self.state.lock().await.counts()
    }

    /// Journal of the most recent state changes, oldest first.
    pub async fn history(&self) -> Vec<BrokerEvent> {
        self.state.lock().await.journal.iter().cloned().collect()
    }

    /// Messages still tracked, settled ones included.
    pub async fn tracked(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Number of messages `worker_id` currently holds a live lease on.
    pub async fn leased_by(&self, worker_id: WorkerId) -> usize {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.state == MessageState::Leased)
            .filter(|e| e.lease.as_ref().is_some_and(|(l, _)| l.worker_id == worker_id))
            .count()
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is disconnected".into()))
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, body: MessageBody) -> Result<MessageId, BrokerError> {
        self.ensure_online()?;
        let envelope = self
            .codec
            .decode(&body)
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;

        let message_id = {
            let mut state = self.state.lock().await;
            if state.by_business.contains_key(&envelope.business_id()) {
                return Err(BrokerError::Rejected(format!(
                    "duplicate business id {}",
                    envelope.business_id()
                )));
            }

            let message_id = self.ids.generate_message_id();
            state.entries.insert(
                message_id,
                Entry {
                    body,
                    state: MessageState::Queued,
                    delivery: 0,
                    lease: None,
                    settled_at: None,
                },
            );
            state.by_business.insert(envelope.business_id(), message_id);
            state.ready.push_back(message_id);
            state.record(message_id, BrokerEventKind::Enqueued);
            message_id
        };

        // Notify outside the lock
        self.notify.notify_one();
        Ok(message_id)
    }

    async fn lease(
        &self,
        worker_id: WorkerId,
        max_batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, BrokerError> {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            self.ensure_online()?;
            {
                let mut state = self.state.lock().await;
                let batch = state.take_ready(
                    worker_id,
                    max_batch.max(1),
                    visibility_timeout,
                    self.clock.now(),
                );
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            // 何もなければ通知か poll interval の経過を待つ
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(deadline) => {},
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(&lease.message_id)
            .ok_or(BrokerError::UnknownMessage(lease.message_id))?;

        if entry.state != MessageState::Leased || !entry.holds(lease) {
            return Err(BrokerError::LeaseExpired {
                message_id: lease.message_id,
                delivery: lease.delivery,
            });
        }
        state.settle(lease.message_id, MessageState::Acked);
        state.record(
            lease.message_id,
            BrokerEventKind::Acked {
                worker_id: lease.worker_id,
            },
        );
        Ok(())
    }

    async fn nack(&self, lease: &Lease, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_online()?;
        {
            let mut state = self.state.lock().await;
            let entry = state
                .entries
                .get_mut(&lease.message_id)
                .ok_or(BrokerError::UnknownMessage(lease.message_id))?;

            let settleable = matches!(entry.state, MessageState::Leased | MessageState::Orphaned);
            if !settleable || !entry.holds(lease) {
                return Err(BrokerError::LeaseExpired {
                    message_id: lease.message_id,
                    delivery: lease.delivery,
                });
            }
            if requeue {
                entry.lease = None;
                entry.state = MessageState::Queued;
                state.ready.push_back(lease.message_id);
                state.record(lease.message_id, BrokerEventKind::Requeued);
            } else {
                state.settle(lease.message_id, MessageState::Discarded);
                state.record(lease.message_id, BrokerEventKind::Discarded);
            }
        }

        if requeue {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<Vec<LeasedMessage>, BrokerError> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let mut expired = Vec::new();
        let mut newly_orphaned = Vec::new();
        for entry in state.entries.values_mut() {
            let Some((lease, deadline)) = &entry.lease else {
                continue;
            };
            match entry.state {
                MessageState::Leased if *deadline <= now => {
                    entry.state = MessageState::Orphaned;
                    newly_orphaned.push(lease.clone());
                }
                // 前回の nack が通らなかったもの
                MessageState::Orphaned => {}
                _ => continue,
            }
            expired.push(LeasedMessage {
                lease: lease.clone(),
                body: entry.body.clone(),
            });
        }
        for lease in &newly_orphaned {
            state.record(
                lease.message_id,
                BrokerEventKind::Reclaimed {
                    worker_id: lease.worker_id,
                    delivery: lease.delivery,
                },
            );
        }
        Ok(expired)
    }

    async fn purge_settled(&self, older_than: Duration) -> Result<usize, BrokerError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|_, entry| {
            !entry
                .settled_at
                .is_some_and(|settled_at| settled_at.elapsed() >= older_than)
        });
        let InMemoryBrokerState {
            entries,
            by_business,
            ..
        } = &mut *state;
        by_business.retain(|_, message_id| entries.contains_key(message_id));
        Ok(before - state.entries.len())
    }

    async fn locate(&self, business_id: &BusinessId) -> Result<Option<MessageState>, BrokerError> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .by_business
            .get(business_id)
            .and_then(|id| state.entries.get(id))
            .map(|entry| entry.state))
    }
}
