//! Broker port - durable FIFO queue with per-message leases.
//!
//! The broker is an external system; this trait is the seam. The crate ships
//! `InMemoryBroker` for development and tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    BusinessId, Lease, LeasedMessage, MessageBody, MessageId, MessageState, WorkerId,
};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Transport fault. Callers back off and retry; never fatal for a worker.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Protocol fault: the body was refused at enqueue time.
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    /// The lease is no longer current (expired, reclaimed or redelivered).
    #[error("lease for {message_id} (delivery {delivery}) is no longer held")]
    LeaseExpired { message_id: MessageId, delivery: u32 },
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Broker は leased delivery を提供するキュー
///
/// # 契約
/// - `lease` はメッセージが来るか poll interval が過ぎるまで待つ（busy-spin しない）
/// - 1 メッセージにつき有効な lease は常に高々 1 つ
/// - ack/nack は現在の lease にだけ効く
#[async_trait]
pub trait Broker: Send + Sync {
    /// Push a message. Non-JSON or malformed bodies are rejected here and
    /// never become leasable.
    async fn enqueue(&self, body: MessageBody) -> Result<MessageId, BrokerError>;

    /// Lease up to `max_batch` messages for `worker_id`.
    ///
    /// Returns an empty batch when the poll interval elapses with nothing to hand out.
    async fn lease(
        &self,
        worker_id: WorkerId,
        max_batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, BrokerError>;

    /// Remove the message permanently.
    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Give the message back (`requeue = true`) or drop it.
    async fn nack(&self, lease: &Lease, requeue: bool) -> Result<(), BrokerError>;

    /// Collect messages whose lease deadline passed, with their (stale) leases.
    /// They stay invisible (orphaned) until settled with `nack`; an orphaned
    /// message is reported again on every call until then.
    async fn reclaim_expired(&self) -> Result<Vec<LeasedMessage>, BrokerError>;

    /// Forget acked and discarded messages settled more than `older_than` ago.
    /// Returns how many were dropped.
    async fn purge_settled(&self, older_than: Duration) -> Result<usize, BrokerError>;

    /// Broker-observed state of the message carrying `business_id`, if any.
    async fn locate(&self, business_id: &BusinessId) -> Result<Option<MessageState>, BrokerError>;
}
