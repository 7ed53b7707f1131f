//! AckCoordinator - 実行結果と worker の生死から ack / nack を決める
//!
//! メッセージごとの状態遷移: `Leased -> {Acked | NackedRequeue | NackedDiscard}`
//!
//! - Success / Failure どちらでも ack（業務上の失敗は「処理済み」扱い）
//! - worker 消失（lease timeout で broker が検知）は `LossPolicy` に従って requeue か discard
//! - 結果は result store に保存してから ack し、最後に callback へ流す
//! - broker が一時的に落ちていたら lease の期限内で backoff しながら ack をやり直す
//! - 既に結果が保存済みの message は worker 消失扱いでも再実行せず、結果も上書きしない

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::dispatcher::CallbackDispatcher;
use super::retry::RetryPolicy;
use super::telemetry::Telemetry;
use crate::config::AckMode;
use crate::domain::{BusinessId, ExecutionOutcome, Lease, TaskStatus};
use crate::ports::{Broker, BrokerError, Clock, ResultStore, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    NackRequeue,
    NackDiscard,
}

/// What to do with a message whose worker disappeared mid-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossPolicy {
    /// Discard on the first loss, regardless of `max_redeliveries`.
    pub reject_on_worker_loss: bool,
    /// Highest delivery number that may still be requeued after a loss.
    pub max_redeliveries: u32,
}

impl Default for LossPolicy {
    fn default() -> Self {
        Self {
            reject_on_worker_loss: true,
            max_redeliveries: 1,
        }
    }
}

impl LossPolicy {
    pub fn decide(&self, lease: &Lease) -> AckDecision {
        if self.reject_on_worker_loss || lease.delivery > self.max_redeliveries {
            AckDecision::NackDiscard
        } else {
            AckDecision::NackRequeue
        }
    }
}

/// Decision for an outcome the executor produced. Business failures are still acked.
pub fn decide(outcome: &ExecutionOutcome) -> AckDecision {
    match outcome {
        ExecutionOutcome::Success { .. } | ExecutionOutcome::Failure { .. } => AckDecision::Ack,
    }
}

pub struct AckCoordinator {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    dispatcher: Arc<CallbackDispatcher>,
    telemetry: Telemetry,
    clock: Arc<dyn Clock>,
    broker_backoff: RetryPolicy,
    ack_mode: AckMode,
    loss_policy: LossPolicy,
    result_expires: Duration,
}

impl AckCoordinator {
    pub fn new(
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultStore>,
        dispatcher: Arc<CallbackDispatcher>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            broker,
            results,
            dispatcher,
            telemetry,
            clock: Arc::new(SystemClock),
            broker_backoff: RetryPolicy::reconnect(
                Duration::from_millis(100),
                Duration::from_secs(10),
            ),
            ack_mode: AckMode::Late,
            loss_policy: LossPolicy::default(),
            result_expires: Duration::from_secs(3600),
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_loss_policy(mut self, loss_policy: LossPolicy) -> Self {
        self.loss_policy = loss_policy;
        self
    }

    pub fn with_result_expires(mut self, result_expires: Duration) -> Self {
        self.result_expires = result_expires;
        self
    }

    /// Clock the broker stamps leases with; bounds ack retries.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_broker_backoff(mut self, broker_backoff: RetryPolicy) -> Self {
        self.broker_backoff = broker_backoff;
        self
    }

    /// Called right after a lease is granted. In early mode the message is acked here.
    pub async fn on_leased(&self, lease: &Lease) {
        if self.ack_mode == AckMode::Early {
            self.apply(lease, AckDecision::Ack).await;
        }
    }

    /// Settle a finished execution: persist, ack (late mode), then notify.
    pub async fn settle(&self, lease: &Lease, business_id: BusinessId, outcome: ExecutionOutcome) {
        if outcome.is_success() {
            self.telemetry.task_succeeded();
        } else {
            self.telemetry.task_failed();
        }

        // status poll が callback より先に結果を返せるよう、先に保存する
        self.store(business_id, TaskStatus::from(outcome.clone())).await;

        if self.ack_mode == AckMode::Late {
            self.apply(lease, decide(&outcome)).await;
        }

        self.dispatcher.notify(business_id, &outcome).await;
    }

    /// Settle a lease the broker reclaimed after its visibility timeout.
    ///
    /// A message whose outcome is already stored finished its work; only its
    /// ack was lost. It is discarded and the stored outcome is kept.
    pub async fn on_worker_lost(
        &self,
        lease: &Lease,
        business_id: Option<BusinessId>,
    ) -> AckDecision {
        if let Some(business_id) = business_id
            && self.has_outcome(&business_id).await
        {
            warn!(
                %business_id,
                message_id = %lease.message_id,
                delivery = lease.delivery,
                "lease expired after the outcome was stored, discarding without rerun"
            );
            self.apply(lease, AckDecision::NackDiscard).await;
            return AckDecision::NackDiscard;
        }

        let decision = self.loss_policy.decide(lease);
        warn!(
            message_id = %lease.message_id,
            worker = %lease.worker_id,
            delivery = lease.delivery,
            ?decision,
            "lease expired, worker presumed lost"
        );
        if self.apply(lease, decision).await
            && decision == AckDecision::NackDiscard
            && let Some(business_id) = business_id
        {
            self.store(business_id, TaskStatus::Discarded).await;
        }
        decision
    }

    /// Drop a message whose body could not be decoded.
    pub async fn reject_undecodable(&self, lease: &Lease, reason: &str) {
        error!(message_id = %lease.message_id, reason, "undecodable message, discarding");
        self.apply(lease, AckDecision::NackDiscard).await;
    }

    /// Apply `decision` to the broker. Returns whether the broker accepted it.
    ///
    /// Transient broker faults are retried with `broker_backoff` while the
    /// lease is still held; after that the reaper settles the message.
    pub async fn apply(&self, lease: &Lease, decision: AckDecision) -> bool {
        let mut attempts = 0u32;
        let result = loop {
            attempts = attempts.saturating_add(1);
            let result = match decision {
                AckDecision::Ack => self.broker.ack(lease).await,
                AckDecision::NackRequeue => self.broker.nack(lease, true).await,
                AckDecision::NackDiscard => self.broker.nack(lease, false).await,
            };
            match result {
                Err(err) if err.is_transient() => {
                    self.telemetry.broker_error();
                    let Some(delay) = self.retry_delay(lease, attempts) else {
                        break Err(err);
                    };
                    warn!(
                        message_id = %lease.message_id,
                        ?decision,
                        error = %err,
                        ?delay,
                        attempt = attempts,
                        "broker unavailable, retrying settle"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        };

        match result {
            Ok(()) => {
                match decision {
                    AckDecision::Ack => self.telemetry.message_acked(),
                    AckDecision::NackRequeue => self.telemetry.message_requeued(),
                    AckDecision::NackDiscard => self.telemetry.message_discarded(),
                }
                debug!(message_id = %lease.message_id, ?decision, "message settled");
                true
            }
            Err(err @ BrokerError::LeaseExpired { .. }) => {
                // 実行が visibility timeout を超えた。再配送側で処理される
                warn!(
                    message_id = %lease.message_id,
                    ?decision,
                    error = %err,
                    "lease no longer held"
                );
                false
            }
            Err(err) => {
                error!(message_id = %lease.message_id, ?decision, error = %err, "settle failed");
                false
            }
        }
    }

    /// Next backoff delay, cut short at the lease deadline. `None` once the lease has run out.
    fn retry_delay(&self, lease: &Lease, attempts: u32) -> Option<Duration> {
        if !self.broker_backoff.allows_retry(attempts) {
            return None;
        }
        let remaining = (lease.expires_at() - self.clock.now()).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        Some(self.broker_backoff.next_delay(attempts).min(remaining))
    }

    async fn has_outcome(&self, business_id: &BusinessId) -> bool {
        match self.results.get(business_id).await {
            Ok(status) => matches!(
                status,
                Some(TaskStatus::Succeeded { .. } | TaskStatus::Failed { .. })
            ),
            Err(err) => {
                warn!(%business_id, error = %err, "result lookup failed");
                false
            }
        }
    }

    async fn store(&self, business_id: BusinessId, status: TaskStatus) {
        if let Err(err) = self.results.put(business_id, status, self.result_expires).await {
            error!(%business_id, error = %err, "failed to store task status");
        }
    }
}
