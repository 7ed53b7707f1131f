//! WorkerPool - 固定数の slot が並行に lease -> execute -> settle を繰り返す
//!
//! - slot ごとに `prefetch_limit` 件まで lease し、slot 内では直列に実行する
//! - settle（ack/nack）が終わるまで次の lease はしない
//! - shutdown は新しい lease を止めるだけで、実行中の task は中断しない
//! - broker に繋がらないときは上限付き指数 backoff で lease をやり直す

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

use super::coordinator::AckCoordinator;
use super::executor::TaskExecutor;
use super::reaper::Reaper;
use super::retry::RetryPolicy;
use super::telemetry::Telemetry;
use crate::config::CourierConfig;
use crate::domain::{LeasedMessage, WorkerId};
use crate::ports::Broker;
use crate::typed::MessageCodec;

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub prefetch_limit: usize,
    pub visibility_timeout: Duration,
    /// Backoff between lease attempts while the broker is unavailable.
    pub broker_backoff: RetryPolicy,
}

impl PoolSettings {
    pub fn from_config(config: &CourierConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            prefetch_limit: config.prefetch_limit,
            visibility_timeout: config.visibility_timeout(),
            broker_backoff: config.broker_backoff(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&CourierConfig::default())
    }
}

/// Shared pieces every slot needs.
#[derive(Clone)]
pub struct PoolContext {
    pub broker: Arc<dyn Broker>,
    pub codec: MessageCodec,
    pub executor: Arc<TaskExecutor>,
    pub coordinator: Arc<AckCoordinator>,
    pub telemetry: Telemetry,
}

/// Worker pool handle.
/// - `shutdown_tx` を drop すると全 slot が止まる
/// - `shutdown_and_join()` で全 slot の終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `settings.concurrency` slots, plus the reaper when given.
    pub fn spawn(settings: PoolSettings, ctx: PoolContext, reaper: Option<Reaper>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let size = settings.concurrency.max(1);

        let mut joins = Vec::with_capacity(size + 1);
        for index in 0..size {
            let worker_id = WorkerId::new(index as u32);
            let slot = Slot {
                worker_id,
                ctx: ctx.clone(),
                prefetch_limit: settings.prefetch_limit.max(1),
                visibility_timeout: settings.visibility_timeout,
                backoff: settings.broker_backoff.clone(),
            };
            let span = ctx.telemetry.worker_span(worker_id);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(slot.run(rx).instrument(span)));
        }

        if let Some(reaper) = reaper {
            joins.push(tokio::spawn(reaper.run(shutdown_rx)));
        }

        info!(slots = size, prefetch_limit = settings.prefetch_limit, "worker pool started");
        Self {
            shutdown_tx,
            joins,
            size,
        }
    }

    /// Number of execution slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop taking new leases. In-flight tasks run to completion.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for every slot.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "worker slot ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

struct Slot {
    worker_id: WorkerId,
    ctx: PoolContext,
    prefetch_limit: usize,
    visibility_timeout: Duration,
    backoff: RetryPolicy,
}

impl Slot {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut consecutive_failures = 0u32;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // lease は待つ可能性があるので select で shutdown と競合させる
            let batch = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                batch = self.ctx.broker.lease(
                    self.worker_id,
                    self.prefetch_limit,
                    self.visibility_timeout,
                ) => batch,
            };

            match batch {
                Ok(batch) => {
                    consecutive_failures = 0;
                    // batch 内は直列。全部 settle してから次の lease
                    for message in batch {
                        self.process(message).await;
                    }
                }
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.ctx.telemetry.broker_error();
                    let delay = self.backoff.next_delay(consecutive_failures);
                    warn!(
                        error = %err,
                        ?delay,
                        attempt = consecutive_failures,
                        "lease failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, message: LeasedMessage) {
        let LeasedMessage { lease, body } = message;
        let envelope = match self.ctx.codec.decode(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.ctx
                    .coordinator
                    .reject_undecodable(&lease, &err.to_string())
                    .await;
                return;
            }
        };

        let span = info_span!(
            "task",
            business_id = %envelope.business_id(),
            message_id = %lease.message_id,
            delivery = lease.delivery,
        );
        async {
            self.ctx.coordinator.on_leased(&lease).await;
            info!(task_type = %envelope.task_type(), "task received");

            let outcome = self.ctx.executor.execute(&envelope, lease.delivery).await;
            info!(status = %outcome.kind(), "task finished");

            self.ctx
                .coordinator
                .settle(&lease, envelope.business_id(), outcome)
                .await;
        }
        .instrument(span)
        .await
    }
}
