//! Telemetry - 明示的に渡すカウンタ
//!
//! プロセス全体のグローバル状態は持たない。呼び出し側が `Telemetry` を作り、
//! gateway / pool / coordinator / dispatcher に同じハンドルを渡す。
//! ログ出力そのものは `tracing` マクロで行い、subscriber はバイナリ側で設定する。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::WorkerId;

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    acked: AtomicU64,
    nacked_requeue: AtomicU64,
    nacked_discard: AtomicU64,
    callbacks_delivered: AtomicU64,
    callbacks_failed: AtomicU64,
    broker_errors: AtomicU64,
}

/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    counters: Arc<Counters>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub acked: u64,
    pub nacked_requeue: u64,
    pub nacked_discard: u64,
    pub callbacks_delivered: u64,
    pub callbacks_failed: u64,
    pub broker_errors: u64,
}

impl TelemetrySnapshot {
    /// Outcomes produced (success + failure).
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_submitted(&self) {
        bump(&self.counters.submitted);
    }

    pub fn task_succeeded(&self) {
        bump(&self.counters.succeeded);
    }

    pub fn task_failed(&self) {
        bump(&self.counters.failed);
    }

    pub fn message_acked(&self) {
        bump(&self.counters.acked);
    }

    pub fn message_requeued(&self) {
        bump(&self.counters.nacked_requeue);
    }

    pub fn message_discarded(&self) {
        bump(&self.counters.nacked_discard);
    }

    pub fn callback_delivered(&self) {
        bump(&self.counters.callbacks_delivered);
    }

    pub fn callback_failed(&self) {
        bump(&self.counters.callbacks_failed);
    }

    pub fn broker_error(&self) {
        bump(&self.counters.broker_errors);
    }

    /// Span wrapping one slot's loop; every event inside carries `worker`.
    pub fn worker_span(&self, worker_id: WorkerId) -> tracing::Span {
        tracing::info_span!("worker", worker = %worker_id)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        TelemetrySnapshot {
            submitted: load(&c.submitted),
            succeeded: load(&c.succeeded),
            failed: load(&c.failed),
            acked: load(&c.acked),
            nacked_requeue: load(&c.nacked_requeue),
            nacked_discard: load(&c.nacked_discard),
            callbacks_delivered: load(&c.callbacks_delivered),
            callbacks_failed: load(&c.callbacks_failed),
            broker_errors: load(&c.broker_errors),
        }
    }
}
