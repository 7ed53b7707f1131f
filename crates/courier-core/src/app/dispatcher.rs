//! CallbackDispatcher - terminal outcome を外部 endpoint に 1 回だけ通知する
//!
//! 失敗（接続拒否・timeout・非 2xx）は log に残して握りつぶす。retry も requeue もしない。
//! task 自体はすでに ack 済みなので、取りこぼした submitter は status poll で補う。

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::telemetry::Telemetry;
use crate::domain::{BusinessId, CallbackRecord, ExecutionOutcome};
use crate::ports::{CallbackError, CallbackSink, Clock};

pub struct CallbackDispatcher {
    sink: Option<Arc<dyn CallbackSink>>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl CallbackDispatcher {
    pub fn new(
        sink: Option<Arc<dyn CallbackSink>>,
        clock: Arc<dyn Clock>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            sink,
            clock,
            telemetry,
        }
    }

    /// Dispatcher that never sends anything.
    pub fn disabled(clock: Arc<dyn Clock>, telemetry: Telemetry) -> Self {
        Self::new(None, clock, telemetry)
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver `outcome` once. Returns whether the sink accepted it; callers may ignore this.
    pub async fn notify(&self, business_id: BusinessId, outcome: &ExecutionOutcome) -> bool {
        let Some(sink) = &self.sink else {
            debug!(%business_id, "no callback endpoint configured, skipping");
            return false;
        };

        let record = CallbackRecord::new(business_id, outcome, self.clock.now());
        match sink.deliver(&record).await {
            Ok(receipt) => {
                self.telemetry.callback_delivered();
                info!(
                    %business_id,
                    status = receipt.status,
                    response = %receipt.body,
                    "callback delivered"
                );
                true
            }
            Err(err) => {
                self.telemetry.callback_failed();
                match &err {
                    CallbackError::Connect(_) => {
                        warn!(%business_id, error = %err, "callback endpoint unreachable")
                    }
                    CallbackError::Timeout(_) => {
                        warn!(%business_id, error = %err, "callback timed out")
                    }
                    CallbackError::Status { .. } | CallbackError::Other(_) => {
                        warn!(%business_id, error = %err, "callback rejected")
                    }
                }
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::ports::DeliveryReceipt;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Keeps every record it is given.
    #[derive(Default)]
    pub struct RecordingSink {
        pub records: Mutex<Vec<CallbackRecord>>,
    }

    #[async_trait]
    impl CallbackSink for RecordingSink {
        async fn deliver(&self, record: &CallbackRecord) -> Result<DeliveryReceipt, CallbackError> {
            self.records.lock().await.push(record.clone());
            Ok(DeliveryReceipt {
                status: 200,
                body: "{\"code\":200}".into(),
            })
        }
    }

    /// Always fails with a connect error, counting attempts.
    #[derive(Default)]
    pub struct FailingSink {
        pub attempts: AtomicUsize,
    }

    #[async_trait]
    impl CallbackSink for FailingSink {
        async fn deliver(
            &self,
            _record: &CallbackRecord,
        ) -> Result<DeliveryReceipt, CallbackError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CallbackError::Connect("connection refused".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{FailingSink, RecordingSink};
    use super::*;
    use crate::domain::OutcomeKind;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use ulid::Ulid;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn success_is_forwarded_as_a_record() {
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::new();
        let dispatcher = CallbackDispatcher::new(
            Some(sink.clone() as Arc<dyn CallbackSink>),
            clock(),
            telemetry.clone(),
        );
        let id = BusinessId::from_ulid(Ulid::new());

        assert!(dispatcher.notify(id, &ExecutionOutcome::success(json!({"data": {"x": 1}}))).await);

        let records = sink.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, id);
        assert_eq!(records[0].status, OutcomeKind::Success);
        assert_eq!(records[0].timestamp, "2024-05-01T12:00:00.000Z");
        assert_eq!(telemetry.snapshot().callbacks_delivered, 1);
    }

    #[tokio::test]
    async fn failures_are_swallowed_after_one_attempt() {
        let sink = Arc::new(FailingSink::default());
        let telemetry = Telemetry::new();
        let dispatcher = CallbackDispatcher::new(
            Some(sink.clone() as Arc<dyn CallbackSink>),
            clock(),
            telemetry.clone(),
        );

        let delivered = dispatcher
            .notify(BusinessId::from_ulid(Ulid::new()), &ExecutionOutcome::failure("boom"))
            .await;

        assert!(!delivered);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(telemetry.snapshot().callbacks_failed, 1);
    }

    #[tokio::test]
    async fn disabled_dispatcher_sends_nothing() {
        let telemetry = Telemetry::new();
        let dispatcher = CallbackDispatcher::disabled(clock(), telemetry.clone());

        assert!(!dispatcher.is_enabled());
        let id = BusinessId::from_ulid(Ulid::new());
        assert!(!dispatcher.notify(id, &ExecutionOutcome::success(json!(1))).await);
        assert_eq!(telemetry.snapshot(), crate::app::TelemetrySnapshot::default());
    }
}
