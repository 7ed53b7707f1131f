//! Reaper - lease timeout した message を回収して coordinator に決着させる
//!
//! worker が task の途中で消えた場合の唯一の回復経路。
//! 同じ tick で、保持期間を過ぎた決着済み message と期限切れの結果も掃除する。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::coordinator::AckCoordinator;
use super::telemetry::Telemetry;
use crate::ports::{Broker, ResultStore};
use crate::typed::MessageCodec;

pub struct Reaper {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    coordinator: Arc<AckCoordinator>,
    codec: MessageCodec,
    telemetry: Telemetry,
    interval: Duration,
    retention: Duration,
}

impl Reaper {
    pub fn new(
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultStore>,
        coordinator: Arc<AckCoordinator>,
        codec: MessageCodec,
        telemetry: Telemetry,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            results,
            coordinator,
            codec,
            telemetry,
            interval,
            retention: Duration::from_secs(3600),
        }
    }

    /// How long acked and discarded messages stay visible to `locate`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// One sweep. Returns how many expired leases were settled.
    pub async fn reap_once(&self) -> usize {
        let expired = match self.broker.reclaim_expired().await {
            Ok(expired) => expired,
            Err(err) => {
                self.telemetry.broker_error();
                warn!(error = %err, "reclaim failed");
                return 0;
            }
        };

        for message in &expired {
            let business_id = self.codec.decode(&message.body).ok().map(|e| e.business_id());
            self.coordinator.on_worker_lost(&message.lease, business_id).await;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "reaped expired leases");
        }
        expired.len()
    }

    /// Drop settled messages past retention and expired results.
    /// Returns how many broker entries and results were removed.
    pub async fn purge_once(&self) -> (usize, usize) {
        let messages = match self.broker.purge_settled(self.retention).await {
            Ok(n) => n,
            Err(err) => {
                self.telemetry.broker_error();
                warn!(error = %err, "purging settled messages failed");
                0
            }
        };
        let results = match self.results.purge_expired().await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "purging expired results failed");
                0
            }
        };
        if messages + results > 0 {
            debug!(messages, results, "purged");
        }
        (messages, results)
    }

    /// Sweep every `interval` until shutdown is signalled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender が drop されたら終了
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            self.reap_once().await;
            self.purge_once().await;
        }
    }
}
