//! End-to-end behaviour of gateway -> broker -> pool -> coordinator -> callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use courier_core::app::{App, AppBuilder, TelemetrySnapshot};
use courier_core::config::CourierConfig;
use courier_core::domain::{
    BusinessId, CallbackRecord, MessageState, OutcomeKind, TaskEnvelope, TaskError, TaskStatus,
    TaskType, WorkerId,
};
use courier_core::impls::{BrokerEventKind, HttpCallbackSink, InMemoryBroker};
use courier_core::ports::{Broker, CallbackError, CallbackSink, DeliveryReceipt};
use courier_core::typed::{MessageCodec, Task, TaskContext, handler_fn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
struct Process(Value);

impl Task for Process {
    const TYPE: &'static str = "demo.process.v1";
    type Output = Value;
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<CallbackRecord>>,
}

#[async_trait]
impl CallbackSink for RecordingSink {
    async fn deliver(&self, record: &CallbackRecord) -> Result<DeliveryReceipt, CallbackError> {
        self.records.lock().await.push(record.clone());
        Ok(DeliveryReceipt {
            status: 200,
            body: String::new(),
        })
    }
}

fn config(concurrency: usize) -> CourierConfig {
    CourierConfig {
        concurrency,
        poll_interval_ms: 20,
        reap_interval_ms: 20,
        ..CourierConfig::default()
    }
}

/// `{"fail": msg}` fails permanently with `msg`, `{"sleep_ms": n}` sleeps first;
/// anything else succeeds echoing the payload under `data`.
async fn process(ctx: TaskContext, task: Process) -> Result<Value, TaskError> {
    let payload = task.0;
    if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    if let Some(msg) = payload.get("fail").and_then(Value::as_str) {
        return Err(TaskError::permanent(msg));
    }
    Ok(json!({
        "status": "success",
        "business_task_id": ctx.business_id.to_string(),
        "delivery": ctx.delivery,
        "data": payload,
    }))
}

fn app(config: CourierConfig, broker: Arc<InMemoryBroker>, sink: Arc<dyn CallbackSink>) -> App {
    AppBuilder::new()
        .with_config(config)
        .with_broker(broker)
        .with_callback_sink(sink)
        .register::<Process, _>(handler_fn(process))
        .unwrap()
        .expect_tasks(&[Process::TYPE])
        .build()
        .unwrap()
}

fn broker() -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::new(Duration::from_millis(20)))
}

async fn wait_terminal(app: &App, id: &BusinessId) -> TaskStatus {
    let gateway = app.gateway();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = gateway.status(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not reach a terminal state")
}

async fn wait_for<F>(what: &str, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn successful_task_is_reported_with_its_data() {
    let broker = broker();
    let sink = Arc::new(RecordingSink::default());
    let app = app(config(2), broker.clone(), sink.clone());
    let pool = app.start();

    let id = app.gateway().submit(Process::TYPE, json!({"x": 1})).await.unwrap();
    let status = wait_terminal(&app, &id).await;
    wait_for("callback", async || !sink.records.lock().await.is_empty()).await;
    pool.shutdown_and_join().await;

    assert!(matches!(
        status,
        TaskStatus::Succeeded { ref result } if result["data"] == json!({"x": 1})
    ));

    let records = sink.records.lock().await;
    assert_eq!(records.len(), 1);
    let body = serde_json::to_value(&records[0]).unwrap();
    assert_eq!(body["task_id"], json!(id.to_string()));
    assert_eq!(body["status"], "success");
    assert_eq!(body["result"]["data"], json!({"x": 1}));
    assert!(body["error"].is_null());
}

#[tokio::test]
async fn failing_task_is_reported_and_still_acked() {
    let broker = broker();
    let sink = Arc::new(RecordingSink::default());
    let app = app(config(1), broker.clone(), sink.clone());
    let pool = app.start();

    let id = app.gateway().submit(Process::TYPE, json!({"fail": "boom"})).await.unwrap();
    let status = wait_terminal(&app, &id).await;
    wait_for("callback", async || !sink.records.lock().await.is_empty()).await;
    pool.shutdown_and_join().await;

    assert_eq!(status, TaskStatus::Failed { error: "boom".into() });
    assert_eq!(broker.locate(&id).await.unwrap(), Some(MessageState::Acked));

    let records = sink.records.lock().await;
    assert_eq!(records[0].task_id, id);
    assert_eq!(records[0].status, OutcomeKind::Failed);
    assert_eq!(records[0].error.as_deref(), Some("boom"));
    assert_eq!(records[0].result, None);
}

#[tokio::test]
async fn unreachable_callback_does_not_affect_the_task() {
    // 閉じたポートへの callback は接続拒否になる
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = format!("http://{addr}/receive-task-result").parse().unwrap();
    let sink = Arc::new(HttpCallbackSink::new(url, Duration::from_secs(1)));

    let broker = broker();
    let app = app(config(1), broker.clone(), sink);
    let pool = app.start();

    let id = app.gateway().submit(Process::TYPE, json!({"x": 2})).await.unwrap();
    let telemetry = app.telemetry().clone();
    wait_for("callback attempt", async || telemetry.snapshot().callbacks_failed == 1).await;
    // retry しないことを確かめるため少し待つ
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.shutdown_and_join().await;

    let snapshot = app.telemetry().snapshot();
    assert_eq!(snapshot.callbacks_failed, 1);
    assert_eq!(snapshot.callbacks_delivered, 0);
    assert_eq!(broker.locate(&id).await.unwrap(), Some(MessageState::Acked));
    assert!(matches!(app.gateway().status(&id).await.unwrap(), TaskStatus::Succeeded { .. }));
}

#[tokio::test]
async fn single_slot_leases_the_next_task_only_after_acking_the_first() {
    let broker = broker();
    let sink = Arc::new(RecordingSink::default());
    let app = app(config(1), broker.clone(), sink);
    let gateway = app.gateway();

    let first = gateway.submit(Process::TYPE, json!({"sleep_ms": 50})).await.unwrap();
    let second = gateway.submit(Process::TYPE, json!({"sleep_ms": 10})).await.unwrap();
    let pool = app.start();
    wait_terminal(&app, &first).await;
    wait_terminal(&app, &second).await;
    pool.shutdown_and_join().await;

    let history = broker.history().await;
    let seq_of = |pred: &dyn Fn(&BrokerEventKind) -> bool, nth: usize| {
        history
            .iter()
            .filter(|e| pred(&e.kind))
            .nth(nth)
            .map(|e| e.seq)
            .unwrap()
    };
    let first_ack = seq_of(&|k| matches!(k, BrokerEventKind::Acked { .. }), 0);
    let second_lease = seq_of(&|k| matches!(k, BrokerEventKind::Leased { .. }), 1);
    assert!(second_lease > first_ack, "second lease {second_lease} before first ack {first_ack}");
}

#[tokio::test]
async fn concurrent_leasers_never_share_a_message() {
    let broker = broker();
    let envelope = TaskEnvelope::new(
        BusinessId::from_ulid(ulid::Ulid::new()),
        TaskType::new(Process::TYPE),
        json!({}),
        chrono::Utc::now(),
    );
    broker
        .enqueue(MessageCodec::json().encode(&envelope).unwrap())
        .await
        .unwrap();

    let mut joins = Vec::new();
    for i in 0..8 {
        let broker = Arc::clone(&broker);
        joins.push(tokio::spawn(async move {
            broker
                .lease(WorkerId::new(i), 1, Duration::from_secs(30))
                .await
                .unwrap()
                .len()
        }));
    }
    let mut total = 0;
    for join in joins {
        total += join.await.unwrap();
    }

    assert_eq!(total, 1);
    assert_eq!(broker.counts().await.leased, 1);
}

#[tokio::test]
async fn prefetch_of_one_holds_one_message_per_slot() {
    let broker = broker();
    let max_held = Arc::new(AtomicUsize::new(0));
    let app = AppBuilder::new()
        .with_config(config(1))
        .with_broker(broker.clone())
        .register::<Process, _>(handler_fn({
            let broker = Arc::clone(&broker);
            let max_held = Arc::clone(&max_held);
            move |_ctx: TaskContext, _task: Process| {
                let broker = Arc::clone(&broker);
                let max_held = Arc::clone(&max_held);
                async move {
                    let held = broker.leased_by(WorkerId::new(0)).await;
                    max_held.fetch_max(held, Ordering::SeqCst);
                    Ok::<_, TaskError>(json!(held))
                }
            }
        }))
        .unwrap()
        .build()
        .unwrap();

    let gateway = app.gateway();
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(gateway.submit(Process::TYPE, json!({"i": i})).await.unwrap());
    }
    let pool = app.start();
    for id in &ids {
        wait_terminal(&app, id).await;
    }
    pool.shutdown_and_join().await;

    assert_eq!(max_held.load(Ordering::SeqCst), 1);
}

/// Lease a message as a worker that then "dies" (never settles).
async fn lose_a_worker(app: &App, broker: &InMemoryBroker) -> BusinessId {
    let id = app.gateway().submit(Process::TYPE, json!({"x": 3})).await.unwrap();
    let leased = broker
        .lease(WorkerId::new(99), 1, Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    id
}

#[tokio::test]
async fn lost_worker_task_is_discarded_by_default() {
    let broker = broker();
    let sink = Arc::new(RecordingSink::default());
    let app = app(config(1), broker.clone(), sink.clone());
    let id = lose_a_worker(&app, &broker).await;

    let pool = app.start();
    let status = wait_terminal(&app, &id).await;
    pool.shutdown_and_join().await;

    assert_eq!(status, TaskStatus::Discarded);
    assert_eq!(broker.locate(&id).await.unwrap(), Some(MessageState::Discarded));
    assert!(sink.records.lock().await.is_empty());
    assert_eq!(app.telemetry().snapshot().nacked_discard, 1);
}

#[tokio::test]
async fn lost_worker_task_is_redelivered_when_allowed() {
    let broker = broker();
    let sink = Arc::new(RecordingSink::default());
    let config = CourierConfig {
        reject_on_worker_loss: false,
        max_redeliveries: 1,
        ..config(1)
    };
    let app = app(config, broker.clone(), sink.clone());
    let id = lose_a_worker(&app, &broker).await;

    let pool = app.start();
    let status = wait_terminal(&app, &id).await;
    pool.shutdown_and_join().await;

    match status {
        TaskStatus::Succeeded { result } => assert_eq!(result["delivery"], 2),
        other => panic!("expected success, got {other:?}"),
    }
    let snapshot: TelemetrySnapshot = app.telemetry().snapshot();
    assert_eq!(snapshot.nacked_requeue, 1);
    assert_eq!(snapshot.acked, 1);
}

#[tokio::test]
async fn pool_backs_off_while_the_broker_is_down_and_recovers() {
    let broker = broker();
    let sink = Arc::new(RecordingSink::default());
    let app = app(config(1), broker.clone(), sink);

    let id = app.gateway().submit(Process::TYPE, json!({"x": 4})).await.unwrap();
    broker.disconnect();
    let pool = app.start();

    let telemetry = app.telemetry().clone();
    wait_for("broker errors", async || telemetry.snapshot().broker_errors >= 2).await;
    assert_eq!(app.gateway().status(&id).await.ok(), None);

    broker.reconnect();
    let status = wait_terminal(&app, &id).await;
    pool.shutdown_and_join().await;

    assert!(matches!(status, TaskStatus::Succeeded { .. }));
}
