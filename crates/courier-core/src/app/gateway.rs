//! SubmissionGateway - 新しい work を受け付けて business id を払い出す
//!
//! enqueue したら即座に返る。実行の完了は待たない。

use std::sync::Arc;

use tracing::info;

use super::telemetry::Telemetry;
use crate::domain::{BusinessId, MessageState, TaskEnvelope, TaskStatus, TaskType};
use crate::error::CourierError;
use crate::ports::{Broker, Clock, IdGenerator, ResultStore};
use crate::typed::{MessageCodec, Task};

#[derive(Clone)]
pub struct SubmissionGateway {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    codec: MessageCodec,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl SubmissionGateway {
    pub fn new(
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultStore>,
        codec: MessageCodec,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            broker,
            results,
            codec,
            ids,
            clock,
            telemetry,
        }
    }

    /// Enqueue `payload` for `task_type` and return its business id.
    ///
    /// The broker's message id stays internal.
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<BusinessId, CourierError> {
        let business_id = self.ids.generate_business_id();
        let envelope = TaskEnvelope::new(
            business_id,
            TaskType::new(task_type),
            payload,
            self.clock.now(),
        );
        let body = self.codec.encode(&envelope)?;
        let message_id = self.broker.enqueue(body).await?;

        self.telemetry.task_submitted();
        info!(%business_id, %message_id, task_type = %envelope.task_type(), "task submitted");
        Ok(business_id)
    }

    /// Typed variant of [`submit`](Self::submit).
    pub async fn submit_task<T: Task>(&self, task: &T) -> Result<BusinessId, CourierError> {
        let payload = serde_json::to_value(task)?;
        self.submit(T::TYPE, payload).await
    }

    /// Terminal outcome if one was stored, else what the broker currently sees.
    pub async fn status(&self, business_id: &BusinessId) -> Result<TaskStatus, CourierError> {
        if let Some(status) = self.results.get(business_id).await? {
            return Ok(status);
        }

        let status = match self.broker.locate(business_id).await? {
            Some(MessageState::Queued) => TaskStatus::Queued,
            Some(MessageState::Leased | MessageState::Orphaned) => TaskStatus::Active,
            Some(MessageState::Discarded) => TaskStatus::Discarded,
            // acked だが結果が期限切れ、もしくは early ack で実行中
            Some(MessageState::Acked) => TaskStatus::Active,
            None => TaskStatus::NotFound,
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContentType, MessageBody, WorkerId};
    use crate::impls::{InMemoryBroker, InMemoryResultStore};
    use crate::ports::{SystemClock, UlidGenerator};
    use crate::typed::task::fixtures::TestTask;
    use serde_json::json;
    use std::time::Duration;

    fn gateway() -> (SubmissionGateway, Arc<InMemoryBroker>, Arc<InMemoryResultStore>) {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_millis(20)));
        let results = Arc::new(InMemoryResultStore::new());
        let gateway = SubmissionGateway::new(
            broker.clone(),
            results.clone(),
            MessageCodec::json(),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
            Telemetry::new(),
        );
        (gateway, broker, results)
    }

    #[tokio::test]
    async fn submit_returns_immediately_with_a_fresh_id() {
        let (gateway, broker, _) = gateway();

        let a = gateway.submit("demo.process", json!({"x": 1})).await.unwrap();
        let b = gateway.submit("demo.process", json!({"x": 1})).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(broker.counts().await.queued, 2);
        assert_eq!(gateway.status(&a).await.unwrap(), TaskStatus::Queued);
    }

    #[tokio::test]
    async fn typed_submit_encodes_the_task() {
        let (gateway, broker, _) = gateway();

        gateway.submit_task(&TestTask { value: 7 }).await.unwrap();

        let leased = broker.lease(WorkerId::new(0), 1, Duration::from_secs(5)).await.unwrap();
        let envelope = MessageCodec::json().decode(&leased[0].body).unwrap();
        assert_eq!(envelope.task_type().as_str(), TestTask::TYPE);
        assert_eq!(envelope.payload(), &json!({"value": 7}));
    }

    #[tokio::test]
    async fn status_prefers_the_stored_outcome() {
        let (gateway, broker, results) = gateway();
        let id = gateway.submit("demo.process", json!({})).await.unwrap();
        broker.lease(WorkerId::new(0), 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(gateway.status(&id).await.unwrap(), TaskStatus::Active);

        let done = TaskStatus::Succeeded { result: json!({"ok": true}) };
        results.put(id, done.clone(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(gateway.status(&id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (gateway, _, _) = gateway();
        let id = BusinessId::from_ulid(ulid::Ulid::new());
        assert_eq!(gateway.status(&id).await.unwrap(), TaskStatus::NotFound);
    }

    #[tokio::test]
    async fn broker_outage_surfaces_as_an_error() {
        let (gateway, broker, _) = gateway();
        broker.disconnect();

        let err = gateway.submit("demo.process", json!({})).await.unwrap_err();
        assert!(matches!(err, CourierError::Broker(e) if e.is_transient()));
    }

    #[tokio::test]
    async fn binary_payloads_never_reach_the_queue() {
        let (_, broker, _) = gateway();
        let body = MessageBody::new(ContentType::parse("application/octet-stream"), vec![1, 2, 3]);

        assert!(broker.enqueue(body).await.is_err());
        assert_eq!(broker.counts().await.queued, 0);
    }
}
