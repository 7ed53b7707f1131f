//! TaskExecutor - 1 件の task を最後まで実行して ExecutionOutcome を返す
//!
//! handler のエラー・payload の decode 失敗・未登録の task_type・panic は
//! すべて `ExecutionOutcome::Failure` に変換する。slot loop には何も伝播しない。

use std::sync::Arc;

use tracing::{debug, warn};

use super::retry::RetryPolicy;
use crate::domain::{ExecutionOutcome, TaskEnvelope, TaskError};
use crate::typed::{TaskContext, TypedRegistry};

pub struct TaskExecutor {
    registry: Arc<TypedRegistry>,
    retry: RetryPolicy,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TypedRegistry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    /// Run `envelope` for broker delivery number `delivery`.
    ///
    /// Transient failures are re-run while the policy allows; the last
    /// attempt's outcome is returned.
    pub async fn execute(&self, envelope: &TaskEnvelope, delivery: u32) -> ExecutionOutcome {
        let mut attempt = 1;
        loop {
            let ctx = TaskContext {
                business_id: envelope.business_id(),
                delivery,
                attempt,
            };
            match self.attempt(ctx, envelope).await {
                Ok(result) => return ExecutionOutcome::success(result),
                Err(err) if err.is_retryable() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.next_delay(attempt);
                    warn!(
                        business_id = %envelope.business_id(),
                        attempt,
                        ?delay,
                        error = %err,
                        "task failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(
                        business_id = %envelope.business_id(),
                        attempt,
                        error = %err,
                        "task failed"
                    );
                    return ExecutionOutcome::failure(err.message());
                }
            }
        }
    }

    async fn attempt(
        &self,
        ctx: TaskContext,
        envelope: &TaskEnvelope,
    ) -> Result<serde_json::Value, TaskError> {
        let Some(handler) = self.registry.get(envelope.task_type().as_str()) else {
            return Err(TaskError::permanent(format!(
                "no handler registered for task type '{}'",
                envelope.task_type()
            )));
        };

        // 別 task で走らせて panic を JoinError として受け取る
        let payload = envelope.payload().clone();
        let join = tokio::spawn(async move { handler.handle_dyn(ctx, payload).await });
        match join.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(TaskError::permanent(format!("task panicked: {}", panic_message(join_err))))
            }
            Err(join_err) => Err(TaskError::permanent(format!("task aborted: {join_err}"))),
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
