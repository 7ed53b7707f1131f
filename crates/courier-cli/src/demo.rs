//! demo task: `process` は payload を受け取って少し待ち、そのまま結果に載せて返す

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use courier_core::domain::TaskError;
use courier_core::typed::{Handler, Task, TaskContext};

/// Arbitrary JSON business data. `{"fail": "..."}` makes the task fail with that message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessTask(pub Value);

impl Task for ProcessTask {
    const TYPE: &'static str = "demo.process.v1";
    type Output = ProcessResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub status: String,
    pub business_task_id: String,
    pub data: Value,
    pub message: String,
    /// Seconds spent in the handler.
    pub process_time: f64,
}

pub struct ProcessHandler {
    work: Duration,
}

impl ProcessHandler {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

#[async_trait]
impl Handler<ProcessTask> for ProcessHandler {
    async fn handle(
        &self,
        ctx: TaskContext,
        task: ProcessTask,
    ) -> Result<ProcessResult, TaskError> {
        let started = Instant::now();
        info!(business_id = %ctx.business_id, delivery = ctx.delivery, "processing");

        // 重い処理の代わり
        tokio::time::sleep(self.work).await;

        if let Some(reason) = task.0.get("fail").and_then(Value::as_str) {
            return Err(TaskError::permanent(reason));
        }

        Ok(ProcessResult {
            status: "success".to_string(),
            business_task_id: ctx.business_id.to_string(),
            data: task.0,
            message: "task processed".to_string(),
            process_time: started.elapsed().as_secs_f64(),
        })
    }
}
