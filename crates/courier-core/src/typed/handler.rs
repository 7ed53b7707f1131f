//! Handler trait - Task を実行する Handler の定義
//!
//! - `Handler<T>`: 型付きの表層
//! - `DynHandler`: object-safe な内部表現（registry に格納する）
//! - `TypedHandler<T, H>`: 型消去のアダプタ

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;

use super::task::Task;
use crate::domain::{BusinessId, TaskError};

/// Per-attempt information handed to a handler alongside its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub business_id: BusinessId,
    /// 1-based broker delivery count (>1 means the message was redelivered).
    pub delivery: u32,
    /// 1-based executor attempt within this delivery.
    pub attempt: u32,
}

/// Handler は Task を実行して `T::Output` を返す
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<Resize> for ResizeHandler {
///     async fn handle(&self, ctx: TaskContext, task: Resize) -> Result<serde_json::Value, TaskError> {
///         Ok(serde_json::json!({"resized": task.url}))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: TaskContext, task: T) -> Result<T::Output, TaskError>;
}

/// Object-safe handler over JSON payloads.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        ctx: TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;

    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        ctx: TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let task: T = serde_json::from_value(payload)?;
        let output = self.handler.handle(ctx, task).await?;
        to_json(&output)
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

fn to_json<O: Serialize>(output: &O) -> Result<serde_json::Value, TaskError> {
    serde_json::to_value(output)
        .map_err(|e| TaskError::permanent(format!("json encode: {e}")).with_source(e))
}

/// Adapts an async closure into a `Handler<T>`.
///
/// ```ignore
/// registry.register::<Resize, _>(handler_fn(|_ctx, task: Resize| async move {
///     Ok(serde_json::json!({"resized": task.url}))
/// }))?;
/// ```
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F>
where
    T: Task,
    F: Fn(TaskContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T::Output, TaskError>> + Send,
{
    async fn handle(&self, ctx: TaskContext, task: T) -> Result<T::Output, TaskError> {
        (self.f)(ctx, task).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{AnotherTestTask, TestTask};

    pub struct TestTaskHandler;

    #[async_trait]
    impl Handler<TestTask> for TestTaskHandler {
        async fn handle(&self, _ctx: TaskContext, task: TestTask) -> Result<i32, TaskError> {
            Ok(task.value * 2)
        }
    }

    pub struct AnotherTestTaskHandler;

    #[async_trait]
    impl Handler<AnotherTestTask> for AnotherTestTaskHandler {
        async fn handle(&self, _ctx: TaskContext, _task: AnotherTestTask) -> Result<(), TaskError> {
            Ok(())
        }
    }
}
