//! Callback receiver: accepts `POST /receive-task-result` and logs each record.
//!
//! Stands in for the external system that wants to hear about finished tasks.

use std::net::SocketAddr;

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::{info, warn};

use courier_core::domain::{CallbackRecord, OutcomeKind};

pub const CALLBACK_PATH: &str = "/receive-task-result";

pub fn router() -> Router {
    Router::new().route(CALLBACK_PATH, post(receive_task_result))
}

async fn receive_task_result(Json(record): Json<CallbackRecord>) -> Json<Value> {
    match record.status {
        OutcomeKind::Success => info!(
            task_id = %record.task_id,
            timestamp = %record.timestamp,
            result = %record.result.clone().unwrap_or(serde_json::Value::Null),
            "task succeeded"
        ),
        OutcomeKind::Failed => warn!(
            task_id = %record.task_id,
            timestamp = %record.timestamp,
            error = record.error.as_deref().unwrap_or_default(),
            "task failed"
        ),
    }
    Json(json!({"code": 200, "message": "received", "task_id": record.task_id}))
}

/// Serve until ctrl-c.
pub async fn serve(bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, path = CALLBACK_PATH, "callback receiver listening");

    axum::serve(listener, router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
