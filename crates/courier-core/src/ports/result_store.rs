//! ResultStore port - terminal outcomes keyed by business id.
//!
//! Backs the status-poll fallback when a callback is lost. Entries expire
//! after `result_expires`.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BusinessId, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum ResultStoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record a terminal status. A later `put` for the same id overwrites.
    async fn put(
        &self,
        business_id: BusinessId,
        status: TaskStatus,
        expires_in: Duration,
    ) -> Result<(), ResultStoreError>;

    /// Terminal status, if recorded and not yet expired.
    async fn get(&self, business_id: &BusinessId) -> Result<Option<TaskStatus>, ResultStoreError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, ResultStoreError>;
}
