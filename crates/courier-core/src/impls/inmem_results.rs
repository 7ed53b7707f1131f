//! In-memory result backend with per-entry expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::domain::{BusinessId, TaskStatus};
use crate::ports::{ResultStore, ResultStoreError};

pub struct InMemoryResultStore {
    entries: RwLock<HashMap<BusinessId, (TaskStatus, Instant)>>,
    online: AtomicBool,
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self {
            entries: RwLock::default(),
            online: AtomicBool::new(true),
        }
    }
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `ResultStoreError::Unavailable` until `reconnect`.
    pub fn disconnect(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    /// Entries held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn ensure_online(&self) -> Result<(), ResultStoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResultStoreError::Unavailable("in-memory result store is disconnected".into()))
        }
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(
        &self,
        business_id: BusinessId,
        status: TaskStatus,
        expires_in: Duration,
    ) -> Result<(), ResultStoreError> {
        self.ensure_online()?;
        let expires_at = Instant::now() + expires_in;
        self.entries
            .write()
            .await
            .insert(business_id, (status, expires_at));
        Ok(())
    }

    async fn get(&self, business_id: &BusinessId) -> Result<Option<TaskStatus>, ResultStoreError> {
        self.ensure_online()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(business_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(status, _)| status.clone()))
    }

    async fn purge_expired(&self) -> Result<usize, ResultStoreError> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }
}
