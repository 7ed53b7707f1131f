//! CallbackSink port - out-of-band delivery of terminal outcomes.

use async_trait::async_trait;

use crate::domain::CallbackRecord;

/// Why a single delivery attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("cannot connect to callback endpoint: {0}")]
    Connect(String),

    #[error("callback timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("callback endpoint answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("callback failed: {0}")]
    Other(String),
}

/// Acknowledgement from the endpoint (any 2xx).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status: u16,
    pub body: String,
}

/// One attempt, no retries: the dispatcher decides what to do with errors.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(&self, record: &CallbackRecord) -> Result<DeliveryReceipt, CallbackError>;
}
