//! State - broker 上のメッセージ状態と、status poll が返すタスク状態

use serde::{Deserialize, Serialize};

use super::ExecutionOutcome;

/// Broker-side state of one message.
///
/// State transitions:
/// - Queued -> Leased -> Acked
/// - Queued -> Leased -> Queued (nack with requeue)
/// - Queued -> Leased -> Discarded (nack without requeue)
/// - Queued -> Leased -> Orphaned (lease expired) -> Queued | Discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Visible, waiting for a worker.
    Queued,

    /// Held by exactly one worker.
    Leased,

    /// Lease expired; invisible until the coordinator requeues or discards it.
    Orphaned,

    /// Processed and removed.
    Acked,

    /// Dropped without further delivery.
    Discarded,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Acked | MessageState::Discarded)
    }

    /// Can a worker lease it right now?
    pub fn is_leasable(self) -> bool {
        matches!(self, MessageState::Queued)
    }
}

/// What a status poll reports for a business id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Active,
    Succeeded { result: serde_json::Value },
    Failed { error: String },
    Discarded,
    NotFound,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded { .. } | TaskStatus::Failed { .. } | TaskStatus::Discarded
        )
    }
}

impl From<ExecutionOutcome> for TaskStatus {
    fn from(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Success { result } => TaskStatus::Succeeded { result },
            ExecutionOutcome::Failure { error } => TaskStatus::Failed { error },
        }
    }
}
