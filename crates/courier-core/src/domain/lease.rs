//! Lease: a time-bounded exclusive claim on one queued message.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, WorkerId};

/// Granted by the broker to exactly one worker at a time.
///
/// `delivery` is the 1-based delivery count of the message: it starts at 1
/// and grows each time the message is handed out again after a requeue. The
/// broker only honours ack/nack for the lease whose `delivery` is current, so
/// a worker that lost its lease cannot settle somebody else's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub message_id: MessageId,
    pub worker_id: WorkerId,
    pub delivery: u32,
    pub acquired_at: DateTime<Utc>,
    pub visibility_timeout: Duration,
}

impl Lease {
    /// Wall-clock time at which the broker stops honouring this lease.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.visibility_timeout)
            .unwrap_or(chrono::Duration::MAX);
        self.acquired_at
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery > 1
    }
}
