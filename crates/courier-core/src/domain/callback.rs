//! CallbackRecord: the JSON body POSTed to the notification endpoint.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{BusinessId, ExecutionOutcome, OutcomeKind};

/// Wire shape:
/// `{"task_id": "...", "status": "success"|"failed", "result": {..}|null, "error": "..."|null, "timestamp": "..."}`
///
/// Built only to be serialized for delivery; never persisted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub task_id: BusinessId,
    pub status: OutcomeKind,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl CallbackRecord {
    pub fn new(business_id: BusinessId, outcome: &ExecutionOutcome, at: DateTime<Utc>) -> Self {
        Self {
            task_id: business_id,
            status: outcome.kind(),
            result: outcome.result().cloned(),
            error: outcome.error().map(str::to_string),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Rebuilds the outcome a record describes.
    pub fn outcome(&self) -> ExecutionOutcome {
        match self.status {
            OutcomeKind::Success => {
                ExecutionOutcome::success(self.result.clone().unwrap_or(serde_json::Value::Null))
            }
            OutcomeKind::Failed => {
                ExecutionOutcome::failure(self.error.clone().unwrap_or_default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    #[test]
    fn success_record_has_null_error() {
        let id = BusinessId::from_ulid(Ulid::new());
        let outcome = ExecutionOutcome::success(json!({"data": {"x": 1}}));
        let record = CallbackRecord::new(id, &outcome, at());

        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["task_id"], json!(id.to_string()));
        assert_eq!(v["status"], "success");
        assert_eq!(v["result"]["data"]["x"], 1);
        assert!(v["error"].is_null());
        assert_eq!(v["timestamp"], "2024-05-01T08:30:00.000Z");
    }

    #[test]
    fn failed_record_has_null_result() {
        let id = BusinessId::from_ulid(Ulid::new());
        let record = CallbackRecord::new(id, &ExecutionOutcome::failure("boom"), at());

        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error"], "boom");
        assert!(v["result"].is_null());
    }

    #[test]
    fn parsed_record_describes_the_same_outcome() {
        let id = BusinessId::from_ulid(Ulid::new());
        let outcome = ExecutionOutcome::failure("boom");
        let text = serde_json::to_string(&CallbackRecord::new(id, &outcome, at())).unwrap();

        let parsed: CallbackRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.task_id, id);
        assert_eq!(parsed.outcome(), outcome);
    }
}
