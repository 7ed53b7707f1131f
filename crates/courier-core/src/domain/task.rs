use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{BusinessId, Lease, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The body of one broker message: business id + task type + payload.
///
/// Immutable once enqueued. The broker's `MessageId` is not part of the body;
/// it is attached on lease (see [`LeasedMessage`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    business_id: BusinessId,
    task_type: TaskType,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(
        business_id: BusinessId,
        task_type: TaskType,
        payload: serde_json::Value,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            business_id,
            task_type,
            payload,
            enqueued_at,
        }
    }

    pub fn business_id(&self) -> BusinessId {
        self.business_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

/// Content type of a message body. Only JSON is understood by this crate;
/// anything else is carried as `Other` so the broker can reject it by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Json,
    Other(String),
}

impl ContentType {
    pub const JSON_MIME: &'static str = "application/json";

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "application/json" | "json" => ContentType::Json,
            other => ContentType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Json => Self::JSON_MIME,
            ContentType::Other(s) => s,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw message as handed to the broker: content type + serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    pub content_type: ContentType,
    pub bytes: Vec<u8>,
}

impl MessageBody {
    pub fn new(content_type: ContentType, bytes: Vec<u8>) -> Self {
        Self {
            content_type,
            bytes,
        }
    }
}

/// A message handed out by `Broker::lease`, together with the lease that
/// grants the calling worker exclusive access to it.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub lease: Lease,
    pub body: MessageBody,
}

impl LeasedMessage {
    pub fn message_id(&self) -> MessageId {
        self.lease.message_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("application/json", ContentType::Json)]
    #[case("Application/JSON ", ContentType::Json)]
    #[case("json", ContentType::Json)]
    #[case("application/x-python-pickle", ContentType::Other("application/x-python-pickle".into()))]
    fn content_type_parses_mime_names(#[case] input: &str, #[case] expected: ContentType) {
        assert_eq!(ContentType::parse(input), expected);
    }

    #[test]
    fn task_type_serializes_transparently() {
        let s = serde_json::to_string(&TaskType::new("demo.process")).unwrap();
        assert_eq!(s, "\"demo.process\"");
    }
}
