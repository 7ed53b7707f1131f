//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型付けしています。
//! - `BusinessId`: submitter に返す業務 ID（`task-` プレフィックス）
//! - `MessageId`: broker が割り当てる内部ハンドル（`msg-` プレフィックス、submitter には見せない）
//!
//! Both serialize as their display form (`task-01H...`), which is also what
//! goes over the wire in callback bodies.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind; supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` is only a compile-time tag: a `BusinessId` can never be passed where a
/// `MessageId` is expected.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

// derive だと T: Clone/Copy を要求してしまうので手で書く
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when parsing an ID from its display form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {prefix}id: {input}")]
pub struct ParseIdError {
    prefix: &'static str,
    input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError {
            prefix: T::prefix(),
            input: s.to_string(),
        };
        let raw = s.strip_prefix(T::prefix()).ok_or_else(err)?;
        let ulid = Ulid::from_string(raw).map_err(|_| err())?;
        Ok(Self::from_ulid(ulid))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Business {}

impl IdMarker for Business {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Caller-visible identifier of one submission.
pub type BusinessId = Id<Business>;

/// Broker-assigned handle of a queued message. Never exposed to submitters.
pub type MessageId = Id<Message>;

/// Identifier of one execution slot in the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_their_prefix() {
        let ulid = Ulid::new();
        let business = BusinessId::from_ulid(ulid);
        let message = MessageId::from_ulid(ulid);

        assert_eq!(business.as_ulid(), message.as_ulid());
        assert!(business.to_string().starts_with("task-"));
        assert!(message.to_string().starts_with("msg-"));
        // let _: MessageId = business; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = BusinessId::from_ulid(Ulid::new());

        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));

        let back: BusinessId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_rejects_the_wrong_prefix() {
        let message = MessageId::from_ulid(Ulid::new());
        let err = message.to_string().parse::<BusinessId>().unwrap_err();
        assert!(err.to_string().contains("task-"));

        assert!("task-not-a-ulid".parse::<BusinessId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<BusinessId>(), size_of::<Ulid>());
        assert_eq!(size_of::<MessageId>(), 16);
    }

    #[test]
    fn worker_id_display() {
        assert_eq!(WorkerId::new(3).to_string(), "worker-3");
    }
}
