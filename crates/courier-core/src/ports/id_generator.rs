//! IdGenerator port - ID 生成の抽象化
//!
//! テスト容易性のために trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（48-bit ms timestamp + 80-bit random）

use crate::domain::{BusinessId, MessageId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散環境で調整なしに使える ID を生成
pub trait IdGenerator: Send + Sync {
    fn generate_business_id(&self) -> BusinessId;

    fn generate_message_id(&self) -> MessageId;
}

/// Clock を使って現在時刻ベースの ULID を生成します。
/// FixedClock を渡せば timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_business_id(&self) -> BusinessId {
        BusinessId::from(self.next_ulid())
    }

    fn generate_message_id(&self) -> MessageId {
        MessageId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let ids: HashSet<BusinessId> = (0..1000).map(|_| id_gen.generate_business_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_the_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_business_id();
        let id2 = id_gen.generate_business_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        let timestamp1 = (id1.as_ulid().0 >> 80) as u64;
        let timestamp2 = (id2.as_ulid().0 >> 80) as u64;
        assert_eq!(timestamp1, timestamp2);
        assert_eq!(timestamp1, fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn message_ids_use_their_own_prefix() {
        let id_gen = UlidGenerator::new(SystemClock);
        assert!(id_gen.generate_message_id().to_string().starts_with("msg-"));
        assert!(id_gen.generate_business_id().to_string().starts_with("task-"));
    }
}
