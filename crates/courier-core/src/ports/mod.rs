//! Ports - 抽象化レイヤー
//!
//! 外部システム（broker, result backend, callback endpoint）へのインターフェース。
//! 実装は `impls` にあります。

pub mod broker;
pub mod callback;
pub mod clock;
pub mod id_generator;
pub mod result_store;

pub use self::broker::{Broker, BrokerError};
pub use self::callback::{CallbackError, CallbackSink, DeliveryReceipt};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::result_store::{ResultStore, ResultStoreError};
