//! Impls - ports の実装
//!
//! - **InMemoryBroker**: 開発・テスト用の broker
//! - **InMemoryResultStore**: 開発・テスト用の result backend
//! - **HttpCallbackSink**: reqwest による callback 送信（本番用）

pub mod http_callback;
pub mod inmem_broker;
pub mod inmem_results;

pub use self::http_callback::HttpCallbackSink;
pub use self::inmem_broker::{BrokerCounts, BrokerEvent, BrokerEventKind, InMemoryBroker};
pub use self::inmem_results::InMemoryResultStore;
