//! courier-core
//!
//! Distributed task-queue worker system: at-least-once delivery, late
//! acknowledgment, bounded prefetch and an HTTP result callback.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, lease, outcome, callback record, state, errors）
//! - **ports**: 抽象化レイヤー（Broker, ResultStore, CallbackSink, Clock, IdGenerator）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry, MessageCodec）
//! - **impls**: 実装（InMemoryBroker, InMemoryResultStore, HttpCallbackSink）
//! - **app**: アプリケーションロジック（builder, gateway, worker pool, executor, coordinator, dispatcher, reaper）
//! - **config**: 設定（TOML + `COURIER_*` 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{App, AppBuilder, SubmissionGateway, Telemetry, WorkerPool};
pub use config::{AckMode, CourierConfig};
pub use error::CourierError;
