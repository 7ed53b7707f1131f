//! App - アプリケーション層
//!
//! ports を組み合わせて worker system を組み立てます。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 構築とワイヤリング（起動時検証）
//! - **SubmissionGateway**: work の投入と status poll
//! - **WorkerPool**: lease -> execute -> settle を回す slot 群
//! - **TaskExecutor**: 1 件の実行と ExecutionOutcome への変換
//! - **AckCoordinator**: ack / nack の決定
//! - **CallbackDispatcher**: 結果の外部通知（1 回だけ）
//! - **Reaper**: lease 期限切れの回収

pub mod builder;
pub mod coordinator;
pub mod dispatcher;
pub mod executor;
pub mod gateway;
pub mod reaper;
pub mod retry;
pub mod telemetry;
pub mod worker_pool;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::coordinator::{AckCoordinator, AckDecision, LossPolicy, decide};
pub use self::dispatcher::CallbackDispatcher;
pub use self::executor::TaskExecutor;
pub use self::gateway::SubmissionGateway;
pub use self::reaper::Reaper;
pub use self::retry::RetryPolicy;
pub use self::telemetry::{Telemetry, TelemetrySnapshot};
pub use self::worker_pool::{PoolContext, PoolSettings, WorkerPool};
