//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! - handler の登録と起動時検証（Fail-fast）
//! - config から broker / result store / callback sink を組み立てる
//! - 明示的に渡されたものは config より優先

use std::sync::Arc;

use crate::config::{ConfigError, CourierConfig};
use crate::impls::{HttpCallbackSink, InMemoryBroker, InMemoryResultStore};
use crate::ports::{
    Broker, CallbackSink, Clock, IdGenerator, ResultStore, SystemClock, UlidGenerator,
};
use crate::typed::{Handler, MessageCodec, RegistryError, Task, TypedRegistry};

use super::coordinator::{AckCoordinator, LossPolicy};
use super::dispatcher::CallbackDispatcher;
use super::executor::TaskExecutor;
use super::gateway::SubmissionGateway;
use super::reaper::Reaper;
use super::telemetry::Telemetry;
use super::worker_pool::{PoolContext, PoolSettings, WorkerPool};

const MEMORY_SCHEME: &str = "memory://";

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .with_config(config)
///     .register::<Resize, _>(ResizeHandler)?
///     .expect_tasks(&["media.resize.v1"])
///     .build()?;
///
/// let pool = app.start();
/// let id = app.gateway().submit_task(&Resize { url }).await?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に config を検証する
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
    config: CourierConfig,
    broker: Option<Arc<dyn Broker>>,
    results: Option<Arc<dyn ResultStore>>,
    callback_sink: Option<Arc<dyn CallbackSink>>,
    clock: Option<Arc<dyn Clock>>,
    telemetry: Telemetry,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("{key} '{url}' is not supported; only memory:// is built in")]
    UnsupportedBackend { key: &'static str, url: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppBuilder {
    /// 新しい AppBuilder を作成
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_tasks: None,
            config: CourierConfig::default(),
            broker: None,
            results: None,
            callback_sink: None,
            clock: None,
            telemetry: Telemetry::new(),
        }
    }

    pub fn with_config(mut self, config: CourierConfig) -> Self {
        self.config = config;
        self
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_result_store(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    /// Overrides the sink `callback_url` would produce.
    pub fn with_callback_sink(mut self, sink: Arc<dyn CallbackSink>) -> Self {
        self.callback_sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - config の値
    /// - expect_tasks() で設定された task_type が全て登録されているか
    /// - 注入されていない backend の URL が組み込み実装で扱えるか
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let codec = MessageCodec::with_accept(self.config.accept_content());
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None => {
                ensure_memory("broker_url", &self.config.broker_url)?;
                Arc::new(
                    InMemoryBroker::new(self.config.poll_interval())
                        .with_codec(codec.clone())
                        .with_clock(Arc::clone(&clock)),
                )
            }
        };
        let results: Arc<dyn ResultStore> = match self.results {
            Some(results) => results,
            None => {
                ensure_memory("result_backend_url", &self.config.result_backend_url)?;
                Arc::new(InMemoryResultStore::new())
            }
        };
        let callback_sink = match self.callback_sink {
            Some(sink) => Some(sink),
            None => self.config.parsed_callback_url()?.map(|url| {
                let sink = HttpCallbackSink::new(url, self.config.callback_timeout());
                Arc::new(sink) as Arc<dyn CallbackSink>
            }),
        };

        Ok(App {
            registry: Arc::new(self.registry),
            config: self.config,
            codec,
            broker,
            results,
            callback_sink,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            telemetry: self.telemetry,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_memory(key: &'static str, url: &str) -> Result<(), BuildError> {
    if url.starts_with(MEMORY_SCHEME) {
        Ok(())
    } else {
        Err(BuildError::UnsupportedBackend {
            key,
            url: url.to_string(),
        })
    }
}

/// App はアプリケーションのランタイム
///
/// gateway（投入側）と worker pool（消費側）が同じ broker / result store を共有する。
pub struct App {
    registry: Arc<TypedRegistry>,
    config: CourierConfig,
    codec: MessageCodec,
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    callback_sink: Option<Arc<dyn CallbackSink>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl App {
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypedRegistry {
        &self.registry
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn gateway(&self) -> SubmissionGateway {
        SubmissionGateway::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.results),
            self.codec.clone(),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
            self.telemetry.clone(),
        )
    }

    fn coordinator(&self) -> Arc<AckCoordinator> {
        let dispatcher = CallbackDispatcher::new(
            self.callback_sink.clone(),
            Arc::clone(&self.clock),
            self.telemetry.clone(),
        );
        Arc::new(
            AckCoordinator::new(
                Arc::clone(&self.broker),
                Arc::clone(&self.results),
                Arc::new(dispatcher),
                self.telemetry.clone(),
            )
            .with_clock(Arc::clone(&self.clock))
            .with_broker_backoff(self.config.broker_backoff())
            .with_ack_mode(self.config.ack_mode)
            .with_loss_policy(LossPolicy {
                reject_on_worker_loss: self.config.reject_on_worker_loss,
                max_redeliveries: self.config.max_redeliveries,
            })
            .with_result_expires(self.config.result_expires()),
        )
    }

    /// Spawn the worker pool (and its reaper). Requires a tokio runtime.
    pub fn start(&self) -> WorkerPool {
        let coordinator = self.coordinator();
        let reaper = Reaper::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.results),
            Arc::clone(&coordinator),
            self.codec.clone(),
            self.telemetry.clone(),
            self.config.reap_interval(),
        )
        .with_retention(self.config.result_expires());
        let ctx = PoolContext {
            broker: Arc::clone(&self.broker),
            codec: self.codec.clone(),
            executor: Arc::new(TaskExecutor::new(
                Arc::clone(&self.registry),
                self.config.retry_policy(),
            )),
            coordinator,
            telemetry: self.telemetry.clone(),
        };
        WorkerPool::spawn(PoolSettings::from_config(&self.config), ctx, Some(reaper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::fixtures::TestTaskHandler;
    use crate::typed::task::fixtures::{AnotherTestTask, TestTask};

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .expect_tasks(&[TestTask::TYPE])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let app = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .expect_tasks(&[TestTask::TYPE, AnotherTestTask::TYPE])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing))
                if missing == vec![AnotherTestTask::TYPE.to_string()]
        ));
    }

    #[test]
    fn test_build_no_expect_tasks() {
        let app = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_duplicate_registration_is_refused() {
        let err = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .register::<TestTask, _>(TestTaskHandler)
            .err();
        assert!(matches!(err, Some(RegistryError::AlreadyRegistered(t)) if t == TestTask::TYPE));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = CourierConfig {
            prefetch_limit: 0,
            ..CourierConfig::default()
        };
        let app = AppBuilder::new().with_config(config).build();
        assert!(matches!(app, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_unknown_backend_needs_an_injected_implementation() {
        let config = CourierConfig {
            broker_url: "redis://localhost:6379/0".into(),
            ..CourierConfig::default()
        };
        let app = AppBuilder::new().with_config(config.clone()).build();
        assert!(matches!(app, Err(BuildError::UnsupportedBackend { key: "broker_url", .. })));

        let broker = Arc::new(InMemoryBroker::new(config.poll_interval()));
        assert!(AppBuilder::new().with_config(config).with_broker(broker).build().is_ok());
    }

    #[test]
    fn test_callback_url_builds_an_http_sink() {
        let config = CourierConfig {
            callback_url: Some("http://127.0.0.1:8001/receive-task-result".into()),
            ..CourierConfig::default()
        };
        let app = AppBuilder::new().with_config(config).build().unwrap();
        assert!(app.callback_sink.is_some());

        let app = AppBuilder::new().build().unwrap();
        assert!(app.callback_sink.is_none());
    }
}
