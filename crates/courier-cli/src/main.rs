//! courier CLI - worker pool のデモ・callback receiver・設定チェック

mod demo;
mod receiver;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use courier_core::config::CourierConfig;
use courier_core::domain::{BusinessId, TaskStatus};
use courier_core::typed::Task;
use courier_core::{AppBuilder, SubmissionGateway};

use crate::demo::{ProcessHandler, ProcessTask};

#[derive(Parser)]
#[command(name = "courier", about = "Task-queue worker with late ack and result callbacks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker pool, submit demo tasks and wait for their outcomes
    Run {
        /// TOML config file (COURIER_* variables override it)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of tasks to submit
        #[arg(long, default_value_t = 3)]
        tasks: usize,
        /// Make every n-th task fail (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: usize,
        /// Simulated work per task, in milliseconds
        #[arg(long, default_value_t = 1000)]
        work_ms: u64,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Run an HTTP endpoint that accepts and logs callbacks
    Receive {
        #[arg(long, default_value = "127.0.0.1:8001")]
        bind: SocketAddr,
    },
    /// Load, validate and print the effective configuration
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            tasks,
            fail_every,
            work_ms,
            timeout_secs,
        } => {
            let config = CourierConfig::load(config.as_deref())?;
            // guard が生きている間だけ file への書き出しが続く
            let _guard = init_tracing(&config)?;
            cmd_run(config, tasks, fail_every, work_ms, timeout_secs).await
        }
        Command::Receive { bind } => {
            let _guard = init_tracing(&CourierConfig::default())?;
            receiver::serve(bind).await
        }
        Command::CheckConfig { config } => {
            let config = CourierConfig::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Console output, plus a rolling file under `log_dir` when configured.
/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &CourierConfig) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let (writer, guard) = rolling_writer(dir, config.log_max_files)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing subscriber: {e}"))?;
    Ok(guard)
}

/// Daily-rotated `courier.<date>.log` in `dir`, keeping `max_files`.
fn rolling_writer(
    dir: &Path,
    max_files: usize,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("courier")
        .filename_suffix("log")
        .max_log_files(max_files)
        .build(dir)
        .with_context(|| format!("opening log directory {}", dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

async fn cmd_run(
    config: CourierConfig,
    tasks: usize,
    fail_every: usize,
    work_ms: u64,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let app = AppBuilder::new()
        .with_config(config)
        .register::<ProcessTask, _>(ProcessHandler::new(Duration::from_millis(work_ms)))?
        .expect_tasks(&[ProcessTask::TYPE])
        .build()?;
    info!(task_types = ?app.registry().registered_types(), "app built");

    if app.config().callback_url.is_none() {
        warn!("no callback_url configured; outcomes are only visible via status polling");
    }

    let pool = app.start();
    let gateway = app.gateway();

    let mut submitted = Vec::with_capacity(tasks);
    for i in 1..=tasks {
        let payload = if fail_every > 0 && i % fail_every == 0 {
            json!({"x": i, "fail": format!("task {i} failed on purpose")})
        } else {
            json!({"x": i})
        };
        let business_id = gateway
            .submit_task(&ProcessTask(payload))
            .await
            .with_context(|| format!("submitting task {i}"))?;
        info!(%business_id, "submitted");
        submitted.push(business_id);
    }

    let waited = tokio::select! {
        statuses = wait_all(&gateway, &submitted) => Some(statuses?),
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => None,
        _ = tokio::signal::ctrl_c() => None,
    };

    pool.shutdown_and_join().await;

    match waited {
        Some(statuses) => {
            for (business_id, status) in submitted.iter().zip(statuses) {
                println!("{business_id}\t{}", serde_json::to_string(&status)?);
            }
        }
        None => warn!("stopped before every task finished"),
    }
    println!("{}", serde_json::to_string_pretty(&app.telemetry().snapshot())?);
    Ok(())
}

async fn wait_all(
    gateway: &SubmissionGateway,
    ids: &[BusinessId],
) -> anyhow::Result<Vec<TaskStatus>> {
    let mut statuses = Vec::with_capacity(ids.len());
    for id in ids {
        loop {
            let status = gateway.status(id).await?;
            if status.is_terminal() {
                statuses.push(status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
    Ok(statuses)
}
