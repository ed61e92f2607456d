mod bot;
mod builder;
mod config;
mod engine;
mod error;
mod job;
mod registry;
mod state;
mod supervisor;
mod web;

use anyhow::Context;
use builder::CommandBuilder;
use clap::Parser;
use config::AppConfig;
use engine::Engine;
use registry::Registry;
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Stream Bot - FFmpeg stream orchestration
/// 解析命令行参数，加载配置，启动调度循环和HTTP服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "stream-bot.yaml", env = "STREAM_BOT_CONFIG")]
    config: String,

    /// 监听地址，覆盖配置文件
    #[arg(short, long)]
    listen: Option<String>,
}

/// 初始化日志：控制台 + logs/ 目录下按天滚动的文件
fn init_logging(logs_dir: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(logs_dir, "stream-bot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件，环境变量优先
    let mut config = AppConfig::load(&args.config)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    std::fs::create_dir_all(&config.server.logs_dir)
        .with_context(|| format!("Failed to create logs directory {}", config.server.logs_dir))?;
    let _log_guard = init_logging(&config.server.logs_dir);

    match Engine::probe(&config.server.ffmpeg_binary).await {
        Ok(version) => info!("Using {}", version),
        Err(e) => warn!("FFmpeg is not usable yet, jobs will fail to start: {}", e),
    }
    if !config.bot.token_configured {
        warn!("BOT_TOKEN is not set; chat commands are only accepted on /bot/command");
    }

    // 任务注册表与调度循环
    let registry = Arc::new(Registry::new(config.health.window));
    let (supervisor, scheduler) = supervisor::start(
        registry,
        CommandBuilder::from_config(&config),
        config.supervisor.clone(),
        Some(PathBuf::from(&config.server.logs_dir)),
        Duration::from_millis(config.server.supervisor_interval_ms),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    let state = Arc::new(AppState::new(config.clone(), supervisor.clone()));

    // 把任务结束通知转交给聊天通道
    let mut notifications = state.bot.spawn_notifier();
    let relay = state.clone();
    tokio::spawn(async move {
        while let Some(message) = notifications.recv().await {
            info!("Chat [{}] <- {}", message.chat_id, message.text.replace('\n', " | "));
            relay.push_outbound(message);
        }
    });

    let app = web::router(state.clone());

    // 启动HTTP服务，监听失败直接退出
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, stopping running jobs");
    supervisor.shutdown().await;
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task ended abnormally: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
