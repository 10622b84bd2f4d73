//! tenant-sidecar 可执行文件
//!
//! 加载配置，启动 Tenant，并在收到 SIGINT/SIGTERM 时停止。

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tenant_sidecar_agent::{ConfigManager, Tenant};

/// 服务身份 Sidecar
#[derive(Debug, Parser)]
#[command(name = "tenant-sidecar", version, about)]
struct Args {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short = 'f', long = "config", default_value = "/etc/tenant-sidecar/config.yaml")]
    config: String,
}

fn init_tracing(log_level: &str) {
    let default_level = if log_level.is_empty() { "info" } else { log_level };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("无法注册 SIGTERM 处理器")?;
    let mut sigint = signal(SignalKind::interrupt()).context("无法注册 SIGINT 处理器")?;

    tokio::select! {
        _ = sigterm.recv() => info!("收到 SIGTERM，开始停止"),
        _ = sigint.recv() => info!("收到 SIGINT，开始停止"),
    }
    cancel.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 加载配置
    let manager = ConfigManager::new(&args.config)
        .with_context(|| format!("加载配置失败: {}", args.config))?;
    let config_path = manager.config_path().display().to_string();
    let config = manager.into_config();
    init_tracing(&config.log_level);
    info!(config = %config_path, "tenant-sidecar 启动");

    let tenant = Arc::new(Tenant::new(&config).context("初始化 Tenant 失败")?);

    let cancel = CancellationToken::new();
    let signals = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler(signals).await {
            error!(error = %e, "信号处理失败");
        }
    });

    let done = tenant.start(&cancel).context("启动 Tenant 失败")?;
    let errors = done.await.context("Tenant 未返回终止结果")?;

    let mut failed = false;
    for e in &errors {
        if e.is_cancelled() {
            info!("tenant-sidecar 已停止");
        } else if e.is_fatal() {
            error!(error = %e, "tenant-sidecar 异常终止");
            failed = true;
        } else {
            warn!(error = %e, "tenant-sidecar 终止时存在未处理的错误");
            failed = true;
        }
    }

    if failed {
        bail!("tenant-sidecar 异常终止");
    }
    Ok(())
}
