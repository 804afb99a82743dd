//! vimo-bridge - 聊天 ↔ AI CLI agent 桥接服务
//!
//! 负责：
//! - 本地 Unix Socket 聊天传输
//! - 路由消息到 codex / claude
//! - 进度节流编辑 + 最终结果 + 恢复行

use std::sync::Arc;

use ai_cli_chat_bridge::{Bridge, BridgeConfig, InstanceLock, RunnerRegistry, SocketTransport};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ai_cli_chat_bridge=debug".parse()?))
        .init();

    tracing::info!("🚀 vimo-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env().context("读取配置失败")?;
    let socket_path = config.socket_path();

    // 同一个 socket 只允许一个实例
    let _instance = match InstanceLock::acquire(&config.data_dir, &socket_path.to_string_lossy()) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let registry = RunnerRegistry::from_config(&config).context("注册 runner 失败")?;
    for runner in registry.runners() {
        if !runner.is_available() {
            tracing::warn!("⚠️ 找不到 {} 可执行文件", runner.engine());
        }
    }

    let transport = Arc::new(SocketTransport::bind(&socket_path).await?);
    let bridge = Bridge::new(transport, registry, config);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("收到中断信号，准备退出...");
            }
            shutdown.cancel();
        });
    }

    bridge.run_until(shutdown).await?;

    tracing::info!("👋 vimo-bridge exiting");
    Ok(())
}
