//! Socket 服务器
//!
//! 接受本地客户端连接，逐行读取 JSONL 请求并回写响应

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handler::Handler;
use super::SocketState;
use crate::protocol::{Request, Response};

/// 接受连接，直到 `shutdown` 触发
pub(crate) async fn serve(listener: UnixListener, state: Arc<SocketState>, shutdown: CancellationToken) {
    let handler = Arc::new(Handler::new(state.clone()));

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, handler, stream).await {
                                tracing::error!("处理连接失败: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("接受连接失败: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Socket 服务停止");
                break;
            }
        }
    }
}

/// 处理单个连接
async fn handle_connection(state: Arc<SocketState>, handler: Arc<Handler>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let broadcaster = &state.broadcaster;

    let (tx, mut rx) = mpsc::channel::<String>(100);
    let conn_id = broadcaster.register(tx);
    tracing::debug!("📥 新连接: conn_id={}", conn_id);

    let write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if writer.write_all(msg.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                let request: Request = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("解析请求失败: {}", e);
                        let response = Response::Error {
                            code: 400,
                            message: format!("Invalid JSON: {}", e),
                        };
                        let resp_json = serde_json::to_string(&response)?;
                        broadcaster.try_send_to(conn_id, format!("{}\n", resp_json));
                        continue;
                    }
                };

                let response = handler.handle(conn_id, request).await;
                let resp_json = serde_json::to_string(&response)?;

                if !broadcaster.send_to(conn_id, format!("{}\n", resp_json)).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("读取失败: {}", e);
                break;
            }
        }
    }

    broadcaster.unregister(conn_id);
    write_handle.abort();
    tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

    Ok(())
}
