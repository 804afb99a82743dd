//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// Agent 进程启动失败（可执行文件缺失 / 无权限）
    #[error("启动 {engine} 失败: {source}")]
    Spawn {
        engine: String,
        #[source]
        source: std::io::Error,
    },

    /// 聊天传输错误（send / edit / delete / poll）
    #[error("传输错误: {0}")]
    Transport(String),

    /// 事件回调失败，run 被立即中止
    #[error("事件回调失败: {0}")]
    Callback(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 未注册的 engine
    #[error("未知 engine: {0}")]
    UnknownEngine(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 构造传输错误
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Error::Transport(message.to_string())
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
