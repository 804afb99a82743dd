//! ai-cli-chat-bridge - 聊天 ↔ AI CLI agent 桥接
//!
//! 把聊天消息转发给 codex / claude 等 coding agent 子进程，
//! 把 agent 的结构化进度节流地编辑回聊天，最后附上可回放的恢复行，
//! 让对话无需数据库即可继续。
//!
//! # 核心功能
//!
//! - **Runner**: 启动 agent 子进程（独立进程组），把 JSONL 流归一化为 [`Event`]
//! - **恢复路由**: 从消息 / 被回复消息中提取恢复令牌，选择 runner
//! - **串行化**: 同一会话 FIFO；同一恢复令牌跨会话互斥
//! - **进度**: 固定节奏合并编辑，终止事件立即渲染
//! - **取消**: `/cancel` 回复进度消息，终止整个进程组
//!
//! # Feature Flags
//!
//! - `socket`: 本地 Unix Socket 聊天传输 + `vimo-bridge` 二进制（默认开启）
//!
//! # 架构
//!
//! Transport → Bridge → Router (+ 锁表) → Runner → 事件队列 → 进度聚合 → Transport

pub mod bridge;
pub mod config;
pub mod error;
pub mod instance;
pub mod locks;
pub mod progress;
pub mod protocol;
pub mod render;
pub mod router;
pub mod runner;
pub mod scheduler;
pub mod types;

#[cfg(all(unix, feature = "socket"))]
pub mod socket;

// Re-exports
pub use bridge::{AcceptGate, Bridge, BridgeOptions, EventHook, RunPhase};
pub use config::{BridgeConfig, EngineConfig};
pub use error::{Error, Result};
pub use instance::InstanceLock;
pub use locks::{ResumeGuard, ResumeLockTable};
pub use progress::{ProgressAggregator, ProgressState};
pub use protocol::{ConversationId, IncomingMessage, MessageId, Push, Request, Response, SendOptions, Transport};
pub use render::{MarkdownPresenter, Presenter, RunResult};
pub use router::{select_runner, RunnerRegistry};
pub use runner::{ClaudeRunner, CodexRunner, MockRunner, RunHandle, RunSession, Runner, ScriptStep};
pub use scheduler::ConversationScheduler;
pub use types::*;

#[cfg(all(unix, feature = "socket"))]
pub use socket::SocketTransport;
