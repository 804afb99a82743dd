//! 标准事件模型
//!
//! Runner 把各 engine 的原始 JSONL 流归一化为这里的 [`Event`]，
//! 下游（进度聚合、渲染、编排）只认识这一套词汇。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Engine 标识（codex / claude / mock …）
pub type EngineId = String;

/// 恢复令牌：某个 engine 的会话 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: EngineId,
    pub value: String,
}

impl ResumeToken {
    pub fn new(engine: impl Into<EngineId>, value: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine, self.value)
    }
}

/// 动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Command,
    Tool,
    FileChange,
    WebSearch,
    Note,
    Warning,
    /// 未识别的原始记录，原样透传以保留可见性
    Passthrough,
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(ActionKind::Command),
            "tool" => Ok(ActionKind::Tool),
            "file_change" => Ok(ActionKind::FileChange),
            "web_search" => Ok(ActionKind::WebSearch),
            "note" => Ok(ActionKind::Note),
            "warning" => Ok(ActionKind::Warning),
            "passthrough" => Ok(ActionKind::Passthrough),
            _ => Err(format!("Invalid action kind: {}", s)),
        }
    }
}

/// 动作阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Started,
    Updated,
    Completed,
}

/// 工具 / 命令动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// engine 内唯一的动作 ID（同一 ID 的多个阶段会合并成一行）
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    /// engine 特定的细节（exit_code、changes …）
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// detail 中的 exit_code（命令类动作）
    pub fn exit_code(&self) -> Option<i64> {
        self.detail.get("exit_code").and_then(|v| v.as_i64())
    }
}

/// Run 终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Done => write!(f, "done"),
            RunStatus::Failed => write!(f, "error"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 终止事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedEvent {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletedEvent {
    pub fn done(answer: impl Into<String>, resume: Option<ResumeToken>) -> Self {
        Self {
            status: RunStatus::Done,
            resume,
            answer: Some(answer.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, resume: Option<ResumeToken>) -> Self {
        Self {
            status: RunStatus::Failed,
            resume,
            answer: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(resume: Option<ResumeToken>) -> Self {
        Self {
            status: RunStatus::Cancelled,
            resume,
            answer: None,
            error: Some("cancelled".to_string()),
        }
    }

    pub fn ok(&self) -> bool {
        self.status == RunStatus::Done
    }

    fn has_answer(&self) -> bool {
        self.answer.as_deref().is_some_and(|a| !a.trim().is_empty())
    }

    fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// 保证「answer 或 error 至少一个非空」
    ///
    /// 成功却没有 answer 视为失败；失败 / 取消却没有 error 补一个默认描述。
    pub fn normalized(mut self) -> Self {
        match self.status {
            RunStatus::Done if !self.has_answer() => {
                self.status = RunStatus::Failed;
                if !self.has_error() {
                    self.error = Some("agent finished without an answer".to_string());
                }
            }
            RunStatus::Failed if !self.has_error() && !self.has_answer() => {
                self.error = Some("agent run failed".to_string());
            }
            RunStatus::Cancelled if !self.has_error() => {
                self.error = Some("cancelled".to_string());
            }
            _ => {}
        }
        self
    }
}

/// 标准事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// 会话身份已知（拿到恢复令牌）
    Started {
        engine: EngineId,
        resume: ResumeToken,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// 工具 / 命令通知
    Action {
        action: Action,
        phase: ActionPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<bool>,
    },
    /// 步骤 / 轮次更新
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Warning {
        message: String,
    },
    /// 终止事件，每个 run 恰好一个
    Completed(CompletedEvent),
}

impl Event {
    pub fn action(action: Action, phase: ActionPhase, ok: Option<bool>) -> Self {
        Event::Action { action, phase, ok }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Completed(_))
    }

    /// 事件携带的恢复令牌（Started / Completed）
    pub fn resume(&self) -> Option<&ResumeToken> {
        match self {
            Event::Started { resume, .. } => Some(resume),
            Event::Completed(c) => c.resume.as_ref(),
            _ => None,
        }
    }
}
