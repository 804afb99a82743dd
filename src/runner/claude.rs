//! Claude Code CLI 后端（`claude -p --output-format stream-json`）

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::subprocess::{conclude, passthrough, spawn_jsonl, ExitSummary, Invocation, StreamTranslator, SubprocessOptions};
use super::{is_resume_value, ResumeSyntax, RunSession, Runner};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::types::{Action, ActionKind, ActionPhase, CompletedEvent, Event, ResumeToken};

const ENGINE: &str = "claude";

/// Claude runner
pub struct ClaudeRunner {
    config: EngineConfig,
    options: SubprocessOptions,
    syntax: ResumeSyntax,
}

impl ClaudeRunner {
    pub fn new(config: EngineConfig, options: SubprocessOptions) -> Self {
        Self {
            config,
            options,
            syntax: ResumeSyntax::flag(ENGINE),
        }
    }

    fn build_args(&self, resume: Option<&ResumeToken>) -> Vec<String> {
        let mut args: Vec<String> = ["-p", "--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(token) = resume {
            args.push("--resume".to_string());
            args.push(token.value.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl Runner for ClaudeRunner {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn format_resume(&self, token: &ResumeToken) -> String {
        self.syntax.format(token)
    }

    fn extract_resume(&self, text: &str) -> Option<ResumeToken> {
        self.syntax.extract(text)
    }

    fn is_available(&self) -> bool {
        which::which(&self.config.path).is_ok()
    }

    async fn spawn(
        &self,
        prompt: &str,
        resume: Option<&ResumeToken>,
        cancel: CancellationToken,
    ) -> Result<RunSession> {
        let invocation = Invocation {
            program: self.config.path.clone(),
            args: self.build_args(resume),
            stdin: Some(prompt.to_string()),
            cwd: None,
        };
        spawn_jsonl(
            ENGINE,
            invocation,
            Box::new(ClaudeTranslator::new(resume.cloned())),
            &self.options,
            cancel,
        )
    }
}

/// Claude stream-json → 标准事件
#[derive(Debug, Default)]
pub struct ClaudeTranslator {
    resume: Option<ResumeToken>,
    started: bool,
    last_text: Option<String>,
    answer: Option<String>,
    error: Option<String>,
    raw_count: u32,
    /// 缺 ID 的 tool_use 计数
    tool_count: u32,
    /// 不可用的 session_id 已告警
    warned_session: bool,
    /// tool_use_id → started 时的动作（tool_result 只带 ID）
    pending: HashMap<String, Action>,
}

impl ClaudeTranslator {
    pub fn new(resume: Option<ResumeToken>) -> Self {
        Self {
            resume,
            ..Default::default()
        }
    }

    fn passthrough(&mut self, record: Value) -> Vec<Event> {
        self.raw_count += 1;
        vec![passthrough(format!("claude-raw-{}", self.raw_count), record)]
    }

    /// 首次看到 session_id 时产出 Started
    fn observe_session(&mut self, record: &Value, title: Option<String>) -> Option<Event> {
        let session_id = record.get("session_id").and_then(Value::as_str)?;
        if !is_resume_value(session_id) {
            if self.warned_session {
                return None;
            }
            self.warned_session = true;
            tracing::warn!("⚠️ claude session_id 无法用于恢复: {:?}", session_id);
            return Some(Event::Warning {
                message: format!("claude reported an unusable session id: {:?}", session_id),
            });
        }
        let token = ResumeToken::new(ENGINE, session_id);
        self.resume = Some(token.clone());
        if self.started {
            return None;
        }
        self.started = true;
        Some(Event::Started {
            engine: ENGINE.to_string(),
            resume: token,
            title,
        })
    }

    fn assistant(&mut self, record: &Value) -> Vec<Event> {
        let mut events = Vec::new();
        let blocks = record
            .pointer("/message/content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let id = match block.get("id").and_then(Value::as_str) {
                        Some(id) if !id.is_empty() => id.to_string(),
                        _ => {
                            self.tool_count += 1;
                            format!("claude-tool-{}", self.tool_count)
                        }
                    };
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let action = tool_action(id.clone(), name, &input);
                    self.pending.insert(id, action.clone());
                    events.push(Event::action(action, ActionPhase::Started, None));
                }
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            self.last_text = Some(text.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        events
    }

    fn user(&mut self, record: &Value) -> Vec<Event> {
        let mut events = Vec::new();
        let blocks = record
            .pointer("/message/content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let id = block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            let action = self
                .pending
                .remove(&id)
                .unwrap_or_else(|| Action::new(id, ActionKind::Tool, "tool result"));
            events.push(Event::action(action, ActionPhase::Completed, Some(!is_error)));
        }
        events
    }

    fn result(&mut self, record: &Value) {
        let subtype = record.get("subtype").and_then(Value::as_str).unwrap_or("success");
        let is_error = record.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let text = record.get("result").and_then(Value::as_str).map(|s| s.to_string());

        if is_error || subtype != "success" {
            self.error = Some(text.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| subtype.to_string()));
        } else {
            self.answer = text;
        }
    }
}

impl StreamTranslator for ClaudeTranslator {
    fn translate(&mut self, record: Value) -> Vec<Event> {
        let kind = record.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        let subtype = record.get("subtype").and_then(Value::as_str).unwrap_or_default().to_string();

        let mut events = Vec::new();
        match (kind.as_str(), subtype.as_str()) {
            ("system", "init") => {
                let title = record.get("model").and_then(Value::as_str).map(|s| s.to_string());
                events.extend(self.observe_session(&record, title));
            }
            ("assistant", _) => {
                events.extend(self.observe_session(&record, None));
                events.extend(self.assistant(&record));
            }
            ("user", _) => {
                events.extend(self.observe_session(&record, None));
                events.extend(self.user(&record));
            }
            ("result", _) => {
                events.extend(self.observe_session(&record, None));
                self.result(&record);
            }
            _ => return self.passthrough(record),
        }
        events
    }

    fn finish(&mut self, exit: &ExitSummary) -> CompletedEvent {
        let answer = self.answer.take().or_else(|| self.last_text.take());
        conclude(ENGINE, exit, self.resume.clone(), answer, self.error.take())
    }
}

/// Claude 工具调用 → 动作
fn tool_action(id: String, name: &str, input: &Value) -> Action {
    let field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    match name {
        "Bash" => Action::new(id, ActionKind::Command, field("command")),
        "Edit" | "MultiEdit" | "Write" | "NotebookEdit" => {
            let path = match field("file_path") {
                p if p.is_empty() => field("notebook_path"),
                p => p,
            };
            let kind = if name == "Write" { "add" } else { "update" };
            Action::new(id, ActionKind::FileChange, path.clone())
                .with_detail(json!({ "changes": [{ "path": path, "kind": kind }] }))
        }
        "WebSearch" => Action::new(id, ActionKind::WebSearch, field("query")),
        "WebFetch" => Action::new(id, ActionKind::WebSearch, field("url")),
        "Read" | "Glob" | "Grep" => {
            let arg = ["file_path", "pattern", "path"]
                .iter()
                .map(|k| field(k))
                .find(|v| !v.is_empty())
                .unwrap_or_default();
            let title = if arg.is_empty() {
                name.to_string()
            } else {
                format!("{} {}", name.to_lowercase(), arg)
            };
            Action::new(id, ActionKind::Tool, title)
        }
        other => Action::new(id, ActionKind::Tool, other),
    }
}
