//! Codex CLI 后端（`codex exec --json`）

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::subprocess::{conclude, passthrough, spawn_jsonl, ExitSummary, Invocation, StreamTranslator, SubprocessOptions};
use super::{is_resume_value, ResumeSyntax, RunSession, Runner};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::types::{Action, ActionKind, ActionPhase, CompletedEvent, Event, ResumeToken};

const ENGINE: &str = "codex";

/// Codex runner
pub struct CodexRunner {
    config: EngineConfig,
    options: SubprocessOptions,
    syntax: ResumeSyntax,
}

impl CodexRunner {
    pub fn new(config: EngineConfig, options: SubprocessOptions) -> Self {
        Self {
            config,
            options,
            syntax: ResumeSyntax::subcommand(ENGINE),
        }
    }

    fn build_args(&self, resume: Option<&ResumeToken>) -> Vec<String> {
        let mut args: Vec<String> = ["exec", "--json", "--skip-git-repo-check", "--color=never"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.config.extra_args.iter().cloned());
        if let Some(token) = resume {
            args.push("resume".to_string());
            args.push(token.value.clone());
        }
        // prompt 从 stdin 读取
        args.push("-".to_string());
        args
    }
}

#[async_trait]
impl Runner for CodexRunner {
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
            Box::new(CodexTranslator::new(resume.cloned())),
            &self.options,
            cancel,
        )
    }
}

/// Codex JSONL → 标准事件
#[derive(Debug, Default)]
pub struct CodexTranslator {
    resume: Option<ResumeToken>,
    answer: Option<String>,
    error: Option<String>,
    turns: u32,
    raw_count: u32,
}

impl CodexTranslator {
    pub fn new(resume: Option<ResumeToken>) -> Self {
        Self {
            resume,
            ..Default::default()
        }
    }

    fn passthrough(&mut self, record: Value) -> Vec<Event> {
        self.raw_count += 1;
        vec![passthrough(format!("codex-raw-{}", self.raw_count), record)]
    }

    fn translate_item(&mut self, phase: ActionPhase, record: Value) -> Vec<Event> {
        let Some(item) = record.get("item").filter(|i| i.is_object()) else {
            return self.passthrough(record);
        };
        let id = match item.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let Some(id) = id else {
            return self.passthrough(record);
        };
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        let status = item.get("status").and_then(Value::as_str);
        let completed = phase == ActionPhase::Completed;
        let failed = status == Some("failed");

        let action = match item_type {
            "agent_message" => {
                if completed {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        self.answer = Some(text.to_string());
                    }
                }
                return Vec::new();
            }
            "reasoning" => {
                let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
                let title = first_line(text);
                if title.is_empty() {
                    return Vec::new();
                }
                Action::new(id, ActionKind::Note, title)
            }
            "command_execution" => {
                let command = item.get("command").and_then(Value::as_str).unwrap_or_default();
                let mut detail = json!({});
                if let Some(code) = item.get("exit_code").and_then(Value::as_i64) {
                    detail["exit_code"] = json!(code);
                }
                Action::new(id, ActionKind::Command, command).with_detail(detail)
            }
            "mcp_tool_call" => {
                let server = item.get("server").and_then(Value::as_str).unwrap_or_default();
                let tool = item.get("tool").and_then(Value::as_str).unwrap_or_default();
                let name: Vec<&str> = [server, tool].into_iter().filter(|s| !s.is_empty()).collect();
                let title = if name.is_empty() {
                    "tool".to_string()
                } else {
                    name.join(".")
                };
                Action::new(id, ActionKind::Tool, title)
            }
            "web_search" => {
                let query = item.get("query").and_then(Value::as_str).unwrap_or_default();
                Action::new(id, ActionKind::WebSearch, query)
            }
            "file_change" => {
                let changes = item.get("changes").cloned().unwrap_or_else(|| json!([]));
                let count = changes.as_array().map(|c| c.len()).unwrap_or(0);
                let title = if count == 1 { "1 file".to_string() } else { format!("{} files", count) };
                Action::new(id, ActionKind::FileChange, title).with_detail(json!({ "changes": changes }))
            }
            "error" => {
                let message = item.get("message").and_then(Value::as_str).unwrap_or("error");
                return vec![Event::Warning {
                    message: message.to_string(),
                }];
            }
            _ => return self.passthrough(record),
        };

        let ok = if completed {
            match action.exit_code() {
                Some(code) => Some(code == 0 && !failed),
                None => Some(!failed),
            }
        } else {
            None
        };

        vec![Event::action(action, phase, ok)]
    }
}

impl StreamTranslator for CodexTranslator {
    fn translate(&mut self, record: Value) -> Vec<Event> {
        let Some(kind) = record.get("type").and_then(Value::as_str).map(|s| s.to_string()) else {
            return self.passthrough(record);
        };

        match kind.as_str() {
            "thread.started" => match record.get("thread_id").and_then(Value::as_str) {
                Some(thread_id) if !is_resume_value(thread_id) => {
                    tracing::warn!("⚠️ codex thread_id 无法用于恢复: {:?}", thread_id);
                    vec![Event::Warning {
                        message: format!("codex reported an unusable thread id: {:?}", thread_id),
                    }]
                }
                Some(thread_id) => {
                    let token = ResumeToken::new(ENGINE, thread_id);
                    self.resume = Some(token.clone());
                    vec![Event::Started {
                        engine: ENGINE.to_string(),
                        resume: token,
                        title: None,
                    }]
                }
                None => self.passthrough(record),
            },
            "turn.started" => {
                self.turns += 1;
                vec![Event::Progress {
                    note: Some(format!("turn {}", self.turns)),
                }]
            }
            "turn.completed" => Vec::new(),
            "turn.failed" => {
                let message = record
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("turn failed")
                    .to_string();
                self.error = Some(message.clone());
                vec![Event::Warning { message }]
            }
            "error" => {
                let message = record
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string();
                vec![Event::Warning { message }]
            }
            "item.started" => self.translate_item(ActionPhase::Started, record),
            "item.updated" => self.translate_item(ActionPhase::Updated, record),
            "item.completed" => self.translate_item(ActionPhase::Completed, record),
            _ => self.passthrough(record),
        }
    }

    fn finish(&mut self, exit: &ExitSummary) -> CompletedEvent {
        conclude(ENGINE, exit, self.resume.clone(), self.answer.take(), self.error.take())
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .trim_matches('*')
        .to_string()
}
