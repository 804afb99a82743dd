//! Runner 模块 - engine 后端
//!
//! 每种 agent CLI 一个 Runner，负责：
//! - 启动子进程（独立进程组）
//! - 解析原始 JSONL 流并归一化为 [`Event`]
//! - 恢复令牌的格式化 / 提取
//! - 取消（终止整个进程组）

mod claude;
mod codex;
pub mod mock;
pub mod subprocess;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{EngineId, Event, ResumeToken};

pub use claude::ClaudeRunner;
pub use codex::CodexRunner;
pub use mock::{MockRunner, ScriptStep, SpawnCall};
pub use subprocess::{ExitSummary, Invocation, StreamTranslator, SubprocessOptions};

/// Engine 后端
#[async_trait]
pub trait Runner: Send + Sync {
    /// engine 标识
    fn engine(&self) -> &str;

    /// 把令牌渲染成一行可回放的文本
    fn format_resume(&self, token: &ResumeToken) -> String;

    /// 从任意文本中提取本 engine 的令牌（多个时取最后一个）
    fn extract_resume(&self, text: &str) -> Option<ResumeToken>;

    /// 是否为本 engine 的恢复行（截断时需保留）
    fn is_resume_line(&self, line: &str) -> bool {
        self.extract_resume(line).is_some()
    }

    /// 可执行文件是否可用（启动报告用）
    fn is_available(&self) -> bool {
        true
    }

    /// 启动一次 run，返回有序事件流
    ///
    /// 事件流恰好以一个 [`Event::Completed`] 结束。`cancel` 触发后进程组被终止，
    /// 仍会产出 status=cancelled 的终止事件。
    async fn spawn(
        &self,
        prompt: &str,
        resume: Option<&ResumeToken>,
        cancel: CancellationToken,
    ) -> Result<RunSession>;

    /// 取消 run（幂等）
    fn cancel(&self, run: &RunHandle) {
        run.cancel();
    }
}

/// Run 的可克隆句柄（取消 / 诊断）
#[derive(Debug, Clone)]
pub struct RunHandle {
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl RunHandle {
    pub fn new(cancel: CancellationToken, pid: Option<u32>) -> Self {
        Self { cancel, pid }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 子进程 PID（同时也是进程组 ID）
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// 一次运行中的会话：事件队列 + 句柄 + stderr 尾部
pub struct RunSession {
    engine: EngineId,
    events: mpsc::Receiver<Event>,
    handle: RunHandle,
    stderr: StderrTail,
}

impl RunSession {
    pub fn new(engine: impl Into<EngineId>, events: mpsc::Receiver<Event>, handle: RunHandle, stderr: StderrTail) -> Self {
        Self {
            engine: engine.into(),
            events,
            handle,
            stderr,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// 读取下一个事件；队列关闭时返回 None
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn stderr(&self) -> &StderrTail {
        &self.stderr
    }
}

/// 固定容量的 stderr 滚动缓冲，仅用于失败诊断
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// 引擎报告的会话 ID 能否写进恢复行并被原样解析回来
pub fn is_resume_value(value: &str) -> bool {
    !value.is_empty() && !value.starts_with('-') && !value.chars().any(|c| c.is_whitespace() || c == '`')
}

/// 恢复行语法
///
/// 一行只含恢复命令（可被反引号包裹），例如 `` `codex resume <token>` ``。
#[derive(Debug, Clone)]
pub struct ResumeSyntax {
    engine: EngineId,
    prefix: String,
    pattern: Regex,
}

impl ResumeSyntax {
    /// `<engine> resume <token>`
    pub fn subcommand(engine: &str) -> Self {
        Self::build(engine, format!("{} resume", engine), &format!(r"{}\s+resume", regex::escape(engine)))
    }

    /// `<engine> --resume <token>`
    pub fn flag(engine: &str) -> Self {
        Self::build(engine, format!("{} --resume", engine), &format!(r"{}\s+--resume", regex::escape(engine)))
    }

    fn build(engine: &str, prefix: String, head: &str) -> Self {
        let pattern = format!(r"(?m)^[ \t]*`?{}[ \t]+([^\s`\-][^\s`]*)`?[ \t]*\r?$", head);
        Self {
            engine: engine.to_string(),
            prefix,
            // engine 名已转义，模式总是合法
            pattern: Regex::new(&pattern).expect("resume pattern"),
        }
    }

    pub fn format(&self, token: &ResumeToken) -> String {
        format!("`{} {}`", self.prefix, token.value)
    }

    pub fn extract(&self, text: &str) -> Option<ResumeToken> {
        self.pattern
            .captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| ResumeToken::new(self.engine.clone(), m.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_syntax_roundtrip() {
        let syntax = ResumeSyntax::subcommand("codex");
        let token = ResumeToken::new("codex", "019b66fc-64c2-7a71-81cd-081c504cfeb2");

        let line = syntax.format(&token);
        assert_eq!(line, "`codex resume 019b66fc-64c2-7a71-81cd-081c504cfeb2`");
        assert_eq!(syntax.extract(&line), Some(token));
    }

    #[test]
    fn test_resume_syntax_requires_own_line() {
        let syntax = ResumeSyntax::subcommand("codex");

        assert!(syntax.extract("please run codex resume abc now").is_none());
        assert!(syntax.extract("resume: not-a-token").is_none());
        assert_eq!(
            syntax.extract("done\n\ncodex resume abc-1").map(|t| t.value),
            Some("abc-1".to_string())
        );
    }

    #[test]
    fn test_resume_syntax_accepts_any_reported_value() {
        let codex = ResumeSyntax::subcommand("codex");
        let claude = ResumeSyntax::flag("claude");

        for value in ["sess/abc+def=", "_private", "a@b#c", "会话-1"] {
            assert!(is_resume_value(value));
            let token = ResumeToken::new("codex", value);
            assert_eq!(codex.extract(&codex.format(&token)), Some(token));
            let token = ResumeToken::new("claude", value);
            assert_eq!(claude.extract(&claude.format(&token)), Some(token));
        }

        // 无法写成单行恢复命令的值
        for value in ["", "has space", "tick`s", "--help"] {
            assert!(!is_resume_value(value));
        }
    }

    #[test]
    fn test_resume_syntax_uses_last_line() {
        let syntax = ResumeSyntax::subcommand("codex");
        let text = "`codex resume first`\n\n`codex resume second`";

        assert_eq!(syntax.extract(text).unwrap().value, "second");
    }

    #[test]
    fn test_resume_syntaxes_do_not_overlap() {
        let codex = ResumeSyntax::subcommand("codex");
        let claude = ResumeSyntax::flag("claude");

        let codex_line = codex.format(&ResumeToken::new("codex", "abc"));
        let claude_line = claude.format(&ResumeToken::new("claude", "abc"));

        assert!(claude.extract(&codex_line).is_none());
        assert!(codex.extract(&claude_line).is_none());
        assert_eq!(claude.extract(&claude_line).unwrap().engine, "claude");
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let tail = StderrTail::new(3);
        for i in 0..10 {
            tail.push(format!("line {}", i));
        }

        assert_eq!(tail.lines(), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_run_handle_cancel_is_idempotent() {
        let handle = RunHandle::new(CancellationToken::new(), Some(1));
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(handle.pid(), Some(1));
    }
}
