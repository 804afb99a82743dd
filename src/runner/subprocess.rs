//! JSONL 子进程运行器
//!
//! 所有基于 CLI 的 engine 共用：启动独立进程组、读取 stdout JSONL、
//! 并发收集 stderr 尾部、取消时终止整个进程组、最后产出唯一的终止事件。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::{RunHandle, RunSession, StderrTail};
use crate::error::{Error, Result};
use crate::types::{CompletedEvent, Event, ResumeToken, RunStatus};

/// 失败诊断中附带的 stderr 行数
const STDERR_IN_ERROR_LINES: usize = 10;
/// 等待组长退出时的轮询间隔
const LEADER_POLL: Duration = Duration::from_millis(20);

/// 子进程调用描述
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// 写入 stdin 的内容（写完即关闭）
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
}

/// 子进程选项
#[derive(Debug, Clone)]
pub struct SubprocessOptions {
    pub stderr_tail_lines: usize,
    pub kill_grace: Duration,
    /// 事件队列容量（满时生产者等待，不丢事件）
    pub queue_capacity: usize,
}

impl Default for SubprocessOptions {
    fn default() -> Self {
        Self {
            stderr_tail_lines: 200,
            kill_grace: Duration::from_secs(2),
            queue_capacity: 64,
        }
    }
}

/// 子进程退出摘要
#[derive(Debug, Clone, Default)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub success: bool,
    pub cancelled: bool,
    pub stderr_tail: Vec<String>,
    /// 被跳过的非法 JSON 行数
    pub malformed_lines: usize,
}

/// engine 原始记录 → 标准事件
pub trait StreamTranslator: Send + 'static {
    /// 翻译一条 JSON 记录；未识别的形状应作为透传动作返回
    fn translate(&mut self, record: Value) -> Vec<Event>;

    /// 进程结束后生成终止事件
    fn finish(&mut self, exit: &ExitSummary) -> CompletedEvent;
}

/// 启动 JSONL 子进程
pub fn spawn_jsonl(
    engine: &str,
    invocation: Invocation,
    translator: Box<dyn StreamTranslator>,
    options: &SubprocessOptions,
    cancel: CancellationToken,
) -> Result<RunSession> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &invocation.cwd {
        command.current_dir(cwd);
    }
    // 自成进程组，取消时连同派生的子进程一起回收
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        engine: engine.to_string(),
        source,
    })?;
    let pid = child.id();

    let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
        engine: engine.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "stdout 未被捕获"),
    })?;

    tracing::info!(
        "🚀 启动 {}: pid={:?}, args={:?}",
        engine,
        pid,
        invocation.args
    );

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), invocation.stdin) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                tracing::debug!("写入 stdin 失败: {}", e);
            }
            let _ = stdin.shutdown().await;
        });
    }

    let tail = StderrTail::new(options.stderr_tail_lines);
    let stderr_task = child.stderr.take().map(|stderr| {
        let tail = tail.clone();
        tokio::spawn(drain_lines(stderr, tail))
    });

    let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
    let handle = RunHandle::new(cancel.clone(), pid);

    let pump = Pump {
        engine: engine.to_string(),
        child,
        pid,
        translator,
        tx,
        cancel,
        tail: tail.clone(),
        kill_grace: options.kill_grace,
    };
    tokio::spawn(pump.run(stdout, stderr_task));

    Ok(RunSession::new(engine, rx, handle, tail))
}

/// 单生产者：读取 stdout，按序投递事件
struct Pump {
    engine: String,
    child: Child,
    pid: Option<u32>,
    translator: Box<dyn StreamTranslator>,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    tail: StderrTail,
    kill_grace: Duration,
}

impl Pump {
    async fn run(
        mut self,
        stdout: impl AsyncRead + Unpin,
        stderr_task: Option<tokio::task::JoinHandle<()>>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut cancelled = false;
        let mut consumer_gone = false;
        let mut kill_deadline: Option<Instant> = None;
        let mut killed = false;
        let mut malformed = 0usize;

        'read: loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    tracing::info!("🛑 取消 {}: 终止进程组 pid={:?}", self.engine, self.pid);
                    self.signal(Signal::Term);
                    kill_deadline = Some(Instant::now() + self.kill_grace);
                }
                _ = wait_deadline(kill_deadline), if kill_deadline.is_some() && !killed => {
                    tracing::warn!("⏰ {} 未响应 SIGTERM，强制 SIGKILL", self.engine);
                    self.signal(Signal::Kill);
                    killed = true;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let record: Value = match serde_json::from_str(trimmed) {
                            Ok(record) => record,
                            Err(e) => {
                                malformed += 1;
                                tracing::debug!("跳过非法 JSON 行 ({}): {}", self.engine, e);
                                continue;
                            }
                        };
                        for event in self.translator.translate(record) {
                            if self.tx.send(event).await.is_err() {
                                consumer_gone = true;
                                break 'read;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("读取 {} stdout 失败: {}", self.engine, e);
                        break;
                    }
                }
            }
        }

        if consumer_gone {
            // 消费者已放弃（回调失败），立即回收整个进程组
            tracing::warn!("📭 {} 事件消费者已关闭，终止进程组", self.engine);
            cancelled = true;
            self.cancel.cancel();
            self.signal(Signal::Kill);
            killed = true;
        }

        let status = if killed {
            self.child.wait().await
        } else if cancelled {
            let deadline = kill_deadline.unwrap_or_else(|| Instant::now() + self.kill_grace);
            self.reap_after_term(deadline).await
        } else {
            tokio::select! {
                biased;
                status = self.child.wait() => status,
                // stdout 已关闭但进程仍在运行
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    tracing::info!("🛑 取消 {} (stdout 已关闭): 终止进程组 pid={:?}", self.engine, self.pid);
                    self.signal(Signal::Term);
                    let deadline = Instant::now() + self.kill_grace;
                    self.reap_after_term(deadline).await
                }
            }
        };

        if let Some(task) = stderr_task {
            // 被遗留的后台进程可能仍持有 stderr
            let _ = timeout(Duration::from_secs(1), task).await;
        }

        let summary = match &status {
            Ok(status) => ExitSummary {
                code: status.code(),
                success: status.success(),
                cancelled,
                stderr_tail: self.tail.lines(),
                malformed_lines: malformed,
            },
            Err(e) => {
                tracing::error!("等待 {} 退出失败: {}", self.engine, e);
                ExitSummary {
                    code: None,
                    success: false,
                    cancelled,
                    stderr_tail: self.tail.lines(),
                    malformed_lines: malformed,
                }
            }
        };

        tracing::info!(
            "🏁 {} 退出: code={:?}, cancelled={}, malformed_lines={}",
            self.engine,
            summary.code,
            summary.cancelled,
            summary.malformed_lines
        );

        let completed = self.translator.finish(&summary).normalized();
        if !consumer_gone {
            let _ = self.tx.send(Event::Completed(completed)).await;
        }
    }

    /// SIGTERM 之后：等到宽限期结束或组长退出（取先到者），
    /// 在回收组长之前向整个进程组补发 SIGKILL
    async fn reap_after_term(&mut self, deadline: Instant) -> std::io::Result<std::process::ExitStatus> {
        let mut poll = tokio::time::interval(LEADER_POLL);
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    tracing::warn!("⏰ {} 宽限期结束，SIGKILL 进程组", self.engine);
                    break;
                }
                _ = poll.tick() => {
                    if self.leader_exited() {
                        tracing::debug!("{} 组长已退出，清理残留进程组", self.engine);
                        break;
                    }
                }
            }
        }
        self.signal(Signal::Kill);
        self.child.wait().await
    }

    /// 组长是否已退出；unix 下不回收，僵尸组长继续占住进程组 ID
    #[cfg(unix)]
    fn leader_exited(&mut self) -> bool {
        let Some(pid) = self.pid else {
            return matches!(self.child.try_wait(), Ok(Some(_)));
        };
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        rc == 0 && info.si_signo == libc::SIGCHLD
    }

    #[cfg(not(unix))]
    fn leader_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn signal(&mut self, signal: Signal) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let signo = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            // 子进程尚未被 wait 回收，进程组 ID 不会被复用
            let rc = unsafe { libc::killpg(pid as libc::pid_t, signo) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!("killpg({}) 失败: {}", pid, err);
                }
            }
            return;
        }

        let _ = signal;
        let _ = self.child.start_kill();
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn drain_lines(stream: impl AsyncRead + Unpin, tail: StderrTail) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tail.push(line);
        }
    }
}

/// 根据退出摘要与流内状态得出终止事件（各 engine 共用）
pub fn conclude(
    engine: &str,
    exit: &ExitSummary,
    resume: Option<ResumeToken>,
    answer: Option<String>,
    stream_error: Option<String>,
) -> CompletedEvent {
    let answer = answer.filter(|a| !a.trim().is_empty());

    if exit.cancelled {
        return CompletedEvent {
            answer,
            ..CompletedEvent::cancelled(resume)
        };
    }

    if !exit.success || stream_error.is_some() {
        let mut error = stream_error.unwrap_or_else(|| match exit.code {
            Some(code) => format!("{} exited with code {}", engine, code),
            None => format!("{} was terminated by a signal", engine),
        });
        if !exit.success && !exit.stderr_tail.is_empty() {
            let start = exit.stderr_tail.len().saturating_sub(STDERR_IN_ERROR_LINES);
            error.push_str("\n\n");
            error.push_str(&exit.stderr_tail[start..].join("\n"));
        }
        return CompletedEvent {
            status: RunStatus::Failed,
            resume,
            answer,
            error: Some(error),
        };
    }

    match answer {
        Some(answer) => CompletedEvent::done(answer, resume),
        None => CompletedEvent::failed(format!("{} finished without an answer", engine), resume),
    }
}

/// 未识别记录的透传动作
pub fn passthrough(id: String, record: Value) -> Event {
    let title = record
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t.to_string())
        .unwrap_or_else(|| "unrecognized record".to_string());
    Event::action(
        crate::types::Action::new(id, crate::types::ActionKind::Passthrough, title).with_detail(record),
        crate::types::ActionPhase::Completed,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(success: bool, code: Option<i32>) -> ExitSummary {
        ExitSummary {
            code,
            success,
            ..Default::default()
        }
    }

    #[test]
    fn test_conclude_success() {
        let token = ResumeToken::new("codex", "t1");
        let completed = conclude("codex", &exit(true, Some(0)), Some(token.clone()), Some("hi".into()), None);

        assert_eq!(completed.status, RunStatus::Done);
        assert_eq!(completed.answer.as_deref(), Some("hi"));
        assert_eq!(completed.resume, Some(token));
    }

    #[test]
    fn test_conclude_failure_keeps_resume_and_stderr() {
        let token = ResumeToken::new("codex", "t1");
        let mut summary = exit(false, Some(2));
        summary.stderr_tail = vec!["panic: boom".to_string()];

        let completed = conclude("codex", &summary, Some(token.clone()), None, None);

        assert_eq!(completed.status, RunStatus::Failed);
        assert_eq!(completed.resume, Some(token));
        let error = completed.error.unwrap();
        assert!(error.contains("exited with code 2"));
        assert!(error.contains("panic: boom"));
    }

    #[test]
    fn test_conclude_stream_error_wins_over_clean_exit() {
        let completed = conclude("codex", &exit(true, Some(0)), None, None, Some("turn failed".into()));

        assert_eq!(completed.status, RunStatus::Failed);
        assert_eq!(completed.error.as_deref(), Some("turn failed"));
    }

    #[test]
    fn test_conclude_cancelled() {
        let mut summary = exit(false, None);
        summary.cancelled = true;
        let token = ResumeToken::new("claude", "s");

        let completed = conclude("claude", &summary, Some(token.clone()), None, None);

        assert_eq!(completed.status, RunStatus::Cancelled);
        assert_eq!(completed.resume, Some(token));
    }

    #[test]
    fn test_conclude_without_answer_fails() {
        let completed = conclude("codex", &exit(true, Some(0)), None, Some("  ".into()), None);
        assert_eq!(completed.status, RunStatus::Failed);
    }

    #[test]
    fn test_passthrough_keeps_record() {
        let record = serde_json::json!({"type": "mystery", "x": 1});
        match passthrough("raw-1".into(), record.clone()) {
            Event::Action { action, .. } => {
                assert_eq!(action.title, "mystery");
                assert_eq!(action.detail, record);
            }
            other => panic!("Expected Action, got {:?}", other),
        }
    }
}
