//! 脚本化的进程内 Runner（测试 / 演练用）

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::{ResumeSyntax, RunHandle, RunSession, Runner, StderrTail};
use crate::error::{Error, Result};
use crate::types::{CompletedEvent, EngineId, Event, ResumeToken};

/// 脚本步骤
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// 投递一个事件
    Emit(Event),
    Sleep(Duration),
    /// 等待外部放行（`Notify::notify_one`）
    Wait(Arc<Notify>),
    /// 挂起直到被取消
    WaitForCancel,
}

/// 一次 spawn 调用的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCall {
    pub prompt: String,
    pub resume: Option<ResumeToken>,
}

/// Mock runner
///
/// 每次 spawn 取出下一段脚本；只剩一段时重复使用。
pub struct MockRunner {
    engine: EngineId,
    syntax: ResumeSyntax,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    spawn_error: Mutex<Option<String>>,
    calls: Arc<Mutex<Vec<SpawnCall>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockRunner {
    pub fn new(engine: impl Into<EngineId>, script: Vec<ScriptStep>) -> Self {
        let engine = engine.into();
        Self {
            syntax: ResumeSyntax::subcommand(&engine),
            engine,
            scripts: Mutex::new(VecDeque::from(vec![script])),
            spawn_error: Mutex::new(None),
            calls: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 追加下一次 spawn 使用的脚本
    pub fn then(self, script: Vec<ScriptStep>) -> Self {
        self.scripts.lock().push_back(script);
        self
    }

    /// 之后的 spawn 全部失败
    pub fn fail_spawn(&self, message: impl Into<String>) {
        *self.spawn_error.lock() = Some(message.into());
    }

    pub fn calls(&self) -> Vec<SpawnCall> {
        self.calls.lock().clone()
    }

    /// 同时运行的 run 数峰值
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Vec<ScriptStep> {
        let mut scripts = self.scripts.lock();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap_or_default()
        } else {
            scripts.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn engine(&self) -> &str {
        &self.engine
    }

    fn format_resume(&self, token: &ResumeToken) -> String {
        self.syntax.format(token)
    }

    fn extract_resume(&self, text: &str) -> Option<ResumeToken> {
        self.syntax.extract(text)
    }

    async fn spawn(
        &self,
        prompt: &str,
        resume: Option<&ResumeToken>,
        cancel: CancellationToken,
    ) -> Result<RunSession> {
        self.calls.lock().push(SpawnCall {
            prompt: prompt.to_string(),
            resume: resume.cloned(),
        });

        if let Some(message) = self.spawn_error.lock().clone() {
            return Err(Error::Spawn {
                engine: self.engine.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let handle = RunHandle::new(cancel.clone(), None);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let replay = Replay {
            script: self.next_script(),
            resume: resume.cloned(),
            tx,
            cancel,
            active: self.active.clone(),
        };
        tokio::spawn(replay.run());

        Ok(RunSession::new(self.engine.clone(), rx, handle, StderrTail::new(0)))
    }
}

struct Replay {
    script: Vec<ScriptStep>,
    resume: Option<ResumeToken>,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl Replay {
    async fn run(mut self) {
        let completed = self.play().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(completed) = completed {
            let _ = self.tx.send(Event::Completed(completed.normalized())).await;
        }
    }

    /// 返回需要补发的终止事件；None 表示已投递或消费者已关闭
    async fn play(&mut self) -> Option<CompletedEvent> {
        let script = std::mem::take(&mut self.script);
        for step in script {
            if self.cancel.is_cancelled() {
                return Some(CompletedEvent::cancelled(self.resume.clone()));
            }
            match step {
                ScriptStep::Emit(event) => {
                    if let Some(token) = event.resume() {
                        self.resume = Some(token.clone());
                    }
                    let terminal = event.is_terminal();
                    if self.tx.send(event).await.is_err() {
                        return None;
                    }
                    if terminal {
                        return None;
                    }
                }
                ScriptStep::Sleep(duration) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                ScriptStep::Wait(notify) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = notify.notified() => {}
                    }
                }
                ScriptStep::WaitForCancel => self.cancel.cancelled().await,
            }
        }

        if self.cancel.is_cancelled() {
            return Some(CompletedEvent::cancelled(self.resume.clone()));
        }
        Some(CompletedEvent::failed("mock script ended without a result", self.resume.clone()))
    }
}
