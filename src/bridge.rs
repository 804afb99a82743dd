//! 编排核心
//!
//! 主循环：拉取入站消息 → 命令立即处理 / 普通消息按会话排队 →
//! 路由到 runner 并驱动一次 run → 节流编辑进度 → 发送最终结果。
//!
//! 每个 run 的状态：`Queued → Spawning → Streaming → Finalizing → Done`，
//! Spawning / Streaming 期间可以进入 `Cancelling`。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::Error;
use crate::locks::ResumeLockTable;
use crate::progress::{ProgressAggregator, ProgressTicker};
use crate::protocol::{ConversationId, IncomingMessage, MessageId, SendOptions, Transport};
use crate::render::{truncate_keeping_footer, MarkdownPresenter, Presenter, RunResult};
use crate::router::{select_runner, RunnerRegistry};
use crate::runner::{RunHandle, Runner};
use crate::scheduler::ConversationScheduler;
use crate::types::{CompletedEvent, EngineId, Event, ResumeToken};

/// 入站消息准入判断（false = 忽略）
pub type AcceptGate = Arc<dyn Fn(&IncomingMessage) -> bool + Send + Sync>;

/// 事件回调；返回 Err 时 run 立即中止
pub type EventHook = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// 空 prompt（只有恢复行）时发给 agent 的内容
const CONTINUE_PROMPT: &str = "continue";

/// poll 失败后的退避
const POLL_BACKOFF: Duration = Duration::from_secs(1);
/// 退出时等待进行中 run 收尾的上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Run 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Queued,
    Spawning,
    Streaming,
    Cancelling,
    Finalizing,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Queued => "queued",
            RunPhase::Spawning => "spawning",
            RunPhase::Streaming => "streaming",
            RunPhase::Cancelling => "cancelling",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// 可选的扩展点
#[derive(Clone, Default)]
pub struct BridgeOptions {
    pub presenter: Option<Arc<dyn Presenter>>,
    pub gate: Option<AcceptGate>,
    pub hook: Option<EventHook>,
}

/// 进度消息仍在的 run（可被 /cancel 命中）
struct LiveRun {
    run_id: String,
    runner: Arc<dyn Runner>,
    cancel: CancellationToken,
    handle: Option<RunHandle>,
    phase: RunPhase,
}

type LiveKey = (ConversationId, MessageId);

struct Inner {
    transport: Arc<dyn Transport>,
    registry: RunnerRegistry,
    config: BridgeConfig,
    presenter: Arc<dyn Presenter>,
    gate: Option<AcceptGate>,
    hook: Option<EventHook>,
    locks: ResumeLockTable,
    scheduler: ConversationScheduler,
    /// 会话级默认 engine（/default，仅内存）
    defaults: Mutex<HashMap<ConversationId, EngineId>>,
    live: Mutex<HashMap<LiveKey, LiveRun>>,
    /// 退出信号；每个 run 的取消令牌都是它的子令牌
    closing: CancellationToken,
    /// 已入队但尚未结束的 run 数
    in_flight: watch::Sender<usize>,
}

/// 入队到结束期间占一个计数
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: Arc<Inner>) -> Self {
        inner.in_flight.send_modify(|n| *n += 1);
        Self(inner)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Bridge
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn new(transport: Arc<dyn Transport>, registry: RunnerRegistry, config: BridgeConfig) -> Self {
        Self::with_options(transport, registry, config, BridgeOptions::default())
    }

    pub fn with_options(
        transport: Arc<dyn Transport>,
        registry: RunnerRegistry,
        config: BridgeConfig,
        options: BridgeOptions,
    ) -> Self {
        let presenter = options
            .presenter
            .unwrap_or_else(|| Arc::new(MarkdownPresenter::default()));
        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                config,
                presenter,
                gate: options.gate,
                hook: options.hook,
                locks: ResumeLockTable::new(),
                scheduler: ConversationScheduler::new(),
                defaults: Mutex::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
                closing: CancellationToken::new(),
                in_flight: watch::channel(0).0,
            }),
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.inner.registry
    }

    pub fn locks(&self) -> &ResumeLockTable {
        &self.inner.locks
    }

    /// 仍有进度消息的 run：(会话, 进度消息 ID, 状态)
    pub fn live_runs(&self) -> Vec<(ConversationId, MessageId, RunPhase)> {
        self.inner
            .live
            .lock()
            .iter()
            .map(|(&(conversation, message_id), run)| (conversation, message_id, run.phase))
            .collect()
    }

    /// 会话当前的默认 engine
    pub fn conversation_default(&self, conversation: ConversationId) -> EngineId {
        self.inner
            .defaults
            .lock()
            .get(&conversation)
            .cloned()
            .unwrap_or_else(|| self.inner.registry.default_engine().to_string())
    }

    /// 主循环，直到 `shutdown` 触发
    pub async fn run_until(&self, shutdown: CancellationToken) -> crate::Result<()> {
        tracing::info!(
            "🌉 Bridge 启动: default_engine={}, engines={:?}",
            self.inner.registry.default_engine(),
            self.inner.registry.engines()
        );
        self.send_startup_message().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("👋 Bridge 收到退出信号");
                    break;
                }
                batch = self.inner.transport.poll() => match batch {
                    Ok(messages) => {
                        for message in messages {
                            self.dispatch(message).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ poll 失败: {}", e);
                        tokio::time::sleep(POLL_BACKOFF).await;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// 取消所有进行中的 run
    ///
    /// 之后排队中的 run 不再启动。
    pub fn cancel_all(&self) {
        self.inner.closing.cancel();
        let live = self.inner.live.lock().len();
        if live > 0 {
            tracing::info!("🛑 已取消 {} 个进行中的 run", live);
        }
    }

    /// 取消所有 run，并等待它们发出最终消息（最多 `SHUTDOWN_GRACE`）
    pub async fn shutdown(&self) {
        self.cancel_all();

        let mut runs = self.inner.in_flight.subscribe();
        let pending = *runs.borrow();
        if pending == 0 {
            return;
        }
        tracing::info!("⏳ 等待 {} 个 run 收尾", pending);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, runs.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if drained {
            tracing::info!("✅ 所有 run 已收尾");
        } else {
            tracing::warn!("⏰ 等待 run 收尾超时 ({:?})", SHUTDOWN_GRACE);
        }
    }

    /// 处理一条入站消息
    ///
    /// 命令立即处理；普通消息入队，返回的接收端在该 run 结束时完成。
    pub async fn dispatch(&self, message: IncomingMessage) -> Option<oneshot::Receiver<()>> {
        if let Some(gate) = &self.inner.gate {
            if !gate(&message) {
                tracing::debug!(
                    "🚫 拒绝消息: conversation={}, sender={:?}",
                    message.conversation,
                    message.sender_id
                );
                return None;
            }
        }

        match command_word(&message.text).as_deref() {
            Some("cancel") => {
                self.handle_cancel(&message).await;
                return None;
            }
            Some("default") => {
                self.handle_default(&message).await;
                return None;
            }
            _ => {}
        }

        let (directive, prompt) = self.inner.registry.parse_directive(&message.text);
        if prompt.trim().is_empty() {
            tracing::debug!("忽略空消息: conversation={}", message.conversation);
            return None;
        }

        let conversation = message.conversation;
        tracing::debug!(
            "📥 入队: conversation={}, message_id={}, pending={}",
            conversation,
            message.message_id,
            self.inner.scheduler.pending(conversation)
        );

        let slot = InFlight::enter(self.inner.clone());
        Some(self.inner.scheduler.enqueue(conversation, async move {
            let inner = &slot.0;
            if inner.closing.is_cancelled() {
                tracing::info!(
                    "⏭️ 正在退出，跳过排队消息: conversation={}, message_id={}",
                    conversation,
                    message.message_id
                );
                return;
            }
            inner.execute(message, directive, prompt).await;
        }))
    }

    async fn handle_cancel(&self, message: &IncomingMessage) {
        let transport = &self.inner.transport;
        let conversation = message.conversation;

        let Some(target) = message.reply_to_id else {
            self.reply(message, "reply to a progress message with /cancel to stop that run.").await;
            return;
        };

        let cancelled = {
            let mut live = self.inner.live.lock();
            match live.get_mut(&(conversation, target)) {
                Some(run) if matches!(run.phase, RunPhase::Spawning | RunPhase::Streaming) => {
                    match &run.handle {
                        Some(handle) => run.runner.cancel(handle),
                        None => run.cancel.cancel(),
                    }
                    run.phase = RunPhase::Cancelling;
                    tracing::info!("🛑 取消请求: run_id={}, conversation={}", run.run_id, conversation);
                    true
                }
                // 已在取消中，重复请求视为成功
                Some(run) => run.phase == RunPhase::Cancelling,
                None => false,
            }
        };

        if !cancelled {
            tracing::debug!("没有可取消的 run: conversation={}, target={}", conversation, target);
            if let Err(e) = transport
                .send(conversation, "nothing to cancel.", SendOptions::silent_reply(message.message_id))
                .await
            {
                tracing::warn!("⚠️ 发送失败: {}", e);
            }
        }
    }

    async fn handle_default(&self, message: &IncomingMessage) {
        let registry = &self.inner.registry;
        let conversation = message.conversation;
        let argument = message.text.split_whitespace().nth(1).map(|s| s.to_lowercase());

        let text = match argument {
            None => format!(
                "default engine: {} (available: {})",
                self.conversation_default(conversation),
                registry.engines().join(", ")
            ),
            Some(engine) if registry.contains(&engine) => {
                self.inner.defaults.lock().insert(conversation, engine.clone());
                tracing::info!("🔧 会话 {} 默认 engine → {}", conversation, engine);
                format!("default engine set to {}", engine)
            }
            Some(engine) => format!(
                "unknown engine: {} (available: {})",
                engine,
                registry.engines().join(", ")
            ),
        };
        self.reply(message, &text).await;
    }

    async fn reply(&self, message: &IncomingMessage, text: &str) {
        if let Err(e) = self
            .inner
            .transport
            .send(message.conversation, text, SendOptions::silent_reply(message.message_id))
            .await
        {
            tracing::warn!("⚠️ 发送失败: {}", e);
        }
    }

    /// 启动报告：默认 engine / 可用 / 缺失
    pub fn startup_message(&self) -> String {
        let registry = &self.inner.registry;
        let (available, missing): (Vec<_>, Vec<_>) =
            registry.runners().iter().partition(|runner| runner.is_available());

        let mut text = format!(
            "🌉 bridge is ready\n\ndefault: `{}`\nagents: `{}`",
            registry.default_engine(),
            if available.is_empty() { "none".to_string() } else { engine_names(&available) }
        );
        if !missing.is_empty() {
            text.push_str(&format!("\nnot installed: `{}`", engine_names(&missing)));
        }
        text
    }

    async fn send_startup_message(&self) {
        let Some(conversation) = self.inner.config.startup_conversation else {
            return;
        };
        let text = self.startup_message();
        if let Err(e) = self
            .inner
            .transport
            .send(conversation, &text, SendOptions::default())
            .await
        {
            tracing::warn!("⚠️ 启动消息发送失败: {}", e);
        }
    }
}

impl Inner {
    /// 驱动一次 run（已获得会话槽位）
    async fn execute(&self, message: IncomingMessage, directive: Option<EngineId>, prompt: String) {
        let conversation = message.conversation;
        let run_id = uuid::Uuid::new_v4().to_string();

        // 路由
        let resolved = self.registry.resolve(&message.text, message.reply_text.as_deref());
        let conversation_default = self.defaults.lock().get(&conversation).cloned();
        let engine = select_runner(
            directive.as_deref(),
            resolved.as_ref().map(|(_, runner)| runner.engine()),
            conversation_default.as_deref(),
            self.registry.default_engine(),
        );
        let Some(runner) = self.registry.get(&engine) else {
            tracing::error!("❌ 未注册的 engine: {}", engine);
            self.send_error(&message, &format!("unknown engine: {}", engine)).await;
            return;
        };
        // 指令换了 engine 时，别家的令牌不能用来恢复
        let resume = resolved.map(|(token, _)| token).filter(|token| token.engine == engine);

        tracing::info!(
            "▶️ run 开始: run_id={}, conversation={}, engine={}, resume={}",
            run_id,
            conversation,
            engine,
            describe(resume.as_ref())
        );

        // Queued → Spawning：先拿令牌锁，再发占位消息
        let guard = match &resume {
            Some(token) => {
                if self.locks.is_locked(token) {
                    tracing::info!("⏳ 等待会话释放: run_id={}, token={}", run_id, token);
                }
                Some(self.locks.acquire(token).await)
            }
            None => None,
        };

        let prompt = strip_resume_lines(&prompt, |line| self.registry.is_resume_line(line));
        let prompt = if prompt.is_empty() { CONTINUE_PROMPT.to_string() } else { prompt };

        let mut aggregator = ProgressAggregator::new(engine.clone(), resume.clone(), self.config.max_actions);
        let placeholder = self.render_progress(&aggregator, runner.as_ref());
        let progress_id = match self
            .transport
            .send(conversation, &placeholder, SendOptions::silent_reply(message.message_id))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("⚠️ 占位消息发送失败: run_id={}, {}", run_id, e);
                None
            }
        };

        let cancel = self.closing.child_token();
        if let Some(id) = progress_id {
            self.live.lock().insert(
                (conversation, id),
                LiveRun {
                    run_id: run_id.clone(),
                    runner: runner.clone(),
                    cancel: cancel.clone(),
                    handle: None,
                    phase: RunPhase::Spawning,
                },
            );
        }
        tracing::debug!("run_id={} → {}", run_id, RunPhase::Spawning);

        let completed = match runner.spawn(&prompt, resume.as_ref(), cancel.clone()).await {
            Ok(mut session) => {
                self.attach_handle(conversation, progress_id, session.handle(), &run_id);
                self.stream(&mut session, &mut aggregator, runner.as_ref(), conversation, progress_id, &run_id)
                    .await
            }
            Err(e) => {
                tracing::error!("❌ 启动失败: run_id={}, {}", run_id, e);
                CompletedEvent::failed(spawn_error_text(&e), resume.clone())
            }
        };

        // Finalizing
        self.set_phase(conversation, progress_id, RunPhase::Finalizing, &run_id);
        let completed = completed.normalized();
        let final_resume = completed
            .resume
            .clone()
            .or_else(|| aggregator.resume().cloned())
            .or(resume);
        drop(guard);

        let result = RunResult {
            status: completed.status,
            answer: completed.answer.clone(),
            error: completed.error.clone(),
            resume_line: final_resume.as_ref().map(|t| runner.format_resume(t)),
            elapsed: aggregator.state().elapsed(),
        };
        let text = self.presenter.format_final(aggregator.state(), &result);
        let text = self.truncate(&text);

        if completed.ok() {
            tracing::info!("✅ run 完成: run_id={}, conversation={}", run_id, conversation);
        } else {
            tracing::error!(
                "❌ run 结束: run_id={}, status={}, error={}",
                run_id,
                completed.status,
                completed.error.as_deref().unwrap_or("-")
            );
        }

        self.deliver_final(&message, progress_id, &text).await;

        if let Some(id) = progress_id {
            self.live.lock().remove(&(conversation, id));
        }
        tracing::debug!("run_id={} → {}", run_id, RunPhase::Done);
    }

    /// Streaming：消费事件直到终止事件
    async fn stream(
        &self,
        session: &mut crate::runner::RunSession,
        aggregator: &mut ProgressAggregator,
        runner: &dyn Runner,
        conversation: ConversationId,
        progress_id: Option<MessageId>,
        run_id: &str,
    ) -> CompletedEvent {
        self.set_phase(conversation, progress_id, RunPhase::Streaming, run_id);
        let mut ticker = ProgressTicker::new(self.config.progress_interval);

        loop {
            tokio::select! {
                biased;
                event = session.next_event() => {
                    let Some(event) = event else {
                        tracing::error!("❌ 事件流意外关闭: run_id={}", run_id);
                        return CompletedEvent::failed("event stream closed without a result", aggregator.resume().cloned());
                    };

                    if let Some(hook) = &self.hook {
                        if let Err(e) = hook(&event) {
                            let error = Error::Callback(e.to_string());
                            tracing::error!("❌ run_id={} 中止: {}", run_id, error);
                            session.cancel();
                            return CompletedEvent::failed(
                                format!("event callback failed: {}", e),
                                aggregator.resume().cloned(),
                            );
                        }
                    }

                    tracing::debug!("📨 run_id={} 事件: {:?}", run_id, event);
                    aggregator.note(&event);
                    if let Event::Completed(completed) = event {
                        return completed;
                    }
                    // 事件积压时 tick 分支轮不到
                    if ticker.is_due() {
                        ticker.reset();
                        self.flush_progress(aggregator, runner, conversation, progress_id, run_id).await;
                    }
                }
                _ = ticker.tick() => {
                    self.flush_progress(aggregator, runner, conversation, progress_id, run_id).await;
                }
            }
        }
    }

    /// 有变化时编辑进度消息
    async fn flush_progress(
        &self,
        aggregator: &mut ProgressAggregator,
        runner: &dyn Runner,
        conversation: ConversationId,
        progress_id: Option<MessageId>,
        run_id: &str,
    ) {
        if !aggregator.take_dirty() {
            return;
        }
        if let Some(id) = progress_id {
            let text = self.truncate(&self.render_progress(aggregator, runner));
            if let Err(e) = self.transport.edit(conversation, id, &text).await {
                tracing::warn!("⚠️ 进度编辑失败: run_id={}, {}", run_id, e);
            }
        }
    }

    fn render_progress(&self, aggregator: &ProgressAggregator, runner: &dyn Runner) -> String {
        let resume_line = aggregator.resume().map(|t| runner.format_resume(t));
        self.presenter
            .format_progress(aggregator.state(), aggregator.state().elapsed(), resume_line.as_deref())
    }

    fn truncate(&self, text: &str) -> String {
        truncate_keeping_footer(text, self.config.max_message_len, |line| self.registry.is_resume_line(line))
    }

    /// Finalizing → Done：发送最终消息
    async fn deliver_final(&self, message: &IncomingMessage, progress_id: Option<MessageId>, text: &str) {
        let conversation = message.conversation;
        let loud = SendOptions::loud_reply(message.message_id);

        match progress_id {
            Some(id) if !self.config.final_notify => {
                if let Err(e) = self.transport.edit(conversation, id, text).await {
                    tracing::warn!("⚠️ 最终编辑失败，改为发送新消息: {}", e);
                    if let Err(e) = self.transport.send(conversation, text, loud).await {
                        tracing::error!("❌ 最终消息发送失败: {}", e);
                    }
                }
            }
            _ => match self.transport.send(conversation, text, loud).await {
                Ok(_) => {
                    if let Some(id) = progress_id {
                        if let Err(e) = self.transport.delete(conversation, id).await {
                            tracing::warn!("⚠️ 删除进度消息失败: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠️ 最终消息发送失败: {}", e);
                    if let Some(id) = progress_id {
                        if let Err(e) = self.transport.edit(conversation, id, text).await {
                            tracing::error!("❌ 最终结果无法送达: {}", e);
                        }
                    }
                }
            },
        }
    }

    async fn send_error(&self, message: &IncomingMessage, text: &str) {
        if let Err(e) = self
            .transport
            .send(message.conversation, text, SendOptions::loud_reply(message.message_id))
            .await
        {
            tracing::warn!("⚠️ 发送失败: {}", e);
        }
    }

    fn attach_handle(&self, conversation: ConversationId, progress_id: Option<MessageId>, handle: RunHandle, run_id: &str) {
        let Some(id) = progress_id else {
            return;
        };
        if let Some(run) = self.live.lock().get_mut(&(conversation, id)) {
            tracing::debug!("run_id={} pid={:?}", run_id, handle.pid());
            run.handle = Some(handle);
        }
    }

    fn set_phase(&self, conversation: ConversationId, progress_id: Option<MessageId>, phase: RunPhase, run_id: &str) {
        if let Some(id) = progress_id {
            if let Some(run) = self.live.lock().get_mut(&(conversation, id)) {
                // 取消中的 run 直到终止事件前都保持 Cancelling
                if run.phase == RunPhase::Cancelling && phase == RunPhase::Streaming {
                    return;
                }
                run.phase = phase;
            }
        }
        tracing::debug!("run_id={} → {}", run_id, phase);
    }
}

fn engine_names(runners: &[&Arc<dyn Runner>]) -> String {
    runners.iter().map(|r| r.engine().to_string()).collect::<Vec<_>>().join(", ")
}

/// 命令词（`/cancel@bot` → `cancel`）
fn command_word(text: &str) -> Option<String> {
    let first = text.split_whitespace().next()?;
    let command = first.strip_prefix('/')?;
    let command = command.split('@').next().unwrap_or_default();
    Some(command.to_lowercase())
}

/// 去掉 prompt 中的恢复行
fn strip_resume_lines(prompt: &str, is_resume_line: impl Fn(&str) -> bool) -> String {
    prompt
        .lines()
        .filter(|line| !is_resume_line(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn spawn_error_text(error: &Error) -> String {
    match error {
        Error::Spawn { engine, source } => format!("failed to start {}: {}", engine, source),
        other => other.to_string(),
    }
}

/// 令牌的简短描述（日志用）
fn describe(token: Option<&ResumeToken>) -> String {
    token.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_word() {
        assert_eq!(command_word("/cancel").as_deref(), Some("cancel"));
        assert_eq!(command_word("  /Cancel@my_bot please").as_deref(), Some("cancel"));
        assert_eq!(command_word("/default claude").as_deref(), Some("default"));
        assert_eq!(command_word("cancel"), None);
        assert_eq!(command_word(""), None);
    }

    #[test]
    fn test_strip_resume_lines() {
        let prompt = "now add tests\n`codex resume abc`";
        assert_eq!(strip_resume_lines(prompt, |l| l.contains("codex resume")), "now add tests");
        assert_eq!(strip_resume_lines("`codex resume abc`", |l| l.contains("codex resume")), "");
    }

    #[test]
    fn test_run_phase_display() {
        assert_eq!(RunPhase::Cancelling.to_string(), "cancelling");
    }
}
