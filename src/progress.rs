//! 进度聚合
//!
//! 消费单个 run 的有序事件流，维护可渲染的状态，并以固定节奏
//! 合并突发更新（只有状态变脏时才触发一次编辑）。

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::types::{ActionKind, ActionPhase, EngineId, Event, ResumeToken};

/// 一行动作
#[derive(Debug, Clone, PartialEq)]
pub struct ActionLine {
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    pub phase: ActionPhase,
    pub ok: Option<bool>,
    pub exit_code: Option<i64>,
    /// file_change 的 (动词, 路径) 列表
    pub changes: Vec<(String, String)>,
}

impl ActionLine {
    pub fn is_completed(&self) -> bool {
        self.phase == ActionPhase::Completed
    }
}

/// 可渲染的 run 状态
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub engine: EngineId,
    pub started_at: Instant,
    /// 已见过的不同动作数
    pub step: usize,
    /// 最近的动作行（按 ID upsert）
    pub lines: VecDeque<ActionLine>,
    pub resume: Option<ResumeToken>,
    pub title: Option<String>,
    pub note: Option<String>,
}

impl ProgressState {
    pub fn new(engine: impl Into<EngineId>, resume: Option<ResumeToken>) -> Self {
        Self {
            engine: engine.into(),
            started_at: Instant::now(),
            step: 0,
            lines: VecDeque::new(),
            resume,
            title: None,
            note: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// 进度聚合器
#[derive(Debug)]
pub struct ProgressAggregator {
    state: ProgressState,
    max_actions: usize,
    seen: HashSet<String>,
    warnings: usize,
    dirty: bool,
}

impl ProgressAggregator {
    pub fn new(engine: impl Into<EngineId>, resume: Option<ResumeToken>, max_actions: usize) -> Self {
        Self {
            state: ProgressState::new(engine, resume),
            max_actions: max_actions.max(1),
            seen: HashSet::new(),
            warnings: 0,
            dirty: false,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// 最近一次观察到的恢复令牌
    pub fn resume(&self) -> Option<&ResumeToken> {
        self.state.resume.as_ref()
    }

    /// 吸收一个事件，返回可见状态是否变化
    pub fn note(&mut self, event: &Event) -> bool {
        let changed = match event {
            Event::Started { resume, title, .. } => {
                let changed = self.state.resume.as_ref() != Some(resume) || self.state.title != *title;
                self.state.resume = Some(resume.clone());
                if title.is_some() {
                    self.state.title = title.clone();
                }
                changed
            }
            Event::Action { action, phase, ok } => {
                if self.seen.insert(action.id.clone()) {
                    self.state.step += 1;
                }
                let changes = file_changes(&action.detail);
                self.upsert(ActionLine {
                    id: action.id.clone(),
                    kind: action.kind,
                    title: action.title.clone(),
                    phase: *phase,
                    ok: *ok,
                    exit_code: action.exit_code(),
                    changes,
                })
            }
            Event::Progress { note } => {
                let changed = note.is_some() && self.state.note != *note;
                if note.is_some() {
                    self.state.note = note.clone();
                }
                changed
            }
            Event::Warning { message } => {
                self.warnings += 1;
                self.upsert(ActionLine {
                    id: format!("warning-{}", self.warnings),
                    kind: ActionKind::Warning,
                    title: message.clone(),
                    phase: ActionPhase::Completed,
                    ok: Some(false),
                    exit_code: None,
                    changes: Vec::new(),
                })
            }
            Event::Completed(completed) => {
                if let Some(resume) = &completed.resume {
                    self.state.resume = Some(resume.clone());
                }
                true
            }
        };

        self.dirty |= changed;
        changed
    }

    /// 取出并清除脏标记
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// 更新同 ID 的未完成行；已完成的行不再改写，重复 ID 追加新行
    fn upsert(&mut self, mut line: ActionLine) -> bool {
        if let Some(existing) = self
            .state
            .lines
            .iter_mut()
            .rev()
            .find(|l| l.id == line.id && !l.is_completed())
        {
            if line.phase == ActionPhase::Started {
                line.phase = ActionPhase::Updated;
            }
            if *existing == line {
                return false;
            }
            *existing = line;
            return true;
        }

        self.state.lines.push_back(line);
        while self.state.lines.len() > self.max_actions {
            self.state.lines.pop_front();
        }
        true
    }
}

fn file_changes(detail: &serde_json::Value) -> Vec<(String, String)> {
    detail
        .get("changes")
        .and_then(|c| c.as_array())
        .map(|changes| {
            changes
                .iter()
                .filter_map(|change| {
                    let path = change.get("path")?.as_str().filter(|p| !p.is_empty())?;
                    let verb = change
                        .get("kind")
                        .and_then(|k| k.as_str())
                        .filter(|k| !k.is_empty())
                        .unwrap_or("update");
                    Some((verb.to_string(), path.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 进度编辑节拍器
///
/// 第一拍在启动后一个间隔；错过的拍子不补发，下一拍从上次触发起算。
pub struct ProgressTicker {
    period: Duration,
    next: Instant,
}

impl ProgressTicker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub async fn tick(&mut self) {
        sleep_until(self.next).await;
        self.reset();
    }

    /// 本拍是否已到期（事件积压时不必等 `tick` 被轮询）
    pub fn is_due(&self) -> bool {
        Instant::now() >= self.next
    }

    /// 从现在起重新计一个间隔
    pub fn reset(&mut self) {
        self.next = Instant::now() + self.period;
    }
}
