//! 进度 / 最终消息渲染

use std::time::Duration;

use crate::progress::{ActionLine, ProgressState};
use crate::types::{ActionKind, ActionPhase, RunStatus};

const GLYPH_RUNNING: &str = "▸";
const GLYPH_UPDATE: &str = "↻";
const GLYPH_DONE: &str = "✓";
const GLYPH_FAIL: &str = "✗";

const HEADER_SEP: &str = " · ";
const HARD_BREAK: &str = "  \n";
const ELLIPSIS: char = '…';

/// 单条动作标题的最大宽度
pub const MAX_PROGRESS_CMD_LEN: usize = 300;
/// file_change 内联显示的文件数
const MAX_FILE_CHANGES_INLINE: usize = 3;

/// 最终渲染的输入
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub answer: Option<String>,
    pub error: Option<String>,
    /// 已格式化的恢复行
    pub resume_line: Option<String>,
    pub elapsed: Duration,
}

/// 渲染器
pub trait Presenter: Send + Sync {
    fn format_progress(&self, state: &ProgressState, elapsed: Duration, resume_line: Option<&str>) -> String;

    fn format_final(&self, state: &ProgressState, result: &RunResult) -> String;
}

/// 默认 Markdown 渲染
#[derive(Debug, Clone)]
pub struct MarkdownPresenter {
    pub command_width: Option<usize>,
    /// 在标签后附带会话标题
    pub show_title: bool,
}

impl Default for MarkdownPresenter {
    fn default() -> Self {
        Self {
            command_width: Some(MAX_PROGRESS_CMD_LEN),
            show_title: false,
        }
    }
}

impl MarkdownPresenter {
    fn header(&self, state: &ProgressState, label: &str, elapsed: Duration) -> String {
        let label = match (&state.title, self.show_title) {
            (Some(title), true) => format!("{} ({})", label, title),
            _ => label.to_string(),
        };
        let mut parts = vec![label, state.engine.clone(), format_elapsed(elapsed)];
        if state.step > 0 {
            parts.push(format!("step {}", state.step));
        }
        parts.join(HEADER_SEP)
    }

    pub fn format_line(&self, line: &ActionLine) -> String {
        let glyph = match line.phase {
            ActionPhase::Started => GLYPH_RUNNING,
            ActionPhase::Updated => GLYPH_UPDATE,
            ActionPhase::Completed => match line.ok {
                Some(true) => GLYPH_DONE,
                Some(false) => GLYPH_FAIL,
                None if line.exit_code.is_some_and(|c| c != 0) => GLYPH_FAIL,
                None => GLYPH_DONE,
            },
        };
        let suffix = match line.exit_code {
            Some(code) if code != 0 && line.is_completed() => format!(" (exit {})", code),
            _ => String::new(),
        };
        format!("{} {}{}", glyph, self.format_title(line), suffix)
    }

    fn format_title(&self, line: &ActionLine) -> String {
        let width = self.command_width;
        match line.kind {
            ActionKind::Command => format!("`{}`", shorten(&line.title, width)),
            ActionKind::Tool => format!("tool: {}", shorten(&line.title, width)),
            ActionKind::WebSearch => format!("searched: {}", shorten(&line.title, width)),
            ActionKind::FileChange if !line.changes.is_empty() => {
                let mut rendered: Vec<String> = line
                    .changes
                    .iter()
                    .take(MAX_FILE_CHANGES_INLINE)
                    .map(|(verb, path)| format!("{} `{}`", verb, path))
                    .collect();
                if line.changes.len() > MAX_FILE_CHANGES_INLINE {
                    rendered.push(format!("…({} more)", line.changes.len() - MAX_FILE_CHANGES_INLINE));
                }
                format!("files: {}", shorten(&rendered.join(", "), width))
            }
            ActionKind::FileChange => format!("files: {}", shorten(&line.title, width)),
            ActionKind::Passthrough => format!("raw: {}", shorten(&line.title, width)),
            ActionKind::Note | ActionKind::Warning => shorten(&line.title, width),
        }
    }

    fn body<'a>(&self, lines: impl Iterator<Item = &'a ActionLine>) -> Option<String> {
        let rendered: Vec<String> = lines.map(|l| self.format_line(l)).collect();
        if rendered.is_empty() {
            None
        } else {
            Some(rendered.join(HARD_BREAK))
        }
    }
}

impl Presenter for MarkdownPresenter {
    fn format_progress(&self, state: &ProgressState, elapsed: Duration, resume_line: Option<&str>) -> String {
        let header = self.header(state, "working", elapsed);
        let body = self.body(state.lines.iter());
        assemble(&header, body.as_deref(), resume_line)
    }

    fn format_final(&self, state: &ProgressState, result: &RunResult) -> String {
        let label = match result.status {
            RunStatus::Done => "done",
            RunStatus::Failed => "error",
            RunStatus::Cancelled => "cancelled",
        };
        let header = self.header(state, label, result.elapsed);

        // 成功时命令日志不再有意义
        let body = if result.status == RunStatus::Done {
            self.body(state.lines.iter().filter(|l| l.kind != ActionKind::Command))
        } else {
            self.body(state.lines.iter())
        };

        let mut chunks: Vec<String> = body.into_iter().collect();
        if let Some(answer) = result.answer.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            chunks.push(answer.to_string());
        }
        if result.status != RunStatus::Done {
            let error = result.error.as_deref().map(str::trim).filter(|e| !e.is_empty() && *e != "cancelled");
            if let Some(error) = error {
                chunks.push(error.to_string());
            }
        }
        let body = if chunks.is_empty() { None } else { Some(chunks.join("\n\n")) };

        assemble(&header, body.as_deref(), result.resume_line.as_deref())
    }
}

fn assemble(header: &str, body: Option<&str>, footer: Option<&str>) -> String {
    [Some(header), body, footer]
        .into_iter()
        .flatten()
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `Xh MMm` / `Xm SSs` / `Xs`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (minutes, seconds) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// 折叠空白后截断到 `width` 个字符，尽量在词边界处断开
pub fn shorten(text: &str, width: Option<usize>) -> String {
    let Some(width) = width else {
        return text.to_string();
    };
    if width == 0 {
        return String::new();
    }
    if text.chars().count() <= width {
        return text.to_string();
    }

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= width {
        return collapsed;
    }

    let cut: String = collapsed.chars().take(width - 1).collect();
    let cut = match cut.rfind(' ') {
        Some(pos) if pos > 0 => cut[..pos].trim_end().to_string(),
        _ => cut,
    };
    format!("{}{}", cut, ELLIPSIS)
}

/// 截断到 `limit` 个字符，保留恢复行（没有则保留最后一个非空行）
pub fn truncate_keeping_footer(text: &str, limit: usize, is_resume_line: impl Fn(&str) -> bool) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let tail_index = lines
        .iter()
        .rposition(|l| is_resume_line(l))
        .or_else(|| lines.iter().rposition(|l| !l.trim().is_empty()));

    let Some(tail_index) = tail_index else {
        return text.chars().take(limit).collect();
    };

    let tail = lines[tail_index].trim_end();
    let tail_len = tail.chars().count();
    // "…" + "\n\n"
    let reserved = tail_len + 3;
    if reserved >= limit {
        return tail.chars().take(limit).collect();
    }

    let head_text = lines[..tail_index].join("\n");
    let head: String = head_text.chars().take(limit - reserved).collect();
    format!("{}{}\n\n{}", head.trim_end(), ELLIPSIS, tail)
}
