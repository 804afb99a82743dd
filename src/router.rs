//! 恢复路由：入站消息 → (恢复令牌, runner)

use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::runner::{ClaudeRunner, CodexRunner, Runner};
use crate::types::{EngineId, ResumeToken};

/// Runner 注册表
///
/// 启动时按注册顺序填充，之后只读。
pub struct RunnerRegistry {
    runners: Vec<Arc<dyn Runner>>,
    default_engine: EngineId,
}

impl RunnerRegistry {
    pub fn new(runners: Vec<Arc<dyn Runner>>, default_engine: impl Into<EngineId>) -> Result<Self> {
        let default_engine = default_engine.into();
        if !runners.iter().any(|r| r.engine() == default_engine) {
            return Err(Error::UnknownEngine(default_engine));
        }
        for (i, runner) in runners.iter().enumerate() {
            if runners[..i].iter().any(|r| r.engine() == runner.engine()) {
                return Err(Error::Config(format!("engine 重复注册: {}", runner.engine())));
            }
        }
        Ok(Self {
            runners,
            default_engine,
        })
    }

    /// 内置 runner（codex、claude，按此顺序）
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let options = config.subprocess_options();
        Self::new(
            vec![
                Arc::new(CodexRunner::new(config.codex.clone(), options.clone())),
                Arc::new(ClaudeRunner::new(config.claude.clone(), options)),
            ],
            config.default_engine.clone(),
        )
    }

    pub fn default_engine(&self) -> &str {
        &self.default_engine
    }

    pub fn get(&self, engine: &str) -> Option<Arc<dyn Runner>> {
        self.runners.iter().find(|r| r.engine() == engine).cloned()
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.runners.iter().any(|r| r.engine() == engine)
    }

    /// 注册顺序的 engine 列表
    pub fn engines(&self) -> Vec<EngineId> {
        self.runners.iter().map(|r| r.engine().to_string()).collect()
    }

    pub fn runners(&self) -> &[Arc<dyn Runner>] {
        &self.runners
    }

    /// 解析恢复令牌
    ///
    /// 先用消息正文、再用被回复消息的文本，依次尝试每个 runner 的提取器，
    /// 返回第一个命中。None 表示新会话。
    pub fn resolve(&self, text: &str, reply_text: Option<&str>) -> Option<(ResumeToken, Arc<dyn Runner>)> {
        let sources = std::iter::once(text).chain(reply_text);
        for source in sources {
            for runner in &self.runners {
                if let Some(token) = runner.extract_resume(source) {
                    return Some((token, runner.clone()));
                }
            }
        }
        None
    }

    /// 任一 runner 是否认得这一行（截断时保留）
    pub fn is_resume_line(&self, line: &str) -> bool {
        self.runners.iter().any(|r| r.is_resume_line(line))
    }

    /// 解析开头的 `/<engine>` 指令
    ///
    /// 只识别第一条非空行的第一个词，且 engine 必须已注册；指令从 prompt 中剥离。
    pub fn parse_directive(&self, text: &str) -> (Option<EngineId>, String) {
        let Some((index, line)) = text.lines().enumerate().find(|(_, l)| !l.trim().is_empty()) else {
            return (None, text.to_string());
        };

        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return (None, text.to_string());
        };
        let word_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let word = &rest[..word_end];
        // `/codex@my_bot` 形式
        let engine = word.split('@').next().unwrap_or_default().to_lowercase();
        if !self.contains(&engine) {
            return (None, text.to_string());
        }

        let remainder = rest[word_end..].trim_start();
        let mut lines: Vec<&str> = text.lines().collect();
        lines[index] = remainder;
        let prompt = lines[index..]
            .iter()
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        (Some(engine), prompt)
    }
}

/// 选择 runner
///
/// 优先级：消息内指令 > 令牌所属 runner > 会话默认 > 进程默认。
pub fn select_runner(
    directive: Option<&str>,
    resolved: Option<&str>,
    conversation_default: Option<&str>,
    process_default: &str,
) -> EngineId {
    directive
        .or(resolved)
        .or(conversation_default)
        .unwrap_or(process_default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    fn registry() -> RunnerRegistry {
        RunnerRegistry::new(
            vec![
                Arc::new(MockRunner::new("codex", vec![])),
                Arc::new(MockRunner::new("mock", vec![])),
            ],
            "codex",
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_default_is_rejected() {
        let result = RunnerRegistry::new(vec![Arc::new(MockRunner::new("codex", vec![]))], "gemini");
        assert!(matches!(result, Err(Error::UnknownEngine(e)) if e == "gemini"));
    }

    #[test]
    fn test_from_config_registers_builtin_engines() {
        let mut config = BridgeConfig::default();
        config.default_engine = "claude".to_string();

        let registry = RunnerRegistry::from_config(&config).unwrap();
        assert_eq!(registry.engines(), vec!["codex", "claude"]);
        assert_eq!(registry.default_engine(), "claude");

        let (token, runner) = registry.resolve("`claude --resume s-1`", None).unwrap();
        assert_eq!(runner.engine(), "claude");
        assert_eq!(token.value, "s-1");
    }

    #[test]
    fn test_resolve_text_before_reply() {
        let registry = registry();

        let (token, runner) = registry
            .resolve("`mock resume from-text`", Some("`codex resume from-reply`"))
            .unwrap();
        assert_eq!(token.value, "from-text");
        assert_eq!(runner.engine(), "mock");

        let (token, runner) = registry.resolve("continue please", Some("done\n`codex resume r-1`")).unwrap();
        assert_eq!(token, ResumeToken::new("codex", "r-1"));
        assert_eq!(runner.engine(), "codex");

        assert!(registry.resolve("hello", None).is_none());
    }

    #[test]
    fn test_select_runner_precedence() {
        assert_eq!(select_runner(Some("claude"), Some("codex"), Some("mock"), "codex"), "claude");
        assert_eq!(select_runner(None, Some("codex"), Some("mock"), "claude"), "codex");
        assert_eq!(select_runner(None, None, Some("mock"), "codex"), "mock");
        assert_eq!(select_runner(None, None, None, "codex"), "codex");
    }

    #[test]
    fn test_parse_directive() {
        let registry = registry();

        assert_eq!(registry.parse_directive("/mock fix the tests"), (Some("mock".to_string()), "fix the tests".to_string()));
        assert_eq!(
            registry.parse_directive("\n  /codex@bot\nline two"),
            (Some("codex".to_string()), "line two".to_string())
        );
        // 未注册的 engine 保留原文
        assert_eq!(registry.parse_directive("/gemini hi"), (None, "/gemini hi".to_string()));
        assert_eq!(registry.parse_directive("plain"), (None, "plain".to_string()));
    }
}
