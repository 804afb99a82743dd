//! Bridge 配置

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::ConversationId;
use crate::runner::SubprocessOptions;
use crate::types::EngineId;

/// 单个 engine 的启动配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// 可执行文件（名称或路径）
    pub path: PathBuf,
    /// 附加参数（紧跟 engine 固定参数）
    pub extra_args: Vec<String>,
}

impl EngineConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            extra_args: Vec::new(),
        }
    }
}

/// Bridge 配置
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// 数据目录（默认 ~/.vimo-bridge）
    pub data_dir: PathBuf,
    /// 进程级默认 engine
    pub default_engine: EngineId,
    /// 进度编辑的最小间隔
    pub progress_interval: Duration,
    /// true: 最终结果作为新消息发送（触发通知）并删除进度消息；false: 编辑进度消息
    pub final_notify: bool,
    /// 进度中保留的最近动作数
    pub max_actions: usize,
    /// 单条消息最大长度（超出时截断，保留恢复行）
    pub max_message_len: usize,
    /// stderr 诊断缓冲保留的行数
    pub stderr_tail_lines: usize,
    /// 取消时 SIGTERM 到 SIGKILL 的宽限时间
    pub kill_grace: Duration,
    /// 启动后发送就绪消息的会话
    pub startup_conversation: Option<ConversationId>,
    pub codex: EngineConfig,
    pub claude: EngineConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vimo-bridge");

        Self {
            data_dir,
            default_engine: "codex".to_string(),
            progress_interval: Duration::from_secs(2),
            final_notify: true,
            max_actions: 5,
            max_message_len: 4096,
            stderr_tail_lines: 200,
            kill_grace: Duration::from_secs(2),
            startup_conversation: None,
            codex: EngineConfig::new("codex"),
            claude: EngineConfig::new("claude"),
        }
    }
}

impl BridgeConfig {
    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("bridge.sock")
    }

    /// 子进程选项
    pub fn subprocess_options(&self) -> SubprocessOptions {
        SubprocessOptions {
            stderr_tail_lines: self.stderr_tail_lines,
            kill_grace: self.kill_grace,
            ..SubprocessOptions::default()
        }
    }

    /// 从环境变量覆盖默认配置
    ///
    /// - `VIMO_BRIDGE_DATA_DIR`
    /// - `VIMO_BRIDGE_DEFAULT_ENGINE`
    /// - `VIMO_BRIDGE_PROGRESS_SECS`（可为小数）
    /// - `VIMO_BRIDGE_FINAL_NOTIFY`（1/0/true/false）
    /// - `VIMO_BRIDGE_STARTUP_CHAT`
    /// - `VIMO_BRIDGE_CODEX_PATH` / `VIMO_BRIDGE_CODEX_ARGS`
    /// - `VIMO_BRIDGE_CLAUDE_PATH` / `VIMO_BRIDGE_CLAUDE_ARGS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源构造（测试用，避免修改进程环境变量）
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("VIMO_BRIDGE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(engine) = lookup("VIMO_BRIDGE_DEFAULT_ENGINE") {
            config.default_engine = engine.trim().to_string();
        }
        if let Some(secs) = lookup("VIMO_BRIDGE_PROGRESS_SECS") {
            let secs: f64 = secs.trim().parse().map_err(|_| {
                Error::Config(format!("VIMO_BRIDGE_PROGRESS_SECS 不是数字: {}", secs))
            })?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(Error::Config("VIMO_BRIDGE_PROGRESS_SECS 必须大于 0".into()));
            }
            config.progress_interval = Duration::from_secs_f64(secs);
        }
        if let Some(flag) = lookup("VIMO_BRIDGE_FINAL_NOTIFY") {
            config.final_notify = parse_bool(&flag).ok_or_else(|| {
                Error::Config(format!("VIMO_BRIDGE_FINAL_NOTIFY 无效: {}", flag))
            })?;
        }
        if let Some(chat) = lookup("VIMO_BRIDGE_STARTUP_CHAT") {
            let chat_id: i64 = chat.trim().parse().map_err(|_| {
                Error::Config(format!("VIMO_BRIDGE_STARTUP_CHAT 不是整数: {}", chat))
            })?;
            config.startup_conversation = Some(ConversationId::chat(chat_id));
        }

        apply_engine_env(&lookup, "CODEX", &mut config.codex);
        apply_engine_env(&lookup, "CLAUDE", &mut config.claude);

        if config.default_engine.is_empty() {
            return Err(Error::Config("default_engine 不能为空".into()));
        }

        Ok(config)
    }
}

fn apply_engine_env<F>(lookup: &F, name: &str, engine: &mut EngineConfig)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(&format!("VIMO_BRIDGE_{}_PATH", name)) {
        engine.path = PathBuf::from(path);
    }
    if let Some(args) = lookup(&format!("VIMO_BRIDGE_{}_ARGS", name)) {
        engine.extra_args = args.split_whitespace().map(|s| s.to_string()).collect();
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();

        assert_eq!(config.default_engine, "codex");
        assert_eq!(config.progress_interval, Duration::from_secs(2));
        assert!(config.final_notify);
        assert!(config.data_dir.to_str().unwrap().contains(".vimo-bridge"));
    }

    #[test]
    fn test_socket_path() {
        let mut config = BridgeConfig::default();
        config.data_dir = PathBuf::from("/tmp/test-bridge");

        assert_eq!(config.socket_path(), PathBuf::from("/tmp/test-bridge/bridge.sock"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("VIMO_BRIDGE_DEFAULT_ENGINE", "claude"),
            ("VIMO_BRIDGE_PROGRESS_SECS", "0.5"),
            ("VIMO_BRIDGE_FINAL_NOTIFY", "false"),
            ("VIMO_BRIDGE_CODEX_ARGS", "--model o3  --full-auto"),
            ("VIMO_BRIDGE_STARTUP_CHAT", "42"),
        ]))
        .unwrap();

        assert_eq!(config.default_engine, "claude");
        assert_eq!(config.progress_interval, Duration::from_millis(500));
        assert!(!config.final_notify);
        assert_eq!(config.codex.extra_args, vec!["--model", "o3", "--full-auto"]);
        assert_eq!(config.startup_conversation, Some(ConversationId::chat(42)));
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let result = BridgeConfig::from_lookup(lookup_from(&[("VIMO_BRIDGE_PROGRESS_SECS", "soon")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = BridgeConfig::from_lookup(lookup_from(&[("VIMO_BRIDGE_PROGRESS_SECS", "0")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = BridgeConfig::from_lookup(lookup_from(&[("VIMO_BRIDGE_FINAL_NOTIFY", "maybe")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
