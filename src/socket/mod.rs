//! 本地 Unix Socket 聊天传输
//!
//! 让 bridge 不依赖第三方聊天服务也能端到端运行：
//! - 客户端通过 JSONL 帧发送消息、订阅会话
//! - bridge 的 send / edit / delete 以推送帧广播给订阅者
//! - 消息 ID 由传输分配，最近的消息文本会被记住以提供 `reply_text`

mod broadcaster;
mod handler;
mod server;

pub use broadcaster::{Broadcaster, ConnId};
pub use handler::BRIDGE_VERSION;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{ConversationId, IncomingMessage, MessageId, Push, SendOptions, Transport};

/// 记住文本的最近消息数
const HISTORY_CAPACITY: usize = 1024;

/// 入站队列容量
const INBOUND_CAPACITY: usize = 256;

/// 最近消息文本（有界，先进先出淘汰）
#[derive(Debug, Default)]
pub(crate) struct MessageHistory {
    texts: HashMap<(ConversationId, MessageId), String>,
    order: VecDeque<(ConversationId, MessageId)>,
}

impl MessageHistory {
    fn insert(&mut self, conversation: ConversationId, message_id: MessageId, text: String) {
        let key = (conversation, message_id);
        if self.texts.insert(key, text).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > HISTORY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.texts.remove(&oldest);
            }
        }
    }

    fn get(&self, conversation: ConversationId, message_id: MessageId) -> Option<String> {
        self.texts.get(&(conversation, message_id)).cloned()
    }

    fn contains(&self, conversation: ConversationId, message_id: MessageId) -> bool {
        self.texts.contains_key(&(conversation, message_id))
    }

    fn remove(&mut self, conversation: ConversationId, message_id: MessageId) -> bool {
        let key = (conversation, message_id);
        if self.texts.remove(&key).is_some() {
            self.order.retain(|k| *k != key);
            true
        } else {
            false
        }
    }
}

/// 连接处理与传输共享的状态
pub(crate) struct SocketState {
    broadcaster: Arc<Broadcaster>,
    inbound: mpsc::Sender<IncomingMessage>,
    next_message_id: AtomicI64,
    history: Mutex<MessageHistory>,
}

impl SocketState {
    fn next_message_id(&self) -> MessageId {
        self.next_message_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Unix Socket 传输
pub struct SocketTransport {
    path: PathBuf,
    state: Arc<SocketState>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<IncomingMessage>>,
    shutdown: CancellationToken,
}

impl SocketTransport {
    /// 绑定 socket 并开始接受连接（权限 0600）
    pub async fn bind(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("创建数据目录失败")?;
        }
        if path.exists() {
            fs::remove_file(&path).context("删除旧 socket 失败")?;
        }

        let listener = UnixListener::bind(&path).context("绑定 socket 失败")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let state = Arc::new(SocketState {
            broadcaster: Broadcaster::new(),
            inbound: tx,
            next_message_id: AtomicI64::new(1),
            history: Mutex::new(MessageHistory::default()),
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(server::serve(listener, state.clone(), shutdown.clone()));
        tracing::info!("🚀 Socket 传输启动: {:?}", path);

        Ok(Self {
            path,
            state,
            inbound: tokio::sync::Mutex::new(rx),
            shutdown,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection_count(&self) -> usize {
        self.state.broadcaster.connection_count()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn poll(&self) -> Result<Vec<IncomingMessage>> {
        let mut inbound = self.inbound.lock().await;
        let Some(first) = inbound.recv().await else {
            return Err(Error::transport("socket server stopped"));
        };

        let mut batch = vec![first];
        while let Ok(message) = inbound.try_recv() {
            batch.push(message);
        }
        Ok(batch)
    }

    async fn send(&self, conversation: ConversationId, text: &str, options: SendOptions) -> Result<MessageId> {
        let message_id = self.state.next_message_id();
        self.state.history.lock().insert(conversation, message_id, text.to_string());

        self.state.broadcaster.broadcast(&Push::Sent {
            conversation,
            message_id,
            text: text.to_string(),
            reply_to: options.reply_to,
            notify: options.notify,
        });
        Ok(message_id)
    }

    async fn edit(&self, conversation: ConversationId, message_id: MessageId, text: &str) -> Result<()> {
        {
            let mut history = self.state.history.lock();
            if !history.contains(conversation, message_id) {
                return Err(Error::transport(format!("message {} not found in {}", message_id, conversation)));
            }
            history.insert(conversation, message_id, text.to_string());
        }

        self.state.broadcaster.broadcast(&Push::Edited {
            conversation,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, conversation: ConversationId, message_id: MessageId) -> Result<()> {
        if !self.state.history.lock().remove(conversation, message_id) {
            return Err(Error::transport(format!("message {} not found in {}", message_id, conversation)));
        }

        self.state.broadcaster.broadcast(&Push::Deleted {
            conversation,
            message_id,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut history = MessageHistory::default();
        let conversation = ConversationId::chat(1);
        for id in 0..(HISTORY_CAPACITY as i64 + 10) {
            history.insert(conversation, id, format!("m{}", id));
        }

        assert!(history.get(conversation, 0).is_none());
        assert_eq!(history.get(conversation, 10).as_deref(), Some("m10"));
        assert_eq!(history.texts.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_history_edit_keeps_order_slot() {
        let mut history = MessageHistory::default();
        let conversation = ConversationId::chat(1);
        history.insert(conversation, 1, "a".into());
        history.insert(conversation, 1, "b".into());

        assert_eq!(history.order.len(), 1);
        assert_eq!(history.get(conversation, 1).as_deref(), Some("b"));
        assert!(history.remove(conversation, 1));
        assert!(!history.remove(conversation, 1));
    }
}
