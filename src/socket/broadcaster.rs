//! 推送广播器
//!
//! 维护连接与会话订阅，把 bridge 的出站消息推送给订阅者

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{ConversationId, Push};

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

/// 推送广播器
#[derive(Default)]
pub struct Broadcaster {
    /// 订阅关系：ConnId → 订阅的会话
    subscriptions: RwLock<HashMap<ConnId, HashSet<ConversationId>>>,
    /// 连接通道：ConnId → 发送通道
    senders: RwLock<HashMap<ConnId, MessageSender>>,
    next_conn_id: RwLock<ConnId>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册新连接，返回连接 ID
    pub fn register(&self, sender: MessageSender) -> ConnId {
        let mut next_id = self.next_conn_id.write();
        *next_id += 1;
        let conn_id = *next_id;

        self.senders.write().insert(conn_id, sender);
        self.subscriptions.write().insert(conn_id, HashSet::new());

        tracing::debug!("📡 Connection registered: conn_id={}", conn_id);
        conn_id
    }

    pub fn unregister(&self, conn_id: ConnId) {
        self.senders.write().remove(&conn_id);
        self.subscriptions.write().remove(&conn_id);
        tracing::debug!("📡 Connection unregistered: conn_id={}", conn_id);
    }

    pub fn subscribe(&self, conn_id: ConnId, conversation: ConversationId) {
        if let Some(sub) = self.subscriptions.write().get_mut(&conn_id) {
            sub.insert(conversation);
            tracing::debug!("📡 Subscribed: conn_id={}, conversation={}", conn_id, conversation);
        }
    }

    pub fn unsubscribe(&self, conn_id: ConnId, conversation: ConversationId) {
        if let Some(sub) = self.subscriptions.write().get_mut(&conn_id) {
            sub.remove(&conversation);
            tracing::debug!("📡 Unsubscribed: conn_id={}, conversation={}", conn_id, conversation);
        }
    }

    /// 推送给订阅了该会话的连接（非阻塞，返回送达数）
    pub fn broadcast(&self, push: &Push) -> usize {
        let conversation = push.conversation();
        let message = match serde_json::to_string(push) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                tracing::error!("Failed to serialize push: {}", e);
                return 0;
            }
        };

        let targets: Vec<(ConnId, MessageSender)> = {
            let subs = self.subscriptions.read();
            let senders = self.senders.read();

            subs.iter()
                .filter(|(_, subscribed)| subscribed.contains(&conversation))
                .filter_map(|(conn_id, _)| senders.get(conn_id).map(|s| (*conn_id, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: conversation={}", conversation);
            return 0;
        }

        let mut delivered = 0;
        for (conn_id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("📡 Channel full, dropping push: conn_id={}", conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("📡 Channel closed: conn_id={}", conn_id);
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// 发送消息到指定连接
    pub async fn send_to(&self, conn_id: ConnId, message: String) -> bool {
        // 先 clone sender 再释放锁
        let sender = self.senders.read().get(&conn_id).cloned();
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }

    /// 非阻塞发送到指定连接
    pub fn try_send_to(&self, conn_id: ConnId, message: String) -> bool {
        let sender = self.senders.read().get(&conn_id).cloned();
        sender.is_some_and(|s| s.try_send(message).is_ok())
    }
}
