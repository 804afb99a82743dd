//! 聊天传输协议定义
//!
//! - [`Transport`]：编排核心对外部聊天系统的唯一依赖（poll / send / edit / delete）
//! - [`Request`] / [`Response`] / [`Push`]：本地 Unix Socket 传输的 JSONL 帧
//!   （每条消息一行 JSON + '\n'）

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 聊天内消息 ID
pub type MessageId = i64;

/// 会话标识（chat 或论坛 thread）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
}

impl ConversationId {
    pub fn chat(chat_id: i64) -> Self {
        Self {
            chat_id,
            thread_id: None,
        }
    }

    pub fn thread(chat_id: i64, thread_id: i64) -> Self {
        Self {
            chat_id,
            thread_id: Some(thread_id),
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread_id) => write!(f, "{}/{}", self.chat_id, thread_id),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

/// 入站消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub conversation: ConversationId,
    pub message_id: MessageId,
    pub text: String,
    /// 回复的目标消息 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// 回复目标消息的文本（用于从历史中提取恢复令牌）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
}

/// 发送选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    pub reply_to: Option<MessageId>,
    /// false = 静默发送（不触发通知）
    pub notify: bool,
}

impl SendOptions {
    pub fn silent_reply(reply_to: MessageId) -> Self {
        Self {
            reply_to: Some(reply_to),
            notify: false,
        }
    }

    pub fn loud_reply(reply_to: MessageId) -> Self {
        Self {
            reply_to: Some(reply_to),
            notify: true,
        }
    }
}

/// 聊天传输
///
/// 所有调用都可能失败；编排层对 edit / delete 失败只记录日志，不影响 run。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 拉取下一批入站消息（长轮询，可挂起）
    async fn poll(&self) -> Result<Vec<IncomingMessage>>;

    async fn send(&self, conversation: ConversationId, text: &str, options: SendOptions) -> Result<MessageId>;

    async fn edit(&self, conversation: ConversationId, message_id: MessageId, text: &str) -> Result<()>;

    async fn delete(&self, conversation: ConversationId, message_id: MessageId) -> Result<()>;
}

/// 请求类型（Client → Bridge）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Hello {
        /// 客户端名称
        component: String,
        /// 客户端版本（用于日志和诊断）
        version: String,
    },

    /// 订阅某个会话的出站消息
    Subscribe { conversation: ConversationId },

    /// 取消订阅
    Unsubscribe { conversation: ConversationId },

    /// 发送一条聊天消息给 bridge
    Message {
        conversation: ConversationId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<i64>,
    },

    /// 心跳（保持连接）
    Heartbeat,
}

/// 响应类型（Bridge → Client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    Welcome { bridge_version: String },

    /// 消息已接收，返回分配的消息 ID
    Accepted { message_id: MessageId },
}

/// 推送事件（Bridge → 订阅者）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    /// bridge 发送了新消息
    Sent {
        conversation: ConversationId,
        message_id: MessageId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        notify: bool,
    },

    /// bridge 编辑了消息
    Edited {
        conversation: ConversationId,
        message_id: MessageId,
        text: String,
    },

    /// bridge 删除了消息
    Deleted {
        conversation: ConversationId,
        message_id: MessageId,
    },
}

impl Push {
    pub fn conversation(&self) -> ConversationId {
        match self {
            Push::Sent { conversation, .. }
            | Push::Edited { conversation, .. }
            | Push::Deleted { conversation, .. } => *conversation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_request_deserialize_minimal() {
        let json = r#"{
            "type": "Message",
            "conversation": {"chat_id": 7},
            "text": "hello"
        }"#;

        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::Message {
                conversation,
                text,
                reply_to,
                sender_id,
            } => {
                assert_eq!(conversation, ConversationId::chat(7));
                assert_eq!(text, "hello");
                assert!(reply_to.is_none());
                assert!(sender_id.is_none());
            }
            _ => panic!("Expected Message"),
        }
    }

    #[test]
    fn test_conversation_thread_serialization() {
        let json = serde_json::to_string(&ConversationId::chat(1)).unwrap();
        // thread_id 为空时应被跳过
        assert!(!json.contains("thread_id"));

        let json = serde_json::to_string(&ConversationId::thread(1, 9)).unwrap();
        assert!(json.contains("\"thread_id\":9"));
        assert_eq!(ConversationId::thread(1, 9).to_string(), "1/9");
    }

    #[test]
    fn test_push_serialize_tagged() {
        let push = Push::Edited {
            conversation: ConversationId::chat(3),
            message_id: 11,
            text: "working".to_string(),
        };
        let json = serde_json::to_string(&push).unwrap();
        assert!(json.contains("\"type\":\"Edited\""));
        assert_eq!(push.conversation(), ConversationId::chat(3));
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let json = serde_json::to_string(&Request::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"Heartbeat"}"#);
        assert!(matches!(
            serde_json::from_str::<Request>(&json).unwrap(),
            Request::Heartbeat
        ));
    }
}
