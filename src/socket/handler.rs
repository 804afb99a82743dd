//! 请求处理器
//!
//! 处理来自本地客户端的各类请求

use std::sync::Arc;

use super::broadcaster::ConnId;
use super::SocketState;
use crate::protocol::{ConversationId, IncomingMessage, MessageId, Request, Response};

/// Bridge 版本号（跟随 crate 版本）
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 请求处理器
pub(crate) struct Handler {
    state: Arc<SocketState>,
}

impl Handler {
    pub fn new(state: Arc<SocketState>) -> Self {
        Self { state }
    }

    /// 处理请求
    pub async fn handle(&self, conn_id: ConnId, request: Request) -> Response {
        match request {
            Request::Hello { component, version } => {
                tracing::info!(
                    "🤝 握手: conn_id={}, component={}, version={}",
                    conn_id,
                    component,
                    version
                );
                Response::Welcome {
                    bridge_version: BRIDGE_VERSION.to_string(),
                }
            }

            Request::Subscribe { conversation } => {
                self.state.broadcaster.subscribe(conn_id, conversation);
                Response::Ok
            }

            Request::Unsubscribe { conversation } => {
                self.state.broadcaster.unsubscribe(conn_id, conversation);
                Response::Ok
            }

            Request::Message {
                conversation,
                text,
                reply_to,
                sender_id,
            } => self.handle_message(conversation, text, reply_to, sender_id).await,

            Request::Heartbeat => Response::Ok,
        }
    }

    /// 客户端消息 → 入站队列
    async fn handle_message(
        &self,
        conversation: ConversationId,
        text: String,
        reply_to: Option<MessageId>,
        sender_id: Option<i64>,
    ) -> Response {
        let message_id = self.state.next_message_id();
        let reply_text = reply_to.and_then(|id| self.state.history.lock().get(conversation, id));
        self.state.history.lock().insert(conversation, message_id, text.clone());

        tracing::debug!(
            "💬 收到消息: conversation={}, message_id={}, reply_to={:?}",
            conversation,
            message_id,
            reply_to
        );

        let message = IncomingMessage {
            conversation,
            message_id,
            text,
            reply_to_id: reply_to,
            reply_text,
            sender_id,
        };
        if self.state.inbound.send(message).await.is_err() {
            tracing::error!("入站队列已关闭");
            return Response::Error {
                code: 503,
                message: "Bridge is shutting down".to_string(),
            };
        }

        Response::Accepted { message_id }
    }
}
