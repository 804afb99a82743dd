//! 会话级 FIFO 调度
//!
//! 同一会话的任务严格串行、按到达顺序执行；不同会话完全并行。
//! 每个非空队列由一个 worker 任务消费，队列排空后 worker 退出并回收条目。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::ConversationId;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 会话调度器
#[derive(Clone, Default)]
pub struct ConversationScheduler {
    queues: Arc<Mutex<HashMap<ConversationId, VecDeque<Job>>>>,
}

impl ConversationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队；返回的接收端在任务结束（或被丢弃）时完成
    pub fn enqueue<F>(&self, conversation: ConversationId, job: F) -> oneshot::Receiver<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            job.await;
            let _ = done_tx.send(());
        });

        let spawn_worker = {
            let mut queues = self.queues.lock();
            match queues.get_mut(&conversation) {
                Some(queue) => {
                    queue.push_back(job);
                    false
                }
                None => {
                    queues.insert(conversation, VecDeque::from(vec![job]));
                    true
                }
            }
        };

        if spawn_worker {
            tracing::debug!("🧵 会话 {} 启动 worker", conversation);
            tokio::spawn(self.clone().drain(conversation));
        }

        done_rx
    }

    /// 排队中（未开始）的任务数
    pub fn pending(&self, conversation: ConversationId) -> usize {
        self.queues.lock().get(&conversation).map_or(0, |q| q.len())
    }

    /// 有 worker 在运行的会话数
    pub fn active_conversations(&self) -> usize {
        self.queues.lock().len()
    }

    async fn drain(self, conversation: ConversationId) {
        loop {
            let job = {
                let mut queues = self.queues.lock();
                let next = queues.get_mut(&conversation).and_then(|q| q.pop_front());
                if next.is_none() {
                    queues.remove(&conversation);
                }
                next
            };
            let Some(job) = job else {
                break;
            };

            // 单独的任务里运行，panic 不会带走 worker
            if let Err(e) = tokio::spawn(job).await {
                tracing::error!("❌ 会话 {} 的任务异常退出: {}", conversation, e);
            }
        }
        tracing::debug!("🧵 会话 {} 队列已排空", conversation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_conversation_is_fifo_and_serial() {
        let scheduler = ConversationScheduler::new();
        let conversation = ConversationId::chat(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut done = Vec::new();
        for i in 0..3u64 {
            let log = log.clone();
            done.push(scheduler.enqueue(conversation, async move {
                log.lock().push(format!("start {}", i));
                // 倒序的耗时，若并行则顺序会乱
                tokio::time::sleep(Duration::from_millis(30 - i * 10)).await;
                log.lock().push(format!("end {}", i));
            }));
        }
        for rx in done {
            rx.await.unwrap();
        }

        assert_eq!(
            *log.lock(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
    }

    #[tokio::test]
    async fn test_different_conversations_run_in_parallel() {
        let scheduler = ConversationScheduler::new();
        let (tx, rx) = oneshot::channel::<()>();

        // A 等待 B 放行；若串行则死锁
        let a = scheduler.enqueue(ConversationId::chat(1), async move {
            let _ = rx.await;
        });
        let b = scheduler.enqueue(ConversationId::chat(2), async move {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("conversations must not block each other");
    }

    #[tokio::test]
    async fn test_queue_entry_is_reclaimed() {
        let scheduler = ConversationScheduler::new();
        scheduler.enqueue(ConversationId::thread(1, 7), async {}).await.unwrap();

        // worker 在任务完成后才检查队列
        for _ in 0..100 {
            if scheduler.active_conversations() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(scheduler.active_conversations(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stall_queue() {
        let scheduler = ConversationScheduler::new();
        let conversation = ConversationId::chat(3);

        let first = scheduler.enqueue(conversation, async { panic!("boom") });
        let second = scheduler.enqueue(conversation, async {});

        assert!(first.await.is_err());
        second.await.unwrap();
    }
}
