//! 按恢复令牌加锁
//!
//! 同一个底层 agent 会话同时只允许一个 run；不同令牌互不影响。
//! 条目按 (持有者 + 等待者) 计数，归零即从表中移除。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::types::ResumeToken;

#[derive(Default)]
struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

/// 恢复令牌锁表
#[derive(Clone, Default)]
pub struct ResumeLockTable {
    entries: Arc<Mutex<HashMap<ResumeToken, Entry>>>,
}

impl ResumeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取令牌锁，等待已有持有者释放（FIFO）
    pub async fn acquire(&self, token: &ResumeToken) -> ResumeGuard {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(token.clone()).or_default();
            entry.refs += 1;
            entry.lock.clone()
        };

        // 等待期间不持有表锁；被取消时由 Pending 归还计数
        let pending = Pending {
            table: self.clone(),
            token: Some(token.clone()),
        };
        let guard = lock.lock_owned().await;
        ResumeGuard {
            _guard: guard,
            release: pending,
        }
    }

    /// 表中的条目数（持有或等待中的令牌）
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 是否有 run 持有该令牌
    pub fn is_locked(&self, token: &ResumeToken) -> bool {
        self.entries
            .lock()
            .get(token)
            .is_some_and(|entry| entry.lock.try_lock().is_err())
    }

    fn release(&self, token: &ResumeToken) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(token) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(token);
            }
        }
    }
}

/// 计数归还（Drop 时执行）
struct Pending {
    table: ResumeLockTable,
    token: Option<ResumeToken>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.table.release(&token);
        }
    }
}

/// 令牌锁守卫，Drop 时释放
pub struct ResumeGuard {
    // 先释放互斥锁，再归还计数
    _guard: OwnedMutexGuard<()>,
    release: Pending,
}

impl ResumeGuard {
    pub fn token(&self) -> Option<&ResumeToken> {
        self.release.token.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_token_is_exclusive() {
        let table = ResumeLockTable::new();
        let token = ResumeToken::new("codex", "t");

        let first = table.acquire(&token).await;
        assert!(table.is_locked(&token));

        let waiter = {
            let table = table.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let _guard = table.acquire(&token).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_different_tokens_do_not_contend() {
        let table = ResumeLockTable::new();
        let _a = table.acquire(&ResumeToken::new("codex", "a")).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), table.acquire(&ResumeToken::new("codex", "b")))
            .await
            .expect("different token must not block");

        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_waiters_are_fifo() {
        let table = ResumeLockTable::new();
        let token = ResumeToken::new("claude", "s");
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = table.acquire(&token).await;
        let mut tasks = Vec::new();
        for i in 0..3 {
            let table = table.clone();
            let token = token.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = table.acquire(&token).await;
                order.lock().push(i);
            }));
            // 保证入队顺序
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_aborted_waiter_releases_entry() {
        let table = ResumeLockTable::new();
        let token = ResumeToken::new("codex", "x");
        let first = table.acquire(&token).await;

        let waiter = {
            let table = table.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let _guard = table.acquire(&token).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(first);
        assert!(table.is_empty());
    }
}
