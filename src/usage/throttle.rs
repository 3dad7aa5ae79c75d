use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::time::{Duration, Instant};

/// 按账号 id 的同步节流：记录上次同步时间，间隔不足时拒绝。
///
/// 只在单进程内生效；多实例部署各自节流，互不协调。
#[async_trait]
pub trait SyncThrottle: Send + Sync {
    /// 距上次成功获取不足 `min_interval` 时返回 false；否则记录当前时间并返回 true。
    async fn try_acquire(&self, account_id: i64, min_interval: Duration) -> bool;
}

const MAX_TRACKED_ACCOUNTS: u64 = 100_000;

/// 基于 moka 的内存节流表，读改写在单个条目上原子完成。
#[derive(Clone)]
pub struct MemorySyncThrottle {
    last_sync: Cache<i64, Instant>,
}

impl MemorySyncThrottle {
    pub fn new() -> Self {
        Self {
            last_sync: Cache::new(MAX_TRACKED_ACCOUNTS),
        }
    }
}

impl Default for MemorySyncThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncThrottle for MemorySyncThrottle {
    async fn try_acquire(&self, account_id: i64, min_interval: Duration) -> bool {
        let now = Instant::now();
        let result = self
            .last_sync
            .entry(account_id)
            .and_compute_with(|existing| {
                let recent = existing
                    .map(|e| now.saturating_duration_since(*e.value()) < min_interval)
                    .unwrap_or(false);
                let op = if recent { Op::Nop } else { Op::Put(now) };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_))
    }
}
