//! 探测调度器：周期性挑选空闲的 OAuth 账号，限制并发地分发给各平台执行器。

use crate::account::{Account, AccountStore, Platform};
use crate::config::ProbeConfig;
use crate::error::{ProbeError, StoreError, truncate_message};
use crate::probe::record::{self, ProbeRecord};
use crate::probe::{EXECUTOR_GRACE, ProbeExecutor, ProbeStatus, USAGE_SYNC_TIMEOUT};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 单个平台在一轮中的计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStats {
    pub attempted: usize,
    pub ok: usize,
}

/// 一轮探测的汇总。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// 账号存储返回的 active 账号数。
    pub total: usize,
    /// 过滤、截断后实际分发的账号数。
    pub targets: usize,
    pub ok: usize,
    pub failed: usize,
    pub per_platform: HashMap<Platform, PlatformStats>,
}

impl CycleStats {
    pub fn platform(&self, platform: Platform) -> PlatformStats {
        self.per_platform.get(&platform).copied().unwrap_or_default()
    }

    fn record(&mut self, platform: Platform, ok: bool) {
        let entry = self.per_platform.entry(platform).or_default();
        entry.attempted += 1;
        if ok {
            entry.ok += 1;
            self.ok += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub struct ProbeService {
    store: Arc<dyn AccountStore>,
    executors: HashMap<Platform, Arc<dyn ProbeExecutor>>,
    cfg: ProbeConfig,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeService {
    pub fn new(store: Arc<dyn AccountStore>, cfg: ProbeConfig) -> Self {
        Self {
            store,
            executors: HashMap::new(),
            cfg,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// 注册平台执行器；未注册执行器的平台不会被探测。
    pub fn with_executor(mut self, platform: Platform, executor: Arc<dyn ProbeExecutor>) -> Self {
        self.executors.insert(platform, executor);
        self
    }

    /// 启动后台循环：立即跑一轮，之后按 `check_interval` 周期执行。
    /// 配置未启用时什么也不做。
    pub fn start(self: &Arc<Self>) {
        if !self.cfg.enabled {
            tracing::info!("OAuth 探测未启用");
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let interval = self.cfg.check_interval();
        tracing::info!(
            "OAuth 探测已启动：interval={}m idle_threshold={}m timeout={}s concurrency={} max_accounts_per_cycle={}",
            interval.as_secs() / 60,
            self.cfg.idle_threshold_minutes,
            self.cfg.request_timeout().as_secs(),
            self.cfg.max_concurrency(),
            self.cfg.max_accounts_per_cycle,
        );

        let svc = Arc::clone(self);
        let cancel = self.cancel.clone();
        *slot = Some(tokio::spawn(async move {
            svc.run_cycle_logged().await;

            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => svc.run_cycle_logged().await,
                }
            }
        }));
    }

    /// 停止后台循环，并等待正在进行的一轮全部结束。未启动时直接返回。
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = handle.await {
            tracing::warn!("OAuth 探测循环异常退出: {e}");
        }
        tracing::info!("OAuth 探测已停止");
    }

    async fn run_cycle_logged(&self) {
        if let Err(e) = self.run_cycle().await {
            tracing::warn!("OAuth 探测：列出账号失败，本轮跳过: {e}");
        }
    }

    /// 选出本轮要探测的账号：OAuth 类、平台有执行器、空闲时间足够，再按上限截断。
    fn select_targets(&self, accounts: Vec<Account>) -> Vec<Account> {
        let now = Utc::now();
        let idle = self.cfg.idle_threshold();
        let mut targets: Vec<Account> = accounts
            .into_iter()
            .filter(|a| a.is_oauth() && self.executors.contains_key(&a.platform))
            .filter(|a| idle.is_none_or(|threshold| !a.used_within(threshold, now)))
            .collect();
        if let Some(max) = self.cfg.max_accounts_per_cycle() {
            targets.truncate(max);
        }
        targets
    }

    /// 执行一轮探测。单个账号失败只计数；只有列出账号失败会让本轮提前结束。
    pub async fn run_cycle(&self) -> Result<CycleStats, StoreError> {
        let accounts = self.store.list_active().await?;
        let total = accounts.len();
        let targets = self.select_targets(accounts);

        if targets.is_empty() {
            tracing::info!("OAuth 探测本轮结束：total={total} targets=0");
            return Ok(CycleStats {
                total,
                ..Default::default()
            });
        }

        let target_count = targets.len();
        let stats = Arc::new(tokio::sync::Mutex::new(CycleStats {
            total,
            targets: target_count,
            ..Default::default()
        }));
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrency()));
        let timeout = self.cfg.request_timeout();
        let mut handles = Vec::with_capacity(target_count);

        for account in targets {
            let Some(executor) = self.executors.get(&account.platform).cloned() else {
                continue;
            };
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let store = Arc::clone(&self.store);
            let stats = Arc::clone(&stats);

            handles.push((
                account.platform,
                tokio::spawn(async move {
                    let _permit = permit;
                    let ok = probe_one(store.as_ref(), executor.as_ref(), &account, timeout).await;
                    stats.lock().await.record(account.platform, ok);
                }),
            ));
        }

        let (platforms, joins): (Vec<Platform>, Vec<_>) = handles.into_iter().unzip();
        let results = futures::future::join_all(joins).await;
        for (platform, result) in platforms.into_iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(platform = %platform, "探测任务异常退出: {e}");
                stats.lock().await.record(platform, false);
            }
        }

        let stats = stats.lock().await.clone();
        let p = |platform| stats.platform(platform);
        tracing::info!(
            "OAuth 探测本轮结束：total={} targets={} ok={} failed={} (openai={} ok={}, gemini={} ok={}, claude={} ok={})",
            stats.total,
            stats.targets,
            stats.ok,
            stats.failed,
            p(Platform::OpenAi).attempted,
            p(Platform::OpenAi).ok,
            p(Platform::Gemini).attempted,
            p(Platform::Gemini).ok,
            p(Platform::Anthropic).attempted,
            p(Platform::Anthropic).ok,
        );
        Ok(stats)
    }
}

/// 探测单个账号并写入审计记录，返回是否成功。跳过的账号视为成功且不写记录。
///
/// `request_timeout` 交给执行器约束合成请求；这里的外层超时只兜底，
/// 覆盖请求、探测后的用量同步与配额落库。
async fn probe_one(
    store: &dyn AccountStore,
    executor: &dyn ProbeExecutor,
    account: &Account,
    request_timeout: Duration,
) -> bool {
    let guard = request_timeout + USAGE_SYNC_TIMEOUT + EXECUTOR_GRACE;
    let result = match tokio::time::timeout(guard, executor.probe(account, request_timeout)).await {
        Ok(r) => r,
        Err(_) => Err(ProbeError::Timeout(guard)),
    };

    let now = Utc::now();
    match result {
        Ok(ProbeStatus::Skipped) => true,
        Ok(ProbeStatus::Completed { status_code }) => {
            record::save(store, account.id, &ProbeRecord::success(status_code, now)).await;
            true
        }
        Err(e) => {
            tracing::warn!(
                account_id = account.id,
                platform = %account.platform,
                status = e.status_code().unwrap_or(0),
                "OAuth 探测失败: {}",
                truncate_message(&e.to_string(), 256)
            );
            record::save(store, account.id, &ProbeRecord::failure(&e, now)).await;
            false
        }
    }
}
