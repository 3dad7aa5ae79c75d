use crate::account::{Account, AccountStore, AccountType, Extra, Platform};
use crate::error::SyncError;
use crate::upstream::{HttpUpstream, TokenProvider, resolve_access_token};
use crate::usage::codex::format_rfc3339;
use crate::usage::throttle::{MemorySyncThrottle, SyncThrottle};
use crate::usage::{
    CLAUDE_USAGE_SNAPSHOT_KEY, CODEX_USAGE_SOURCE_KEY, CLAUDE_USAGE_SOURCE_KEY, CLAUDE_USAGE_UPDATED_AT_KEY,
    GEMINI_USAGE_SNAPSHOT_KEY, GEMINI_USAGE_SOURCE_KEY, GEMINI_USAGE_UPDATED_AT_KEY, UsageSource,
    claude, codex, gemini,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 用量快照同步：按平台计算当前用量，写入账号 extra，必要时设置冷却。
///
/// 探测执行器和真实请求之后的调用方共用这一入口。
pub struct UsageSnapshotSync {
    store: Arc<dyn AccountStore>,
    upstream: Arc<dyn HttpUpstream>,
    tokens: HashMap<Platform, Arc<dyn TokenProvider>>,
    throttle: Arc<dyn SyncThrottle>,
    min_interval: Duration,
}

impl UsageSnapshotSync {
    pub fn new(store: Arc<dyn AccountStore>, upstream: Arc<dyn HttpUpstream>) -> Self {
        Self {
            store,
            upstream,
            tokens: HashMap::new(),
            throttle: Arc::new(MemorySyncThrottle::new()),
            min_interval: Duration::ZERO,
        }
    }

    pub fn with_token_provider(mut self, platform: Platform, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens.insert(platform, provider);
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn SyncThrottle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// 实时流量入口 `sync_after_traffic` 使用的节流间隔。
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// 立即同步一次。API Key 类型的 Claude 账号没有用量接口，返回错误；
    /// 其余无法获取用量的组合静默跳过。
    pub async fn sync(&self, account: &Account, source: UsageSource) -> Result<(), SyncError> {
        if account.id <= 0 {
            return Ok(());
        }
        let now = Utc::now();
        match account.platform {
            Platform::Anthropic => self.sync_claude(account, source, now).await,
            Platform::Gemini => self.sync_gemini(account, source, now).await,
            Platform::OpenAi => self.sync_codex(account, source, now).await,
        }
    }

    /// 带节流的同步：同一账号距上次同步不足 `min_interval` 时跳过。
    /// `min_interval` 为 0 时不节流。
    pub async fn sync_throttled(
        &self,
        account: &Account,
        source: UsageSource,
        min_interval: Duration,
    ) -> Result<(), SyncError> {
        if account.id <= 0 {
            return Ok(());
        }
        if !min_interval.is_zero() && !self.throttle.try_acquire(account.id, min_interval).await {
            tracing::debug!(account_id = account.id, "用量同步节流中，跳过");
            return Ok(());
        }
        self.sync(account, source).await
    }

    /// 真实请求完成后的调用入口：按配置的最小间隔节流，来源记为 gateway。
    pub async fn sync_after_traffic(&self, account: &Account) -> Result<(), SyncError> {
        self.sync_throttled(account, UsageSource::Gateway, self.min_interval)
            .await
    }

    async fn access_token(&self, account: &Account) -> Result<String, SyncError> {
        let provider = self.tokens.get(&account.platform).map(|p| p.as_ref());
        resolve_access_token(provider, account)
            .await
            .ok_or(SyncError::MissingToken)
    }

    async fn sync_claude(
        &self,
        account: &Account,
        source: UsageSource,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let usage = match account.account_type {
            AccountType::OAuth => {
                let token = self.access_token(account).await?;
                claude::fetch_oauth_usage(self.upstream.as_ref(), account, &token, now).await?
            }
            AccountType::SetupToken => claude::estimate_setup_token_usage(account, now),
            AccountType::ApiKey => {
                return Err(SyncError::Unsupported {
                    platform: account.platform.as_str(),
                    account_type: account.account_type.as_str(),
                });
            }
        };

        let updates = snapshot_updates(
            [
                CLAUDE_USAGE_SNAPSHOT_KEY,
                CLAUDE_USAGE_UPDATED_AT_KEY,
                CLAUDE_USAGE_SOURCE_KEY,
            ],
            &usage,
            source,
            now,
        )?;
        self.store.update_extra(account.id, updates).await?;
        self.arm_cooldown(account.id, usage.rate_limit_reset_at()).await;
        Ok(())
    }

    async fn sync_gemini(
        &self,
        account: &Account,
        source: UsageSource,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        // 只有项目级 OAuth 账号能查询配额。
        if account.account_type == AccountType::ApiKey {
            return Ok(());
        }
        let project_id = account.credential("project_id");
        if project_id.is_empty() {
            return Ok(());
        }

        let token = self.access_token(account).await?;
        let usage =
            gemini::fetch_quota(self.upstream.as_ref(), account, &token, &project_id, now).await?;

        let updates = snapshot_updates(
            [
                GEMINI_USAGE_SNAPSHOT_KEY,
                GEMINI_USAGE_UPDATED_AT_KEY,
                GEMINI_USAGE_SOURCE_KEY,
            ],
            &usage,
            source,
            now,
        )?;
        self.store.update_extra(account.id, updates).await?;
        self.arm_cooldown(account.id, usage.rate_limit_reset_at(now)).await;
        Ok(())
    }

    async fn sync_codex(
        &self,
        account: &Account,
        source: UsageSource,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        if account.account_type != AccountType::OAuth {
            return Ok(());
        }
        let token = self.access_token(account).await?;
        let Some(raw) = codex::fetch_usage(self.upstream.as_ref(), account, &token, now).await? else {
            return Ok(());
        };
        self.apply_codex_usage(account.id, &raw, source, now).await?;
        Ok(())
    }

    /// 分类并写回 Codex 用量（探测响应头与 usage 接口共用）。
    pub async fn apply_codex_usage(
        &self,
        account_id: i64,
        raw: &codex::RawCodexUsage,
        source: UsageSource,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let normalized = codex::classify(raw, now);
        if normalized.updates.is_empty() {
            return Ok(());
        }
        let mut updates = normalized.updates.clone();
        updates.insert(
            CODEX_USAGE_SOURCE_KEY.to_string(),
            Value::String(source.as_str().to_string()),
        );
        self.store.update_extra(account_id, updates).await?;
        self.arm_cooldown(account_id, normalized.rate_limit_reset_at()).await;
        Ok(())
    }

    /// 冷却时间仍在未来才写入；已过期的饱和状态不再触发冷却。
    async fn arm_cooldown(&self, account_id: i64, reset_at: Option<DateTime<Utc>>) {
        let Some(reset_at) = reset_at else {
            return;
        };
        if reset_at <= Utc::now() {
            return;
        }
        if let Err(e) = self.store.set_rate_limited(account_id, reset_at).await {
            tracing::warn!(account_id, "写入冷却时间失败: {e}");
        } else {
            tracing::info!(account_id, %reset_at, "配额已用满，设置冷却");
        }
    }
}

fn snapshot_updates<T: Serialize>(
    [snapshot_key, updated_at_key, source_key]: [&str; 3],
    snapshot: &T,
    source: UsageSource,
    now: DateTime<Utc>,
) -> Result<Extra, SyncError> {
    let snapshot = serde_json::to_value(snapshot).map_err(|e| SyncError::Decode(e.to_string()))?;
    let mut updates = Extra::new();
    updates.insert(snapshot_key.to_string(), snapshot);
    updates.insert(updated_at_key.to_string(), Value::String(format_rfc3339(now)));
    updates.insert(source_key.to_string(), Value::String(source.as_str().to_string()));
    Ok(updates)
}
