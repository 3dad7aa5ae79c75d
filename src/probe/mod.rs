//! OAuth 账号后台探测。
//!
//! 调度器（`service`）只负责挑选账号、限制并发、汇总结果；每个平台的请求细节
//! 由对应的 `ProbeExecutor` 完成，调度器按平台查表分发。

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod record;
pub mod service;

use crate::account::Account;
use crate::error::ProbeError;
use crate::upstream::UpstreamResponse;
use crate::usage::{UsageSnapshotSync, UsageSource};
use async_trait::async_trait;
use std::time::Duration;

pub use claude::ClaudeProbe;
pub use gemini::GeminiProbe;
pub use openai::CodexProbe;
pub use service::{CycleStats, ProbeService};

/// 非 200 响应写入错误信息的最大字节数。
pub(crate) const MAX_ERROR_BODY_BYTES: usize = 4096;
/// 探测后同步用量的超时。
pub(crate) const USAGE_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// 调度器外层超时在请求超时与用量同步超时之外额外留出的余量（覆盖配额落库）。
pub(crate) const EXECUTOR_GRACE: Duration = Duration::from_secs(5);

/// 单次探测的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// 账号的平台/类型组合不归该执行器处理，不算失败也不写记录。
    Skipped,
    /// 上游返回了 200。
    Completed { status_code: u16 },
}

/// 平台探测执行器：构造最小请求、发送、提取配额信号。与调度周期无关。
///
/// `request_timeout` 只约束合成请求本身（取 token 与发送），探测后的用量同步
/// 使用独立的超时。
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn probe(
        &self,
        account: &Account,
        request_timeout: Duration,
    ) -> Result<ProbeStatus, ProbeError>;
}

/// 在 `request_timeout` 内完成合成请求；超时记为 `ProbeError::Timeout`。
pub(crate) async fn send_within<F>(
    request_timeout: Duration,
    request: F,
) -> Result<UpstreamResponse, ProbeError>
where
    F: Future<Output = Result<UpstreamResponse, ProbeError>>,
{
    match tokio::time::timeout(request_timeout, request).await {
        Ok(r) => r,
        Err(_) => Err(ProbeError::Timeout(request_timeout)),
    }
}

/// 200 视为成功，其余状态码转换为带截断响应体的错误。
pub(crate) fn check_status(
    platform: &'static str,
    resp: &UpstreamResponse,
) -> Result<ProbeStatus, ProbeError> {
    if resp.is_ok() {
        return Ok(ProbeStatus::Completed {
            status_code: resp.status,
        });
    }
    Err(ProbeError::Status {
        platform,
        status: resp.status,
        body: resp.body_snippet(MAX_ERROR_BODY_BYTES),
    })
}

/// 探测后同步用量快照；失败只记日志，不影响探测结果。
pub(crate) async fn sync_usage_after_probe(usage: Option<&UsageSnapshotSync>, account: &Account) {
    let Some(usage) = usage else {
        return;
    };
    match tokio::time::timeout(USAGE_SYNC_TIMEOUT, usage.sync(account, UsageSource::Probe)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(account_id = account.id, "探测后同步用量失败: {e}");
        }
        Err(_) => {
            tracing::debug!(account_id = account.id, "探测后同步用量超时");
        }
    }
}
