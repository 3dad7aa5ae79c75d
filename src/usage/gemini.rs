use crate::account::Account;
use crate::error::SyncError;
use crate::upstream::{HttpUpstream, UpstreamOptions, UpstreamRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonContainerTrait, JsonValueTrait};

pub const GEMINI_QUOTA_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:retrieveUserQuota";

/// 单个模型的配额桶。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiQuotaBucket {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_id: String,
    pub remaining_fraction: f64,
    pub used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

/// Gemini 用量快照，整体序列化写入 `gemini_usage_snapshot`。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub buckets: Vec<GeminiQuotaBucket>,
}

impl GeminiUsage {
    /// 所有配额桶都已用满时返回最早的未来重置时间；只要还有一个模型可用就不冷却。
    pub fn rate_limit_reset_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.buckets.is_empty() || self.buckets.iter().any(|b| b.used_percent < 100.0) {
            return None;
        }
        self.buckets
            .iter()
            .filter_map(|b| b.reset_at)
            .filter(|t| *t > now)
            .min()
    }
}

/// 解析 `retrieveUserQuota` 响应。
///
/// 配额耗尽时上游可能只返回 `resetTime` 而不带 `remainingFraction`，此时按 0 处理。
pub fn parse_quota(body: &[u8], now: DateTime<Utc>) -> Result<GeminiUsage, SyncError> {
    let value: sonic_rs::Value =
        sonic_rs::from_slice(body).map_err(|e| SyncError::Decode(e.to_string()))?;

    let mut buckets = Vec::new();
    let arr = value
        .as_object()
        .and_then(|obj| obj.get(&"buckets"))
        .and_then(|v| v.as_array());
    if let Some(arr) = arr {
        for item in arr.iter() {
            if let Some(b) = parse_bucket(item) {
                buckets.push(b);
            }
        }
    }

    Ok(GeminiUsage {
        updated_at: Some(now),
        buckets,
    })
}

fn parse_bucket(item: &sonic_rs::Value) -> Option<GeminiQuotaBucket> {
    let obj = item.as_object()?;
    let has_fraction = obj.contains_key(&"remainingFraction");
    let fraction = obj
        .get(&"remainingFraction")
        .and_then(any_to_float64)
        .map(clamp01);
    let reset_time = obj
        .get(&"resetTime")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let remaining_fraction = match (fraction, has_fraction, reset_time) {
        (Some(f), _, _) => f,
        (None, false, Some(_)) => 0.0,
        (None, _, _) => 1.0,
    };

    Some(GeminiQuotaBucket {
        model_id: obj
            .get(&"modelId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string(),
        remaining_fraction,
        used_percent: (1.0 - remaining_fraction) * 100.0,
        reset_at: reset_time
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

/// 查询项目级配额（Code Assist 内部接口）。
pub async fn fetch_quota(
    upstream: &dyn HttpUpstream,
    account: &Account,
    token: &str,
    project_id: &str,
    now: DateTime<Utc>,
) -> Result<GeminiUsage, SyncError> {
    let body = serde_json::to_vec(&serde_json::json!({ "project": project_id }))
        .map_err(|e| SyncError::Decode(e.to_string()))?;
    let req = UpstreamRequest::post_json(GEMINI_QUOTA_URL, body).bearer(token)?;
    let resp = upstream.send(req, UpstreamOptions::for_account(account)).await?;
    if !resp.is_ok() {
        return Err(SyncError::Status {
            status: resp.status,
            body: resp.body_snippet(4096),
        });
    }
    parse_quota(&resp.body, now)
}

fn any_to_float64(v: &sonic_rs::Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    if let Some(n) = v.as_i64() {
        return Some(n as f64);
    }
    if let Some(s) = v.as_str() {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        return s.parse().ok();
    }
    None
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}
