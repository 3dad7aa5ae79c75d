use crate::account::Account;
use crate::error::SyncError;
use crate::upstream::{HttpUpstream, UpstreamOptions, UpstreamRequest};
use crate::usage::{UsageInfo, UsageWindow};
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub const CLAUDE_USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const CLAUDE_USAGE_BETA: &str = "oauth-2025-04-20";

#[derive(Debug, Deserialize)]
struct RawWindow {
    #[serde(default)]
    utilization: f64,
    resets_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUsageResponse {
    five_hour: Option<RawWindow>,
    seven_day: Option<RawWindow>,
    seven_day_sonnet: Option<RawWindow>,
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn to_window(raw: RawWindow, now: DateTime<Utc>) -> UsageWindow {
    let resets_at = raw.resets_at.as_deref().and_then(parse_time);
    UsageWindow::new(raw.utilization, resets_at, now)
}

/// 解析 OAuth 用量接口响应（utilization 为百分比）。
pub fn parse_oauth_usage(body: &[u8], now: DateTime<Utc>) -> Result<UsageInfo, SyncError> {
    let raw: RawUsageResponse =
        serde_json::from_slice(body).map_err(|e| SyncError::Decode(e.to_string()))?;
    Ok(UsageInfo {
        updated_at: Some(now),
        five_hour: raw.five_hour.map(|w| to_window(w, now)),
        seven_day: raw.seven_day.map(|w| to_window(w, now)),
        seven_day_sonnet: raw.seven_day_sonnet.map(|w| to_window(w, now)),
    })
}

/// 调用 Anthropic OAuth 用量接口，不消耗消息配额。
pub async fn fetch_oauth_usage(
    upstream: &dyn HttpUpstream,
    account: &Account,
    token: &str,
    now: DateTime<Utc>,
) -> Result<UsageInfo, SyncError> {
    let req = UpstreamRequest::get(CLAUDE_USAGE_URL)
        .bearer(token)?
        .header("accept", "application/json")
        .header("anthropic-beta", CLAUDE_USAGE_BETA);
    let resp = upstream.send(req, UpstreamOptions::for_account(account)).await?;
    if !resp.is_ok() {
        return Err(SyncError::Status {
            status: resp.status,
            body: resp.body_snippet(4096),
        });
    }
    parse_oauth_usage(&resp.body, now)
}

/// Setup Token 账号没有用量接口，只能根据会话窗口状态估算 5h 窗口。
pub fn estimate_setup_token_usage(account: &Account, now: DateTime<Utc>) -> UsageInfo {
    let utilization = match account.session_window_status.trim() {
        "rejected" => 100.0,
        "allowed_warning" => 80.0,
        _ => 0.0,
    };
    UsageInfo {
        updated_at: Some(now),
        five_hour: Some(UsageWindow::new(
            utilization,
            account.session_window_end,
            now,
        )),
        ..Default::default()
    }
}
