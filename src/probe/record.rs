use crate::account::{AccountStore, Extra};
use crate::error::{ProbeError, truncate_message};
use crate::usage::codex::format_rfc3339;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const OAUTH_PROBE_KEY: &str = "oauth_probe";
const MAX_ERROR_CHARS: usize = 256;
const RECORD_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// 每次探测写入 extra.oauth_probe 的审计记录；未拿到响应时 status_code 为 0。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub updated_at: String,
    pub ok: bool,
    pub status_code: u16,
    pub error: String,
}

impl ProbeRecord {
    pub fn success(status_code: u16, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: format_rfc3339(now),
            ok: true,
            status_code,
            error: String::new(),
        }
    }

    pub fn failure(err: &ProbeError, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: format_rfc3339(now),
            ok: false,
            status_code: err.status_code().unwrap_or(0),
            error: truncate_message(&err.to_string(), MAX_ERROR_CHARS),
        }
    }

    pub fn to_updates(&self) -> Result<Extra, serde_json::Error> {
        let mut updates = Extra::new();
        updates.insert(OAUTH_PROBE_KEY.to_string(), serde_json::to_value(self)?);
        Ok(updates)
    }
}

/// 写入审计记录；失败或超时只记日志。
pub async fn save(store: &dyn AccountStore, account_id: i64, record: &ProbeRecord) {
    if account_id <= 0 {
        return;
    }
    let updates = match record.to_updates() {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(account_id, "序列化探测记录失败: {e}");
            return;
        }
    };
    match tokio::time::timeout(RECORD_WRITE_TIMEOUT, store.update_extra(account_id, updates)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(account_id, "写入探测记录失败: {e}"),
        Err(_) => tracing::warn!(account_id, "写入探测记录超时"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, account};
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn failure_record_truncates_error() {
        let err = ProbeError::Status {
            platform: "openai",
            status: 500,
            body: "e".repeat(1000),
        };
        let r = ProbeRecord::failure(&err, t0());
        assert!(!r.ok);
        assert_eq!(r.status_code, 500);
        assert_eq!(r.error.chars().count(), 256);
        assert!(r.error.starts_with("openai oauth probe status=500"));

        let timeout = ProbeRecord::failure(&ProbeError::Timeout(Duration::from_secs(20)), t0());
        assert_eq!(timeout.status_code, 0);
    }

    #[tokio::test]
    async fn record_is_merged_under_dedicated_key() {
        let store = MemoryStore::new(vec![account(json!({
            "id": 9,
            "platform": "openai",
            "type": "oauth",
            "extra": { "codex_5h_used_percent": 1.0 }
        }))]);
        save(&store, 9, &ProbeRecord::success(200, t0())).await;

        let extra = store.extra_of(9);
        assert_eq!(
            extra[OAUTH_PROBE_KEY],
            json!({
                "updated_at": "2026-01-01T00:00:00Z",
                "ok": true,
                "status_code": 200,
                "error": ""
            })
        );
        assert_eq!(extra["codex_5h_used_percent"], json!(1.0));

        // 未知账号只记日志
        save(&store, 404, &ProbeRecord::success(200, t0())).await;
    }
}
