use crate::account::{Account, AccountType, Platform};
use crate::error::ProbeError;
use crate::probe::{ProbeExecutor, ProbeStatus, check_status, send_within};
use crate::upstream::{
    HttpUpstream, TokenProvider, UpstreamOptions, UpstreamRequest, resolve_access_token,
};
use crate::usage::{UsageSnapshotSync, UsageSource};
use crate::usage::codex::extract_codex_usage_headers;
use crate::util::id;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const CODEX_RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";
pub const CODEX_TEST_MODEL: &str = "gpt-5.1-codex";
const CODEX_PROBE_INSTRUCTIONS: &str = "You are a helpful assistant. Reply briefly.";

/// OpenAI Codex 探测：发一个最小的流式请求，只为拿到响应头里的 5h/7d 配额。
pub struct CodexProbe {
    upstream: Arc<dyn HttpUpstream>,
    tokens: Option<Arc<dyn TokenProvider>>,
    usage: Arc<UsageSnapshotSync>,
}

impl CodexProbe {
    pub fn new(
        upstream: Arc<dyn HttpUpstream>,
        tokens: Option<Arc<dyn TokenProvider>>,
        usage: Arc<UsageSnapshotSync>,
    ) -> Self {
        Self {
            upstream,
            tokens,
            usage,
        }
    }

    fn build_request(account: &Account, token: &str) -> Result<UpstreamRequest, ProbeError> {
        let nonce = id::nonce_hex(8);
        let payload = json!({
            "model": CODEX_TEST_MODEL,
            "instructions": CODEX_PROBE_INSTRUCTIONS,
            "input": [{
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": "hi" }]
            }],
            "stream": true,
            "store": false,
            "prompt_cache_key": format!("probe-{nonce}"),
        });
        let body = serde_json::to_vec(&payload).map_err(|e| ProbeError::Payload(e.to_string()))?;

        let mut req = UpstreamRequest::post_json(CODEX_RESPONSES_URL, body)
            .streaming()
            .bearer(token)?
            .header("accept", "text/event-stream")
            .header("openai-beta", "responses=experimental");
        let chatgpt_account_id = account.credential("chatgpt_account_id");
        if !chatgpt_account_id.is_empty() {
            req = req.credential_header("chatgpt-account-id", &chatgpt_account_id)?;
        }
        Ok(req)
    }
}

#[async_trait]
impl ProbeExecutor for CodexProbe {
    async fn probe(
        &self,
        account: &Account,
        request_timeout: Duration,
    ) -> Result<ProbeStatus, ProbeError> {
        if account.platform != Platform::OpenAi || account.account_type != AccountType::OAuth {
            return Ok(ProbeStatus::Skipped);
        }

        let resp = send_within(request_timeout, async {
            let token = resolve_access_token(self.tokens.as_deref(), account)
                .await
                .ok_or(ProbeError::MissingToken)?;
            let req = Self::build_request(account, &token)?;
            Ok(self
                .upstream
                .send(req, UpstreamOptions::for_account(account))
                .await?)
        })
        .await?;

        // 不论状态码如何，配额头都要落库。
        let now = Utc::now();
        if let Some(raw) = extract_codex_usage_headers(&resp.headers, now)
            && let Err(e) = self
                .usage
                .apply_codex_usage(account.id, &raw, UsageSource::Probe, now)
                .await
        {
            tracing::warn!(account_id = account.id, "写入 Codex 配额快照失败: {e}");
        }

        check_status("openai", &resp)
    }
}
