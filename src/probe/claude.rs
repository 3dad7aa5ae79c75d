use crate::account::{Account, AccountType, Platform};
use crate::error::ProbeError;
use crate::probe::{
    ProbeExecutor, ProbeStatus, check_status, send_within, sync_usage_after_probe,
};
use crate::upstream::{
    HttpUpstream, TokenProvider, UpstreamOptions, UpstreamRequest, resolve_access_token,
};
use crate::usage::UsageSnapshotSync;
use crate::util::id;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const CLAUDE_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages?beta=true";
pub const CLAUDE_TEST_MODEL: &str = "claude-sonnet-4-5";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BETA: &str = "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14";

/// Claude 探测：发一条 max_tokens=1 的消息确认账号可用，配额交给用量同步获取。
pub struct ClaudeProbe {
    upstream: Arc<dyn HttpUpstream>,
    tokens: Option<Arc<dyn TokenProvider>>,
    usage: Option<Arc<UsageSnapshotSync>>,
}

impl ClaudeProbe {
    pub fn new(
        upstream: Arc<dyn HttpUpstream>,
        tokens: Option<Arc<dyn TokenProvider>>,
        usage: Option<Arc<UsageSnapshotSync>>,
    ) -> Self {
        Self {
            upstream,
            tokens,
            usage,
        }
    }

    /// OAuth 账号优先使用提供者刷新后的 token；Setup Token 只用凭证里存的值。
    async fn access_token(&self, account: &Account) -> Option<String> {
        let provider = match account.account_type {
            AccountType::OAuth => self.tokens.as_deref(),
            _ => None,
        };
        resolve_access_token(provider, account).await
    }

    fn build_request(token: &str) -> Result<UpstreamRequest, ProbeError> {
        let nonce = id::nonce_hex(8);
        let payload = json!({
            "model": CLAUDE_TEST_MODEL,
            "max_tokens": 1,
            "stream": true,
            "messages": [{
                "role": "user",
                "content": [{ "type": "text", "text": "hi" }]
            }],
            "metadata": { "user_id": id::probe_user_id(&nonce) },
        });
        let body = serde_json::to_vec(&payload).map_err(|e| ProbeError::Payload(e.to_string()))?;
        Ok(UpstreamRequest::post_json(CLAUDE_MESSAGES_URL, body)
            .streaming()
            .bearer(token)?
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", ANTHROPIC_BETA))
    }
}

#[async_trait]
impl ProbeExecutor for ClaudeProbe {
    async fn probe(
        &self,
        account: &Account,
        request_timeout: Duration,
    ) -> Result<ProbeStatus, ProbeError> {
        if account.platform != Platform::Anthropic || !account.is_oauth() {
            return Ok(ProbeStatus::Skipped);
        }

        let resp = send_within(request_timeout, async {
            let token = self
                .access_token(account)
                .await
                .ok_or(ProbeError::MissingToken)?;
            let req = Self::build_request(&token)?;
            Ok(self
                .upstream
                .send(req, UpstreamOptions::for_account(account))
                .await?)
        })
        .await?;

        sync_usage_after_probe(self.usage.as_deref(), account).await;
        check_status("claude", &resp)
    }
}
