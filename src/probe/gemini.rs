use crate::account::{Account, AccountType, Platform};
use crate::error::ProbeError;
use crate::probe::{
    ProbeExecutor, ProbeStatus, check_status, send_within, sync_usage_after_probe,
};
use crate::upstream::{
    HttpUpstream, TokenProvider, UpstreamOptions, UpstreamRequest, UpstreamUrlValidator,
};
use crate::usage::UsageSnapshotSync;
use crate::util::id;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub const AI_STUDIO_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const CODE_ASSIST_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
pub const GEMINI_TEST_MODEL: &str = "gemini-2.5-flash";
const GEMINI_CLI_USER_AGENT: &str = "GeminiCLI/0.1.5 (linux; x64)";

/// Gemini 探测。无项目的账号直连公开接口，有项目的账号走 Code Assist 内部接口；
/// 两种情况都先过上游地址白名单，配额统一交给用量同步获取。
pub struct GeminiProbe {
    upstream: Arc<dyn HttpUpstream>,
    tokens: Option<Arc<dyn TokenProvider>>,
    validator: Arc<dyn UpstreamUrlValidator>,
    usage: Option<Arc<UsageSnapshotSync>>,
}

impl GeminiProbe {
    pub fn new(
        upstream: Arc<dyn HttpUpstream>,
        tokens: Option<Arc<dyn TokenProvider>>,
        validator: Arc<dyn UpstreamUrlValidator>,
        usage: Option<Arc<UsageSnapshotSync>>,
    ) -> Self {
        Self {
            upstream,
            tokens,
            validator,
            usage,
        }
    }

    fn test_payload(nonce: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": format!("hi ({nonce})") }]
            }],
            "generationConfig": { "maxOutputTokens": 1 }
        })
    }

    fn build_request(&self, account: &Account, token: &str) -> Result<UpstreamRequest, ProbeError> {
        let payload = Self::test_payload(&id::nonce_hex(8));
        let project_id = account.credential("project_id");

        if project_id.is_empty() {
            let mut base_url = account.credential("base_url");
            if base_url.is_empty() {
                base_url = AI_STUDIO_BASE_URL.to_string();
            }
            let base_url = self.validator.validate(&base_url)?;
            let url = format!(
                "{}/v1beta/models/{GEMINI_TEST_MODEL}:streamGenerateContent?alt=sse",
                base_url.trim_end_matches('/')
            );
            let body = serde_json::to_vec(&payload).map_err(|e| ProbeError::Payload(e.to_string()))?;
            return Ok(UpstreamRequest::post_json(url, body).streaming().bearer(token)?);
        }

        let wrapped = json!({
            "model": GEMINI_TEST_MODEL,
            "project": project_id,
            "request": payload,
        });
        let base_url = self.validator.validate(CODE_ASSIST_BASE_URL)?;
        let url = format!(
            "{}/v1internal:streamGenerateContent?alt=sse",
            base_url.trim_end_matches('/')
        );
        let body = serde_json::to_vec(&wrapped).map_err(|e| ProbeError::Payload(e.to_string()))?;
        Ok(UpstreamRequest::post_json(url, body)
            .streaming()
            .bearer(token)?
            .header("user-agent", GEMINI_CLI_USER_AGENT))
    }
}

#[async_trait]
impl ProbeExecutor for GeminiProbe {
    async fn probe(
        &self,
        account: &Account,
        request_timeout: Duration,
    ) -> Result<ProbeStatus, ProbeError> {
        if account.platform != Platform::Gemini || account.account_type != AccountType::OAuth {
            return Ok(ProbeStatus::Skipped);
        }
        let Some(tokens) = &self.tokens else {
            return Err(ProbeError::MissingCapability("gemini token provider"));
        };

        let resp = send_within(request_timeout, async {
            let token = tokens
                .get_access_token(account)
                .await
                .map_err(ProbeError::Token)?;
            let req = self.build_request(account, &token)?;
            Ok(self
                .upstream
                .send(req, UpstreamOptions::for_account(account))
                .await?)
        })
        .await?;

        sync_usage_after_probe(self.usage.as_deref(), account).await;
        check_status("gemini", &resp)
    }
}
