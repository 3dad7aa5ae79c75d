//! 上游能力：HTTP 传输、access_token 提供者、上游地址白名单。
//!
//! 探测子系统只把它们当作注入的能力使用；代理选择与 TLS 指纹都由传输层负责。

pub mod client;
pub mod token;
pub mod url_allowlist;

use crate::account::Account;
use crate::error::UpstreamError;
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

pub use client::ReqwestUpstream;
pub use token::{CredentialTokenProvider, TokenProvider, resolve_access_token};
pub use url_allowlist::{UpstreamUrlValidator, UrlAllowlist};

/// 发往上游的请求（与具体 HTTP 客户端无关，便于在测试里替换传输层）。
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// 流式请求：成功时不读取响应体（SSE 流只为触发配额头）。
    pub stream: bool,
}

impl UpstreamRequest {
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body,
            stream: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            stream: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// 设置 Bearer 凭证；token 含有非法字符时返回错误，不会静默发出无凭证的请求。
    pub fn bearer(mut self, token: &str) -> Result<Self, UpstreamError> {
        let v = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| UpstreamError::InvalidHeader("authorization"))?;
        self.headers.insert(AUTHORIZATION, v);
        Ok(self)
    }

    /// 设置固定的请求头。
    pub fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }

    /// 设置来自账号凭证的请求头；值不合法时返回错误。
    pub fn credential_header(mut self, name: &'static str, value: &str) -> Result<Self, UpstreamError> {
        let v = HeaderValue::from_str(value).map_err(|_| UpstreamError::InvalidHeader(name))?;
        self.headers.insert(HeaderName::from_static(name), v);
        Ok(self)
    }
}

/// 上游响应：状态码、响应头与（可能被截断的）响应体。
#[derive(Debug, Clone, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// 响应体前 `limit` 字节的文本（去除首尾空白），用于错误信息。
    pub fn body_snippet(&self, limit: usize) -> String {
        let end = self.body.len().min(limit);
        String::from_utf8_lossy(&self.body[..end]).trim().to_string()
    }
}

/// 传输层透传参数：代理、账号、并发上限与 TLS 指纹开关。
#[derive(Debug, Clone, Default)]
pub struct UpstreamOptions {
    pub proxy_url: Option<String>,
    pub account_id: i64,
    pub concurrency: u32,
    pub tls_fingerprint: bool,
}

impl UpstreamOptions {
    pub fn for_account(account: &Account) -> Self {
        Self {
            proxy_url: account.proxy_url(),
            account_id: account.id,
            concurrency: account.concurrency,
            tls_fingerprint: account.tls_fingerprint,
        }
    }
}

#[async_trait]
pub trait HttpUpstream: Send + Sync {
    async fn send(
        &self,
        req: UpstreamRequest,
        opts: UpstreamOptions,
    ) -> Result<UpstreamResponse, UpstreamError>;
}
