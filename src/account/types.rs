use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 账号 extra 字段：上游遥测的开放式键值存储，只做合并写入，不整体替换。
pub type Extra = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[serde(alias = "codex")]
    OpenAi,
    Gemini,
    #[serde(alias = "claude")]
    Anthropic,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::OpenAi, Platform::Gemini, Platform::Anthropic];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    #[serde(rename = "oauth")]
    OAuth,
    #[serde(rename = "setup-token", alias = "setup_token")]
    SetupToken,
    #[serde(rename = "apikey", alias = "api_key", alias = "api-key")]
    ApiKey,
}

impl AccountType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OAuth => "oauth",
            Self::SetupToken => "setup-token",
            Self::ApiKey => "apikey",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Disabled,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRef {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub platform: Platform,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub extra: Extra,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyRef>,
    #[serde(default)]
    pub tls_fingerprint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_window_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_window_status: String,
}

fn default_concurrency() -> u32 {
    3
}

impl Account {
    /// OAuth 类账号：OAuth 或 Setup Token。
    pub fn is_oauth(&self) -> bool {
        matches!(
            self.account_type,
            AccountType::OAuth | AccountType::SetupToken
        )
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// 读取凭证字段（字符串或数字），去除首尾空白；不存在时返回空串。
    pub fn credential(&self, key: &str) -> String {
        match self.credentials.get(key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.proxy
            .as_ref()
            .map(|p| p.url.trim().to_string())
            .filter(|u| !u.is_empty())
    }

    /// 最近一次真实使用距今是否短于 `threshold`（从未使用过视为空闲）。
    pub fn used_within(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.last_used_at.is_some_and(|t| now - t < threshold)
    }
}
