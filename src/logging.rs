use reqwest::header::HeaderMap;
use std::time::Duration;

/// 日志等级：
/// - off：不输出上游请求/响应详情
/// - low：仅输出探测结果摘要（默认行为，等同 off）
/// - medium：额外输出上游请求/响应（脱敏、截断）
/// - high：输出上游请求/响应原文（不截断，仍然隐藏 Authorization）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn backend_request(
    level: LogLevel,
    account_id: i64,
    method: &str,
    url: &str,
    headers: &HeaderMap,
    body: &[u8],
) {
    tracing::info!(
        "\n====================== 上游请求 ========================\n[上游请求] account={account_id} {method} {url}\n[上游请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body(level, body)
    );
}

pub fn backend_response(
    level: LogLevel,
    account_id: i64,
    status: u16,
    duration: Duration,
    body: &[u8],
) {
    tracing::info!(
        "\n====================== 上游响应 ========================\n[上游响应] account={account_id} {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body(level, body)
    );
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();
        let redacted = key_lc == "authorization"
            || key_lc == "proxy-authorization"
            || key_lc == "x-api-key"
            || key_lc == "cookie";
        let val = if redacted {
            "***"
        } else {
            value.to_str().unwrap_or("<non-utf8>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    out
}

fn format_body(level: LogLevel, bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let text = String::from_utf8_lossy(bytes);
    if level.raw_enabled() {
        return text.into_owned();
    }
    truncate_text_for_log(&text)
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 4 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}
