use std::time::Duration;
use thiserror::Error;

/// 账号存储错误。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("账号不存在: {0}")]
    NotFound(i64),

    #[error("存储失败: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// 上游 HTTP 传输错误（发送阶段，未拿到响应）。
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("请求头 {0} 的值不合法")]
    InvalidHeader(&'static str),

    #[error("代理配置无效: {0}")]
    Proxy(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// 上游地址白名单校验失败。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("URL 格式无效: {0}")]
    Invalid(String),

    #[error("不允许的协议: {0}")]
    Scheme(String),

    #[error("主机不在白名单内: {0}")]
    HostNotAllowed(String),

    #[error("不允许访问内网地址: {0}")]
    PrivateHost(String),
}

/// 单次探测的错误；由 worker 捕获、计数并写入审计记录，从不向上扩散。
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0} not configured")]
    MissingCapability(&'static str),

    #[error("missing access token")]
    MissingToken,

    #[error("获取 access_token 失败: {0}")]
    Token(String),

    #[error("上游地址校验失败: {0}")]
    UrlRejected(#[from] UrlValidationError),

    #[error("{0}")]
    Upstream(#[from] UpstreamError),

    #[error("{platform} oauth probe status={status} body={body}")]
    Status {
        platform: &'static str,
        status: u16,
        body: String,
    },

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("构建探测请求失败: {0}")]
    Payload(String),
}

impl ProbeError {
    /// 上游返回了响应时的 HTTP 状态码。
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 用量快照同步错误。
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("不支持的账号类型: {platform} {account_type}")]
    Unsupported {
        platform: &'static str,
        account_type: &'static str,
    },

    #[error("missing access token")]
    MissingToken,

    #[error("用量接口返回 {status}: {body}")]
    Status { status: u16, body: String },

    #[error("解析用量响应失败: {0}")]
    Decode(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 按字符截断错误文本（审计记录与日志共用）。
pub fn truncate_message(msg: &str, max_chars: usize) -> String {
    let msg = msg.trim();
    if msg.chars().count() <= max_chars {
        return msg.to_string();
    }
    msg.chars().take(max_chars).collect()
}
