//! 用量快照：各平台原始配额信号的解析、归一化与写回。
//!
//! - `codex`：OpenAI Codex 主/副窗口的分类器（5h / 7d 归属判定）
//! - `claude`：Claude OAuth 用量接口与 Setup Token 会话窗口估算
//! - `gemini`：Gemini `retrieveUserQuota` 配额桶
//! - `sync`：按需同步入口（探测、测试调用、真实流量共用），带单账号节流

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod sync;
pub mod throttle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sync::UsageSnapshotSync;
pub use throttle::{MemorySyncThrottle, SyncThrottle};

pub const CLAUDE_USAGE_SNAPSHOT_KEY: &str = "claude_usage_snapshot";
pub const CLAUDE_USAGE_UPDATED_AT_KEY: &str = "claude_usage_updated_at";
pub const CLAUDE_USAGE_SOURCE_KEY: &str = "claude_usage_source";
pub const GEMINI_USAGE_SNAPSHOT_KEY: &str = "gemini_usage_snapshot";
pub const GEMINI_USAGE_UPDATED_AT_KEY: &str = "gemini_usage_updated_at";
pub const GEMINI_USAGE_SOURCE_KEY: &str = "gemini_usage_source";
pub const CODEX_USAGE_SOURCE_KEY: &str = "codex_usage_source";

/// 快照来源标记，写入 `*_usage_source`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsageSource {
    /// 真实流量之后触发。
    #[default]
    Gateway,
    /// 管理端测试调用。
    Test,
    /// 后台探测。
    Probe,
}

impl UsageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Test => "test",
            Self::Probe => "probe",
        }
    }

    /// 解析外部传入的来源标记；空串或未知值按 gateway 处理。
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "test" => Self::Test,
            "probe" => Self::Probe,
            _ => Self::Gateway,
        }
    }
}

/// 单个用量窗口（Claude 风格）：利用率百分比与绝对重置时间。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub utilization: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remaining_seconds: i64,
}

impl UsageWindow {
    pub fn new(utilization: f64, resets_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let remaining_seconds = resets_at
            .map(|t| (t - now).num_seconds().max(0))
            .unwrap_or(0);
        Self {
            utilization,
            resets_at,
            remaining_seconds,
        }
    }

    /// 已用满且重置时间已知时返回重置时间。
    pub fn saturated_reset_at(&self) -> Option<DateTime<Utc>> {
        if self.utilization >= 100.0 {
            self.resets_at
        } else {
            None
        }
    }
}

/// 归一化后的 Claude 用量快照，整体序列化写入 `claude_usage_snapshot`。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub five_hour: Option<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day: Option<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_sonnet: Option<UsageWindow>,
}

impl UsageInfo {
    /// 冷却时间点：7d 用满优先，其次 5h；都未用满返回 None。
    pub fn rate_limit_reset_at(&self) -> Option<DateTime<Utc>> {
        self.seven_day
            .as_ref()
            .and_then(UsageWindow::saturated_reset_at)
            .or_else(|| {
                self.five_hour
                    .as_ref()
                    .and_then(UsageWindow::saturated_reset_at)
            })
    }
}
