use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CHECK_INTERVAL_MINUTES: i64 = 30;
const FALLBACK_CHECK_INTERVAL_MINUTES: u64 = 5;
const DEFAULT_IDLE_THRESHOLD_MINUTES: i64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: i64 = 20;
const DEFAULT_MAX_CONCURRENCY: i64 = 2;
const DEFAULT_USAGE_SYNC_MIN_INTERVAL_SECONDS: i64 = 60;

/// 后台探测配置。字段保留原始数值，读取时再按规则归一化。
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub check_interval_minutes: i64,
    pub idle_threshold_minutes: i64,
    pub request_timeout_seconds: i64,
    pub max_concurrency: i64,
    pub max_accounts_per_cycle: i64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_minutes: DEFAULT_CHECK_INTERVAL_MINUTES,
            idle_threshold_minutes: DEFAULT_IDLE_THRESHOLD_MINUTES,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_accounts_per_cycle: 0,
        }
    }
}

impl ProbeConfig {
    /// 探测周期：不足 1 分钟视为误配置，回退到 5 分钟。
    pub fn check_interval(&self) -> Duration {
        if self.check_interval_minutes < 1 {
            return Duration::from_secs(FALLBACK_CHECK_INTERVAL_MINUTES * 60);
        }
        Duration::from_secs(self.check_interval_minutes as u64 * 60)
    }

    /// 空闲阈值；`<= 0` 表示不过滤（所有账号都探测）。
    pub fn idle_threshold(&self) -> Option<chrono::Duration> {
        if self.idle_threshold_minutes <= 0 {
            return None;
        }
        Some(chrono::Duration::minutes(self.idle_threshold_minutes))
    }

    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_seconds <= 0 {
            return Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS as u64);
        }
        Duration::from_secs(self.request_timeout_seconds as u64)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.max(1) as usize
    }

    pub fn max_accounts_per_cycle(&self) -> Option<usize> {
        if self.max_accounts_per_cycle > 0 {
            Some(self.max_accounts_per_cycle as usize)
        } else {
            None
        }
    }
}

/// 上游地址白名单策略。
#[derive(Debug, Clone, Default)]
pub struct UrlAllowlistConfig {
    pub enabled: bool,
    pub upstream_hosts: Vec<String>,
    pub allow_private_hosts: bool,
    pub allow_insecure_http: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub probe: ProbeConfig,
    pub url_allowlist: UrlAllowlistConfig,
    pub usage_sync_min_interval_seconds: i64,
    pub data_dir: String,
    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "OAUTH_PROBE_ENABLED")]
    oauth_probe_enabled: Option<bool>,
    #[serde(alias = "OAUTH_PROBE_CHECK_INTERVAL_MINUTES")]
    oauth_probe_check_interval_minutes: Option<i64>,
    #[serde(alias = "OAUTH_PROBE_IDLE_THRESHOLD_MINUTES")]
    oauth_probe_idle_threshold_minutes: Option<i64>,
    #[serde(alias = "OAUTH_PROBE_REQUEST_TIMEOUT_SECONDS")]
    oauth_probe_request_timeout_seconds: Option<i64>,
    #[serde(alias = "OAUTH_PROBE_MAX_CONCURRENCY")]
    oauth_probe_max_concurrency: Option<i64>,
    #[serde(alias = "OAUTH_PROBE_MAX_ACCOUNTS_PER_CYCLE")]
    oauth_probe_max_accounts_per_cycle: Option<i64>,

    #[serde(alias = "USAGE_SYNC_MIN_INTERVAL_SECONDS")]
    usage_sync_min_interval_seconds: Option<i64>,

    #[serde(alias = "URL_ALLOWLIST_ENABLED")]
    url_allowlist_enabled: Option<bool>,
    #[serde(alias = "URL_ALLOWLIST_UPSTREAM_HOSTS")]
    url_allowlist_upstream_hosts: Option<String>,
    #[serde(alias = "URL_ALLOWLIST_ALLOW_PRIVATE_HOSTS")]
    url_allowlist_allow_private_hosts: Option<bool>,
    #[serde(alias = "URL_ALLOWLIST_ALLOW_INSECURE_HTTP")]
    url_allowlist_allow_insecure_http: Option<bool>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        let defaults = ProbeConfig::default();
        Self {
            probe: ProbeConfig {
                enabled: raw.oauth_probe_enabled.unwrap_or(defaults.enabled),
                check_interval_minutes: raw
                    .oauth_probe_check_interval_minutes
                    .unwrap_or(defaults.check_interval_minutes),
                idle_threshold_minutes: raw
                    .oauth_probe_idle_threshold_minutes
                    .unwrap_or(defaults.idle_threshold_minutes),
                request_timeout_seconds: raw
                    .oauth_probe_request_timeout_seconds
                    .unwrap_or(defaults.request_timeout_seconds),
                max_concurrency: raw
                    .oauth_probe_max_concurrency
                    .unwrap_or(defaults.max_concurrency),
                max_accounts_per_cycle: raw
                    .oauth_probe_max_accounts_per_cycle
                    .unwrap_or(defaults.max_accounts_per_cycle),
            },
            url_allowlist: UrlAllowlistConfig {
                enabled: raw.url_allowlist_enabled.unwrap_or(false),
                upstream_hosts: parse_host_list(raw.url_allowlist_upstream_hosts.as_deref()),
                allow_private_hosts: raw.url_allowlist_allow_private_hosts.unwrap_or(false),
                allow_insecure_http: raw.url_allowlist_allow_insecure_http.unwrap_or(false),
            },
            usage_sync_min_interval_seconds: raw
                .usage_sync_min_interval_seconds
                .unwrap_or(DEFAULT_USAGE_SYNC_MIN_INTERVAL_SECONDS),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    /// 实时流量触发用量同步时的节流间隔；`<= 0` 表示不节流。
    pub fn usage_sync_min_interval(&self) -> Duration {
        if self.usage_sync_min_interval_seconds <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(self.usage_sync_min_interval_seconds as u64)
    }
}

fn parse_host_list(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split(',')
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已由进程环境显式设置的变量优先，.env 只补缺。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let raw = line[eq_idx + 1..].trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
