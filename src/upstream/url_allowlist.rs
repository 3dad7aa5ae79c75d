use crate::config::UrlAllowlistConfig;
use crate::error::UrlValidationError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// 上游地址校验：返回规范化（无尾部 `/`）的地址，拒绝时返回原因。
pub trait UpstreamUrlValidator: Send + Sync {
    fn validate(&self, raw_url: &str) -> Result<String, UrlValidationError>;
}

/// 按配置执行的上游地址白名单。
///
/// - 未启用：只校验格式；`allow_insecure_http` 为真时才允许 http。
/// - 启用：必须是 https，主机须命中白名单（支持 `*.example.com` 通配），
///   内网/回环/链路本地地址与 localhost 默认拒绝。
#[derive(Debug, Clone, Default)]
pub struct UrlAllowlist {
    enabled: bool,
    hosts: Vec<String>,
    allow_private: bool,
    allow_insecure_http: bool,
}

impl UrlAllowlist {
    pub fn new(cfg: &UrlAllowlistConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            hosts: cfg
                .upstream_hosts
                .iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            allow_private: cfg.allow_private_hosts,
            allow_insecure_http: cfg.allow_insecure_http,
        }
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.hosts.iter().any(|allowed| match allowed.strip_prefix("*.") {
            Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{suffix}")),
            None => host == allowed,
        })
    }
}

impl UpstreamUrlValidator for UrlAllowlist {
    fn validate(&self, raw_url: &str) -> Result<String, UrlValidationError> {
        let trimmed = raw_url.trim();
        if trimmed.is_empty() {
            return Err(UrlValidationError::Invalid("empty url".to_string()));
        }
        let url = Url::parse(trimmed).map_err(|e| UrlValidationError::Invalid(e.to_string()))?;

        match url.scheme() {
            "https" => {}
            "http" if !self.enabled && self.allow_insecure_http => {}
            other => return Err(UrlValidationError::Scheme(other.to_string())),
        }

        let host = match url.host() {
            Some(h) => h,
            None => return Err(UrlValidationError::Invalid(format!("缺少主机: {trimmed}"))),
        };

        if self.enabled {
            let host_str = host.to_string().to_lowercase();
            if !self.allow_private && is_private_host(&host) {
                return Err(UrlValidationError::PrivateHost(host_str));
            }
            if !self.host_allowed(&host_str) {
                return Err(UrlValidationError::HostNotAllowed(host_str));
            }
        }

        Ok(url.as_str().trim_end_matches('/').to_string())
    }
}

fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(d) => {
            let d = d.trim_end_matches('.').to_lowercase();
            d == "localhost" || d.ends_with(".localhost")
        }
        Host::Ipv4(ip) => is_private_ip(IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_private_ip(IpAddr::V6(*ip)),
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(v4);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 唯一本地地址
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 链路本地地址
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(enabled: bool, hosts: &[&str]) -> UrlAllowlist {
        UrlAllowlist::new(&UrlAllowlistConfig {
            enabled,
            upstream_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            allow_private_hosts: false,
            allow_insecure_http: false,
        })
    }

    #[test]
    fn disabled_only_checks_format() {
        let v = allowlist(false, &[]);
        assert_eq!(
            v.validate(" https://generativelanguage.googleapis.com/ ").unwrap(),
            "https://generativelanguage.googleapis.com"
        );
        assert!(matches!(
            v.validate("http://example.com"),
            Err(UrlValidationError::Scheme(_))
        ));
        assert!(matches!(v.validate("not a url"), Err(UrlValidationError::Invalid(_))));
        assert!(matches!(v.validate(""), Err(UrlValidationError::Invalid(_))));
    }

    #[test]
    fn disabled_allows_http_when_configured() {
        let v = UrlAllowlist::new(&UrlAllowlistConfig {
            allow_insecure_http: true,
            ..Default::default()
        });
        assert_eq!(
            v.validate("http://127.0.0.1:8080/").unwrap(),
            "http://127.0.0.1:8080"
        );
    }

    #[test]
    fn enabled_requires_listed_host() {
        let v = allowlist(true, &["cloudcode-pa.googleapis.com", "*.example.com"]);
        assert!(v.validate("https://cloudcode-pa.googleapis.com").is_ok());
        assert!(v.validate("https://api.example.com/v1").is_ok());
        assert_eq!(
            v.validate("https://example.com"),
            Err(UrlValidationError::HostNotAllowed("example.com".to_string()))
        );
        assert_eq!(
            v.validate("https://evil.test"),
            Err(UrlValidationError::HostNotAllowed("evil.test".to_string()))
        );
    }

    #[test]
    fn enabled_rejects_http_even_if_insecure_allowed() {
        let v = UrlAllowlist::new(&UrlAllowlistConfig {
            enabled: true,
            upstream_hosts: vec!["example.com".to_string()],
            allow_private_hosts: false,
            allow_insecure_http: true,
        });
        assert!(matches!(
            v.validate("http://example.com"),
            Err(UrlValidationError::Scheme(_))
        ));
    }

    #[test]
    fn enabled_rejects_private_hosts() {
        let v = allowlist(true, &["localhost", "10.0.0.1", "[::1]"]);
        assert!(matches!(
            v.validate("https://localhost"),
            Err(UrlValidationError::PrivateHost(_))
        ));
        assert!(matches!(
            v.validate("https://10.0.0.1"),
            Err(UrlValidationError::PrivateHost(_))
        ));
        assert!(matches!(
            v.validate("https://[::1]"),
            Err(UrlValidationError::PrivateHost(_))
        ));

        let open = UrlAllowlist::new(&UrlAllowlistConfig {
            enabled: true,
            upstream_hosts: vec!["10.0.0.1".to_string()],
            allow_private_hosts: true,
            allow_insecure_http: false,
        });
        assert!(open.validate("https://10.0.0.1").is_ok());
    }
}
