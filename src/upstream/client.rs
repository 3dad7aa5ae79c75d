use crate::error::UpstreamError;
use crate::logging::{self, LogLevel};
use crate::upstream::{HttpUpstream, UpstreamOptions, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;

/// 非 200 响应最多读取的响应体字节数（只用于错误信息）。
const MAX_ERROR_BODY_BYTES: usize = 4096;
/// 按代理地址缓存的客户端数量上限。
const MAX_CACHED_CLIENTS: u64 = 256;
/// 直连（无代理）客户端在缓存中的键。
const DIRECT_KEY: &str = "";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// 单个请求（含读取响应体）的上限；探测请求另有更短的超时。
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// 基于 reqwest 的默认传输层：每个代理地址复用一个连接池。
///
/// TLS 指纹模拟不在这里实现；账号开启时只记录 debug 日志。
#[derive(Clone)]
pub struct ReqwestUpstream {
    clients: Cache<String, reqwest::Client>,
    log_level: LogLevel,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ReqwestUpstream {
    pub fn new(log_level: LogLevel) -> Self {
        Self {
            clients: Cache::new(MAX_CACHED_CLIENTS),
            log_level,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    async fn client_for(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, UpstreamError> {
        let key = proxy_url.unwrap_or(DIRECT_KEY).to_string();
        if let Some(c) = self.clients.get(&key).await {
            return Ok(c);
        }

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout);
        // 代理按账号配置，不读取进程环境里的 HTTP(S)_PROXY。
        builder = match proxy_url {
            Some(p) => {
                let proxy =
                    reqwest::Proxy::all(p).map_err(|e| UpstreamError::Proxy(e.to_string()))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };
        let client = builder.build()?;
        self.clients.insert(key, client.clone()).await;
        Ok(client)
    }
}

#[async_trait]
impl HttpUpstream for ReqwestUpstream {
    async fn send(
        &self,
        req: UpstreamRequest,
        opts: UpstreamOptions,
    ) -> Result<UpstreamResponse, UpstreamError> {
        if opts.tls_fingerprint {
            tracing::debug!(
                account_id = opts.account_id,
                "账号开启了 TLS 指纹，但默认传输层不支持，按普通 TLS 发送"
            );
        }

        let client = self.client_for(opts.proxy_url.as_deref()).await?;
        if self.log_level.backend_enabled() {
            logging::backend_request(
                self.log_level,
                opts.account_id,
                req.method.as_str(),
                &req.url,
                &req.headers,
                &req.body,
            );
        }

        let stream = req.stream;
        let start = std::time::Instant::now();
        let resp = client
            .request(req.method, req.url)
            .headers(req.headers)
            .body(req.body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        // 成功的流式响应无需读完：配额信息只在响应头里；失败时只保留有限字节用于报错。
        let body = if stream && status == 200 {
            Vec::new()
        } else if status == 200 {
            resp.bytes().await?.to_vec()
        } else {
            read_limited(resp, MAX_ERROR_BODY_BYTES).await?
        };

        if self.log_level.backend_enabled() {
            logging::backend_response(
                self.log_level,
                opts.account_id,
                status,
                start.elapsed(),
                &body,
            );
        }

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// 按块读取响应体，凑满 `limit` 字节即停止，剩余部分不再读取。
async fn read_limited(mut resp: reqwest::Response, limit: usize) -> Result<Vec<u8>, reqwest::Error> {
    let mut out = Vec::new();
    while out.len() < limit {
        let Some(chunk) = resp.chunk().await? else {
            break;
        };
        let take = chunk.len().min(limit - out.len());
        out.extend_from_slice(&chunk[..take]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 本地一次性 HTTP 服务：读完请求头后按给定状态码返回 `body_len` 字节的响应体。
    async fn serve_once(status: u16, body_len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 {status} X\r\ncontent-length: {body_len}\r\nx-codex-primary-used-percent: 12\r\n\r\n"
            );
            let _ = sock.write_all(head.as_bytes()).await;
            let _ = sock.write_all(&vec![b'e'; body_len]).await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn error_body_is_capped_without_reading_everything() {
        let url = serve_once(502, 1 << 20).await;
        let resp = ReqwestUpstream::new(LogLevel::Off)
            .send(UpstreamRequest::get(url), UpstreamOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status, 502);
        assert_eq!(resp.body.len(), MAX_ERROR_BODY_BYTES);
        assert_eq!(resp.headers["x-codex-primary-used-percent"], "12");
    }

    #[tokio::test]
    async fn successful_stream_skips_body_but_plain_reads_it() {
        let url = serve_once(200, 64).await;
        let resp = ReqwestUpstream::new(LogLevel::Off)
            .send(UpstreamRequest::get(url).streaming(), UpstreamOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.body.is_empty());

        let url = serve_once(200, 64).await;
        let resp = ReqwestUpstream::new(LogLevel::Off)
            .send(UpstreamRequest::get(url), UpstreamOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.body.len(), 64);
    }

    #[tokio::test]
    async fn stalled_upstream_hits_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // 接受连接但从不响应
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let upstream = ReqwestUpstream::new(LogLevel::Off)
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = upstream
            .send(
                UpstreamRequest::get(format!("http://{addr}/")),
                UpstreamOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(ref e) if e.is_timeout()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
