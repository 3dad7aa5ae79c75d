use anyhow::Context;
use oauth_probe::account::{AccountStore, FileAccountStore, Platform};
use oauth_probe::config::Config;
use oauth_probe::probe::{ClaudeProbe, CodexProbe, GeminiProbe, ProbeService};
use oauth_probe::upstream::{
    CredentialTokenProvider, HttpUpstream, ReqwestUpstream, TokenProvider, UrlAllowlist,
};
use oauth_probe::usage::UsageSnapshotSync;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load();

    init_tracing(&cfg);

    let file_store = FileAccountStore::new(&cfg.data_dir);
    file_store
        .load()
        .await
        .with_context(|| format!("加载 {} 失败", file_store.file_path().display()))?;
    tracing::info!("已加载账号 {} 个", file_store.count().await);
    let store: Arc<dyn AccountStore> = Arc::new(file_store);

    let upstream: Arc<dyn HttpUpstream> = Arc::new(ReqwestUpstream::new(cfg.log_level()));
    let tokens: Arc<dyn TokenProvider> = Arc::new(CredentialTokenProvider);
    let validator = Arc::new(UrlAllowlist::new(&cfg.url_allowlist));

    let usage = Arc::new(
        UsageSnapshotSync::new(store.clone(), upstream.clone())
            .with_token_provider(Platform::OpenAi, tokens.clone())
            .with_token_provider(Platform::Gemini, tokens.clone())
            .with_token_provider(Platform::Anthropic, tokens.clone())
            .with_min_interval(cfg.usage_sync_min_interval()),
    );

    let service = Arc::new(
        ProbeService::new(store, cfg.probe.clone())
            .with_executor(
                Platform::OpenAi,
                Arc::new(CodexProbe::new(
                    upstream.clone(),
                    Some(tokens.clone()),
                    usage.clone(),
                )),
            )
            .with_executor(
                Platform::Gemini,
                Arc::new(GeminiProbe::new(
                    upstream.clone(),
                    Some(tokens.clone()),
                    validator,
                    Some(usage.clone()),
                )),
            )
            .with_executor(
                Platform::Anthropic,
                Arc::new(ClaudeProbe::new(upstream, Some(tokens), Some(usage))),
            ),
    );

    service.start();
    shutdown_signal().await;
    service.stop().await;

    Ok(())
}

fn init_tracing(cfg: &Config) {
    // 依赖库日志默认只保留 warn；本项目自身至少 info，避免 RUST_LOG=warn 把探测汇总过滤掉。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,oauth_probe=info")
    } else if env.contains("oauth_probe") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},oauth_probe=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();

    if cfg.log_level().backend_enabled() {
        tracing::info!("上游请求日志已开启：DEBUG={}", cfg.debug);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，等待本轮探测结束...");
}
