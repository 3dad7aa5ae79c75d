use crate::account::Account;
use async_trait::async_trait;

/// access_token 提供者：刷新逻辑由外部实现，这里只消费结果。
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_access_token(&self, account: &Account) -> Result<String, String>;
}

/// 直接读取账号凭证中的 access_token（不做刷新）。
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialTokenProvider;

#[async_trait]
impl TokenProvider for CredentialTokenProvider {
    async fn get_access_token(&self, account: &Account) -> Result<String, String> {
        let token = account.credential("access_token");
        if token.is_empty() {
            return Err(format!("账号 {} 缺少 access_token", account.id));
        }
        Ok(token)
    }
}

/// 解析账号的 access_token：优先使用提供者，失败或为空时回退到凭证中的 `access_token`。
pub async fn resolve_access_token(
    provider: Option<&dyn TokenProvider>,
    account: &Account,
) -> Option<String> {
    if let Some(p) = provider {
        match p.get_access_token(account).await {
            Ok(t) if !t.trim().is_empty() => return Some(t.trim().to_string()),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(account_id = account.id, "获取 access_token 失败，回退到凭证: {e}");
            }
        }
    }
    let token = account.credential("access_token");
    (!token.is_empty()).then_some(token)
}
