use crate::account::types::{Account, Extra};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// 账号存储能力：由外部实现，本模块只读写其中一小部分字段。
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// 列出所有可调度（active）账号；每轮重新读取，不做缓存。
    async fn list_active(&self) -> Result<Vec<Account>, StoreError>;

    /// 把 `updates` 合并进账号的 extra（同名键覆盖，其余键保留）。
    async fn update_extra(&self, account_id: i64, updates: Extra) -> Result<(), StoreError>;

    /// 写入调度器冷却时间点：到期前跳过该账号。
    async fn set_rate_limited(
        &self,
        account_id: i64,
        reset_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// 基于 JSON 文件（`accounts.json`）的账号存储，供独立运行的进程使用。
#[derive(Debug)]
pub struct FileAccountStore {
    file_path: PathBuf,
    state: RwLock<Vec<Account>>,
}

impl FileAccountStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            file_path: data_dir.as_ref().join("accounts.json"),
            state: RwLock::new(Vec::new()),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub async fn load(&self) -> Result<(), StoreError> {
        ensure_parent_dir(&self.file_path).await?;

        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.state.write().await.clear();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let accounts: Vec<Account> = match serde_json::from_slice(&data) {
            Ok(v) => v,
            Err(e) => {
                self.state.write().await.clear();
                return Err(e.into());
            }
        };

        *self.state.write().await = accounts;
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn get(&self, account_id: i64) -> Option<Account> {
        let state = self.state.read().await;
        state.iter().find(|a| a.id == account_id).cloned()
    }

    /// 在写锁内修改单个账号，并返回修改后的完整快照用于落盘。
    async fn mutate<F>(&self, account_id: i64, f: F) -> Result<Vec<Account>, StoreError>
    where
        F: FnOnce(&mut Account),
    {
        let mut state = self.state.write().await;
        let account = state
            .iter_mut()
            .find(|a| a.id == account_id)
            .ok_or(StoreError::NotFound(account_id))?;
        f(account);
        Ok(state.clone())
    }

    async fn save_snapshot(&self, accounts: &[Account]) -> Result<(), StoreError> {
        ensure_parent_dir(&self.file_path).await?;
        let data = serde_json::to_vec_pretty(accounts)?;
        tokio::fs::write(&self.file_path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn list_active(&self) -> Result<Vec<Account>, StoreError> {
        let state = self.state.read().await;
        Ok(state.iter().filter(|a| a.is_active()).cloned().collect())
    }

    async fn update_extra(&self, account_id: i64, updates: Extra) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let snapshot = self
            .mutate(account_id, |a| {
                for (k, v) in updates {
                    a.extra.insert(k, v);
                }
            })
            .await?;
        self.save_snapshot(&snapshot).await
    }

    async fn set_rate_limited(
        &self,
        account_id: i64,
        reset_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let snapshot = self
            .mutate(account_id, |a| a.rate_limit_reset_at = Some(reset_at))
            .await?;
        self.save_snapshot(&snapshot).await
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}
