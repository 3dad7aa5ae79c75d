//! 测试替身：内存账号存储与可编排的上游传输层。

use crate::account::{Account, AccountStore, Extra};
use crate::error::{StoreError, UpstreamError};
use crate::upstream::{HttpUpstream, UpstreamOptions, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub fn account(value: serde_json::Value) -> Account {
    serde_json::from_value(value).unwrap()
}

pub fn response(status: u16, body: &str) -> UpstreamResponse {
    UpstreamResponse {
        status,
        headers: HeaderMap::new(),
        body: body.as_bytes().to_vec(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<Vec<Account>>,
    extra_updates: Mutex<Vec<(i64, Extra)>>,
    rate_limits: Mutex<Vec<(i64, DateTime<Utc>)>>,
    fail_list: AtomicBool,
    pub list_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            ..Default::default()
        }
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn extra_of(&self, account_id: i64) -> Extra {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == account_id)
            .map(|a| a.extra.clone())
            .unwrap_or_default()
    }

    pub fn extra_updates(&self) -> Vec<(i64, Extra)> {
        self.extra_updates.lock().unwrap().clone()
    }

    pub fn rate_limits(&self) -> Vec<(i64, DateTime<Utc>)> {
        self.rate_limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn list_active(&self) -> Result<Vec<Account>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StoreError::backend("database unavailable"));
        }
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.is_active())
            .cloned()
            .collect())
    }

    async fn update_extra(&self, account_id: i64, updates: Extra) -> Result<(), StoreError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .iter_mut()
            .find(|a| a.id == account_id)
            .ok_or(StoreError::NotFound(account_id))?;
        for (k, v) in updates.clone() {
            account.extra.insert(k, v);
        }
        self.extra_updates.lock().unwrap().push((account_id, updates));
        Ok(())
    }

    async fn set_rate_limited(
        &self,
        account_id: i64,
        reset_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.rate_limits.lock().unwrap().push((account_id, reset_at));
        Ok(())
    }
}

type Handler = dyn Fn(&UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> + Send + Sync;
type Delay = dyn Fn(&UpstreamRequest) -> Duration + Send + Sync;

/// 可编排的传输层：记录请求、统计并发峰值，按 handler 返回响应。
pub struct ScriptedUpstream {
    handler: Box<Handler>,
    delay: Box<Delay>,
    requests: Mutex<Vec<UpstreamRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: Box::new(|_| Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn ok() -> Self {
        Self::new(|_| Ok(response(200, "")))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Box::new(move |_| delay);
        self
    }

    /// 只对 URL 包含 `fragment` 的请求延迟。
    pub fn with_delay_for(mut self, fragment: &'static str, delay: Duration) -> Self {
        self.delay = Box::new(move |req| {
            if req.url.contains(fragment) {
                delay
            } else {
                Duration::ZERO
            }
        });
        self
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpUpstream for ScriptedUpstream {
    async fn send(
        &self,
        req: UpstreamRequest,
        _opts: UpstreamOptions,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.requests.lock().unwrap().push(req.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = (self.delay)(&req);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.handler)(&req)
    }
}
