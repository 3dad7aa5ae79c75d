//! 账号模型与存储能力。
//!
//! 账号本身由外部系统维护；探测子系统只读取调度相关字段，
//! 并把派生出的配额遥测合并写入 `extra`。

pub mod store;
pub mod types;

pub use store::{AccountStore, FileAccountStore};
pub use types::{Account, AccountStatus, AccountType, Extra, Platform, ProxyRef};
