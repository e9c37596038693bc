//! 凭证生命周期
//!
//! - `store`: 凭证落盘与读取
//! - `manager`: 在用凭证的持有与单飞续期

pub mod manager;
pub mod store;

pub use manager::{with_auth_retry, CredentialManager};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
