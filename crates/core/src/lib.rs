//! Storkwatch Core Crate
//!
//! 包含纯数据类型和无网络依赖的独立模块。
//!
//! ## 模块结构
//! - `errors`: 错误类型定义
//! - `config`: 配置管理（config.json 加载与默认值）
//! - `credential`: 凭证数据模型
//! - `attestation`: 签名价格数据与新鲜度策略
//! - `stats`: 服务端计数器快照与对账
//! - `retry`: 有界重试策略

pub mod attestation;
pub mod config;
pub mod credential;
pub mod errors;
pub mod retry;
pub mod stats;

// 重新导出常用类型
pub use attestation::{Attestation, FreshnessPolicy, ValidationVerdict};
pub use credential::Credential;
pub use errors::AgentError;
pub use retry::RetryPolicy;
pub use stats::{reconcile, CycleOutcome, RunningTotals, StatsSnapshot};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
