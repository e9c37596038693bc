//! 签名价格数据与新鲜度策略
//!
//! 一次抓取得到一批签名价格（attestation），每条以 msg_hash 作为验证键。
//! 新鲜度判定是单条价格与墙钟时间的纯函数，不参考任何跨条状态。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 签名价格 - 抓取后不可变，生命周期为一个周期
#[derive(Debug, Clone, PartialEq)]
pub struct Attestation {
    /// 资产标识（响应映射中的键）
    pub asset_id: String,
    /// 验证键，缺失时该条直接判为 invalid
    pub msg_hash: Option<String>,
    /// 价格原值（服务端可能返回字符串或数字，保留原样）
    pub price: Option<Value>,
    /// 签名时间戳（纳秒 Unix 时间）
    pub timestamp_nanos: Option<i64>,
    /// 原始载荷，便于排查
    pub raw: Value,
}

impl Attestation {
    /// 从签名价格响应中的单个条目解析
    ///
    /// 条目形如 `{"price": ..., "timestamped_signature": {"msg_hash": ..., "timestamp": ...}}`。
    /// 任何字段缺失都不报错，留给新鲜度判定处理。
    pub fn from_entry(asset_id: &str, entry: &Value) -> Self {
        let signature = entry.get("timestamped_signature");
        let msg_hash = signature
            .and_then(|s| s.get("msg_hash"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let timestamp_nanos = signature
            .and_then(|s| s.get("timestamp"))
            .and_then(|v| v.as_i64());
        let price = entry.get("price").filter(|v| !v.is_null()).cloned();

        Self {
            asset_id: asset_id.to_string(),
            msg_hash,
            price,
            timestamp_nanos,
            raw: entry.clone(),
        }
    }

    /// 签名时间（纳秒时间戳转 UTC）
    pub fn produced_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_nanos.map(DateTime::from_timestamp_nanos)
    }
}

/// 验证结论 - 即时消耗，提交后丢弃
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationVerdict {
    /// 验证键
    pub msg_hash: String,
    /// 本地判定结果
    pub valid: bool,
}

/// 新鲜度策略
///
/// 必需字段（msg_hash、price、timestamp）缺失，或签名时间距今超过
/// `max_age`，判为 invalid；恰好等于 `max_age` 仍为 valid。
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    /// 允许的最大签名年龄
    pub max_age: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::minutes(60),
        }
    }
}

impl FreshnessPolicy {
    /// 判定单条签名价格的有效性
    pub fn evaluate(&self, attestation: &Attestation, now: DateTime<Utc>) -> bool {
        if attestation.msg_hash.is_none() || attestation.price.is_none() {
            return false;
        }
        let Some(produced_at) = attestation.produced_at() else {
            return false;
        };
        now - produced_at <= self.max_age
    }
}
