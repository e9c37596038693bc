//! 凭证数据模型
//!
//! 凭证三元组（access/id/refresh token）加上签发时刻推导出的过期时间。
//! `expires_at` 只在令牌交换响应到达时计算一次，之后不再重算。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 凭证 - 由身份提供方签发的令牌三元组
///
/// 由 CredentialManager 独占持有，每次变更都会复制一份写入 CredentialStore。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// 访问令牌（Bearer）
    pub access_token: String,
    /// ID 令牌
    pub id_token: String,
    /// 刷新令牌（刷新交换的响应可能不回传，此时沿用旧值）
    pub refresh_token: Option<String>,
    /// 过期时间，签发时由 `expires_in` 秒数推导
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// 从令牌交换响应构造凭证，`expires_in_secs` 为响应中的有效期秒数
    pub fn from_exchange(
        access_token: String,
        id_token: String,
        refresh_token: Option<String>,
        expires_in_secs: i64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token,
            id_token,
            refresh_token,
            expires_at: issued_at + Duration::seconds(expires_in_secs),
        }
    }

    /// 检查凭证在给定时刻是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 检查凭证是否将在 `margin` 内过期（用于保活预判）
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }
}
