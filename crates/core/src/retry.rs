//! 有界重试策略
//!
//! 抓取、提交和统计查询统一使用同一个策略对象：遇到 Unauthorized
//! 时最多再给一次机会（续期后重试），避免服务端异常时的续期风暴。

/// 有界重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数上限（含首次）
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// 标准策略：首次失败后允许一次续期重试
    pub fn unauthorized_once() -> Self {
        Self { max_attempts: 2 }
    }

    /// 在第 `attempt` 次（从 1 计）失败后是否还允许重试
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unauthorized_once()
    }
}
