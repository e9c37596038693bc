//! 错误类型定义
//!
//! 整个代理共用的一套错误分类。调用方只根据分类决定恢复策略：
//! - `AuthFailure` 仅在启动时致命，运行期间记录日志后继续
//! - `Unauthorized` 触发一次凭证续期并重试，第二次出现视为单元失败
//! - `Transient` 跳过当前周期受影响的操作，从不升级为进程级失败
//! - `MalformedResponse` 在抓取层等同于 `Transient`，在单条价格的
//!   新鲜度判定中等同于 invalid

use thiserror::Error;

/// 代理错误分类
#[derive(Debug, Error)]
pub enum AgentError {
    /// 身份提供方拒绝了认证或续期请求
    #[error("认证失败: {0}")]
    AuthFailure(String),

    /// 下游服务报告凭证已失效（HTTP 401/403 语义）
    #[error("凭证已失效，需要续期")]
    Unauthorized,

    /// 网络错误或非认证类 HTTP 错误
    #[error("临时失败: {0}")]
    Transient(String),

    /// 服务响应缺少必需字段
    #[error("响应格式异常: {0}")]
    MalformedResponse(String),

    /// 凭证持久化读写失败
    #[error("存储错误: {0}")]
    Storage(String),

    /// 配置加载或校验失败
    #[error("配置错误: {0}")]
    Config(String),
}

impl AgentError {
    /// 判断是否属于可在单次续期后重试的认证类错误
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AgentError::Unauthorized)
    }
}
