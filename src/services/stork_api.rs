//! 伙伴服务 API 客户端
//!
//! 三个认证接口：抓取签名价格、提交验证结论、查询账户统计。
//! 401/403 统一归类为 `Unauthorized`，其余非 2xx 与网络错误归类
//! 为 `Transient`，由调用方决定续期重试还是跳过本周期。

use crate::proxy::{ProxyClientFactory, ProxyDescriptor};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use storkwatch_core::{AgentError, Attestation, Credential, StatsSnapshot, ValidationVerdict};

/// 伙伴服务接口
///
/// 分发器与调度器只依赖此接口，HTTP 细节收在 `StorkApiClient`。
#[async_trait]
pub trait ValidationApi: Send + Sync {
    /// 抓取当前一批签名价格
    async fn fetch_signed_prices(
        &self,
        credential: &Credential,
    ) -> Result<Vec<Attestation>, AgentError>;

    /// 通过指定代理提交一条验证结论
    async fn submit_verdict(
        &self,
        verdict: &ValidationVerdict,
        proxy: Option<&ProxyDescriptor>,
        credential: &Credential,
    ) -> Result<(), AgentError>;

    /// 查询账户统计快照
    async fn fetch_user_stats(&self, credential: &Credential)
        -> Result<StatsSnapshot, AgentError>;
}

/// 账户统计响应
#[derive(Debug, Deserialize)]
struct UserResponse {
    data: UserData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct UserData {
    email: Option<String>,
    id: Option<String>,
    referral_code: Option<String>,
    stats: UserStats,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct UserStats {
    valid_count: u64,
    invalid_count: u64,
    last_verified_at: Option<String>,
    referral_usage_count: Option<u64>,
}

/// 伙伴服务 HTTP 客户端
pub struct StorkApiClient {
    base_url: String,
    factory: Arc<ProxyClientFactory>,
}

impl StorkApiClient {
    pub fn new(base_url: String, factory: Arc<ProxyClientFactory>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            factory,
        }
    }

    fn classify_status(status: reqwest::StatusCode, context: &str) -> AgentError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            AgentError::Unauthorized
        } else {
            AgentError::Transient(format!("{context} 返回 HTTP {status}"))
        }
    }

    fn classify_network(e: reqwest::Error, context: &str) -> AgentError {
        AgentError::Transient(format!("{context} 网络失败: {e}"))
    }
}

/// 解析签名价格响应体
///
/// 响应形如 `{"data": {"<asset>": {"price": ..., "timestamped_signature": {...}}}}`，
/// 顶层结构缺失报 `MalformedResponse`，单条字段缺失留给新鲜度判定。
pub fn parse_signed_prices(body: &Value) -> Result<Vec<Attestation>, AgentError> {
    let data = body
        .get("data")
        .and_then(|v| v.as_object())
        .ok_or_else(|| {
            AgentError::MalformedResponse("签名价格响应缺少 data 映射".to_string())
        })?;

    Ok(data
        .iter()
        .map(|(asset_id, entry)| Attestation::from_entry(asset_id, entry))
        .collect())
}

#[async_trait]
impl ValidationApi for StorkApiClient {
    async fn fetch_signed_prices(
        &self,
        credential: &Credential,
    ) -> Result<Vec<Attestation>, AgentError> {
        let url = format!("{}/v1/stork_signed_prices", self.base_url);
        let client = self.factory.client_for(None)?;

        let response = client
            .get(&url)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| Self::classify_network(e, "抓取签名价格"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status, "抓取签名价格"));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::MalformedResponse(format!("签名价格响应非 JSON: {e}")))?;
        let attestations = parse_signed_prices(&body)?;

        tracing::debug!(count = attestations.len(), "[StorkApi] 已抓取签名价格");
        Ok(attestations)
    }

    async fn submit_verdict(
        &self,
        verdict: &ValidationVerdict,
        proxy: Option<&ProxyDescriptor>,
        credential: &Credential,
    ) -> Result<(), AgentError> {
        let url = format!("{}/v1/stork_signed_prices/validations", self.base_url);
        let client = self.factory.client_for(proxy)?;

        let response = client
            .post(&url)
            .bearer_auth(&credential.access_token)
            .json(&json!({
                "msg_hash": verdict.msg_hash,
                "valid": verdict.valid,
            }))
            .send()
            .await
            .map_err(|e| Self::classify_network(e, "提交验证结论"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status, "提交验证结论"));
        }

        Ok(())
    }

    async fn fetch_user_stats(
        &self,
        credential: &Credential,
    ) -> Result<StatsSnapshot, AgentError> {
        let url = format!("{}/v1/me", self.base_url);
        let client = self.factory.client_for(None)?;

        let response = client
            .get(&url)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| Self::classify_network(e, "查询账户统计"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status, "查询账户统计"));
        }

        let parsed: UserResponse = response
            .json()
            .await
            .map_err(|e| AgentError::MalformedResponse(format!("账户统计响应异常: {e}")))?;

        Ok(StatsSnapshot::new(
            parsed.data.stats.valid_count,
            parsed.data.stats.invalid_count,
        ))
    }
}
