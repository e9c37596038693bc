//! 身份提供方客户端
//!
//! 封装 Cognito 用户池的令牌交换：密码初始认证与刷新令牌续期，
//! 两者都产出一个 Credential。所有拒绝（密码错误、账户锁定、网络
//! 失败）统一以 `AuthFailure` 上抛并携带区分信息，调用方只区分
//! 成败，不区分子类型。

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use storkwatch_core::config::CognitoConfig;
use storkwatch_core::{AgentError, Credential};

const AMZ_JSON: &str = "application/x-amz-json-1.1";
const INITIATE_AUTH_TARGET: &str = "AWSCognitoIdentityProviderService.InitiateAuth";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 身份交换接口
///
/// CredentialManager 通过此接口完成认证与续期，测试时可替换为桩实现。
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    /// 密码初始认证
    async fn authenticate(&self, username: &str, password: &str)
        -> Result<Credential, AgentError>;

    /// 刷新令牌续期
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AgentError>;
}

/// Cognito 客户端
pub struct CognitoClient {
    endpoint: String,
    client_id: String,
    http: reqwest::Client,
}

/// InitiateAuth 响应中的令牌块
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    access_token: String,
    id_token: String,
    /// 刷新交换的响应通常不回传刷新令牌
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    authentication_result: Option<AuthenticationResult>,
}

impl CognitoClient {
    pub fn new(config: &CognitoConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::AuthFailure(format!("创建 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            endpoint: config.endpoint(),
            client_id: config.client_id.clone(),
            http,
        })
    }

    /// 发起一次 InitiateAuth 交换并解析令牌
    async fn initiate_auth(&self, body: serde_json::Value) -> Result<Credential, AgentError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", AMZ_JSON)
            .header("X-Amz-Target", INITIATE_AUTH_TARGET)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::AuthFailure(format!("身份提供方请求失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::AuthFailure(format!(
                "身份提供方拒绝请求 (HTTP {status}): {detail}"
            )));
        }

        let parsed: InitiateAuthResponse = response
            .json()
            .await
            .map_err(|e| AgentError::AuthFailure(format!("解析身份提供方响应失败: {e}")))?;

        let result = parsed.authentication_result.ok_or_else(|| {
            AgentError::AuthFailure("响应缺少 AuthenticationResult（可能需要质询流程）".to_string())
        })?;

        Ok(Credential::from_exchange(
            result.access_token,
            result.id_token,
            result.refresh_token,
            result.expires_in,
            Utc::now(),
        ))
    }
}

#[async_trait]
impl IdentityExchange for CognitoClient {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Credential, AgentError> {
        tracing::debug!(username, "[CognitoClient] 发起密码认证");
        self.initiate_auth(json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": self.client_id,
            "AuthParameters": {
                "USERNAME": username,
                "PASSWORD": password,
            }
        }))
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AgentError> {
        tracing::debug!("[CognitoClient] 发起刷新令牌续期");
        self.initiate_auth(json!({
            "AuthFlow": "REFRESH_TOKEN_AUTH",
            "ClientId": self.client_id,
            "AuthParameters": {
                "REFRESH_TOKEN": refresh_token,
            }
        }))
        .await
    }
}
