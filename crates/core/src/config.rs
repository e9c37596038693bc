//! 配置管理
//!
//! 从工作目录的 `config.json` 加载运行配置，字段沿用既有部署的
//! camelCase 命名。文件不存在时写出一份默认模板并报错退出，
//! 由运维填入账号后再启动。

use crate::errors::AgentError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 账号配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// 身份提供方（Cognito 用户池）配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CognitoConfig {
    pub region: String,
    pub client_id: String,
    pub user_pool_id: String,
}

impl CognitoConfig {
    /// 身份提供方的服务地址
    pub fn endpoint(&self) -> String {
        format!("https://cognito-idp.{}.amazonaws.com/", self.region)
    }
}

/// 伙伴服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorkConfig {
    /// API 基地址
    pub base_url: String,
    /// 周期间隔（秒）
    pub interval_seconds: u64,
    /// 凭证保活间隔（分钟）
    pub keepalive_minutes: u64,
}

/// 分发并发配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsConfig {
    /// 单周期的最大并发分发宽度
    pub max_workers: usize,
}

/// 运行配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub auth: AuthConfig,
    pub cognito: CognitoConfig,
    pub stork: StorkConfig,
    pub threads: ThreadsConfig,
    /// 出站代理列表，空列表表示直连
    #[serde(default)]
    pub proxies: Vec<String>,
    /// 凭证持久化文件路径
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

fn default_token_path() -> String {
    "tokens.json".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth: AuthConfig {
                username: "YOUR_EMAIL".to_string(),
                password: "YOUR_PASSWORD".to_string(),
            },
            cognito: CognitoConfig {
                region: "ap-northeast-1".to_string(),
                client_id: "5msns4n49hmg3dftp2tp1t2iuh".to_string(),
                user_pool_id: "ap-northeast-1_M22I44OpC".to_string(),
            },
            stork: StorkConfig {
                base_url: "https://app-api.jp.stork-oracle.network".to_string(),
                interval_seconds: 10,
                keepalive_minutes: 50,
            },
            threads: ThreadsConfig { max_workers: 4 },
            proxies: Vec::new(),
            token_path: default_token_path(),
        }
    }
}

impl AppConfig {
    /// 从指定路径加载配置
    ///
    /// 文件不存在时写出默认模板并返回 `Config` 错误，提示运维填写账号。
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        if !path.exists() {
            let template = serde_json::to_string_pretty(&Self::default())
                .map_err(|e| AgentError::Config(format!("序列化默认配置失败: {e}")))?;
            std::fs::write(path, template)
                .map_err(|e| AgentError::Config(format!("写入默认配置失败: {e}")))?;
            return Err(AgentError::Config(format!(
                "配置文件不存在，已生成模板 {}，请填写账号后重新启动",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("读取配置失败: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| AgentError::Config(format!("解析配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.stork.interval_seconds < 1 {
            return Err(AgentError::Config(
                "stork.intervalSeconds 必须 >= 1".to_string(),
            ));
        }
        if self.stork.keepalive_minutes < 1 {
            return Err(AgentError::Config(
                "stork.keepaliveMinutes 必须 >= 1".to_string(),
            ));
        }
        if self.threads.max_workers < 1 {
            return Err(AgentError::Config(
                "threads.maxWorkers 必须 >= 1".to_string(),
            ));
        }
        if self.auth.username.is_empty() || self.auth.password.is_empty() {
            return Err(AgentError::Config("auth 账号不能为空".to_string()));
        }
        Ok(())
    }
}
