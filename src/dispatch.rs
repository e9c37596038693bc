//! 验证分发器
//!
//! 把一批签名价格切成连续的分发批次，按批次序号轮询分配代理，
//! 在有界宽度内并发地判定并提交每条结论。单元之间互不影响：
//! 一个单元失败既不取消也不阻塞兄弟单元，整批全部落定后才返回。

use crate::credential::CredentialManager;
use crate::proxy::{ProxyDescriptor, ProxyPool};
use crate::services::ValidationApi;
use chrono::Utc;
use std::sync::Arc;
use storkwatch_core::{AgentError, Attestation, FreshnessPolicy, RetryPolicy, ValidationVerdict};

/// 单个分发单元的落定结果
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    /// 验证键（缺失时为空串）
    pub msg_hash: String,
    /// 提交是否成功
    pub succeeded: bool,
    /// 实际发起的提交次数
    pub attempts: u32,
    /// 失败原因
    pub error: Option<String>,
}

/// 验证分发器
pub struct ValidationDispatcher {
    api: Arc<dyn ValidationApi>,
    credentials: Arc<CredentialManager>,
    policy: FreshnessPolicy,
    retry: RetryPolicy,
    max_concurrency: usize,
}

impl ValidationDispatcher {
    pub fn new(
        api: Arc<dyn ValidationApi>,
        credentials: Arc<CredentialManager>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            api,
            credentials,
            policy: FreshnessPolicy::default(),
            retry: RetryPolicy::unauthorized_once(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// 分发一整批签名价格，返回每个单元的落定结果
    ///
    /// 批次 i 使用 `proxies[i mod len]`（空池直连）。批内单元并发，
    /// 批与批之间顺序执行，并发宽度因此不超过 `max_concurrency`。
    pub async fn dispatch(
        &self,
        attestations: &[Attestation],
        proxies: &ProxyPool,
    ) -> Vec<DispatchResult> {
        if attestations.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::with_capacity(attestations.len());
        for (batch_index, batch) in attestations.chunks(self.max_concurrency).enumerate() {
            let proxy = proxies.assign(batch_index);
            let units = batch.iter().map(|att| self.dispatch_unit(att, proxy));
            results.extend(futures::future::join_all(units).await);
        }

        let failed = results.iter().filter(|r| !r.succeeded).count();
        tracing::info!(
            total = results.len(),
            failed,
            "[Dispatcher] 本周期分发完成"
        );
        results
    }

    /// 单个分发单元：判定新鲜度并提交结论，401 时续期重试一次
    async fn dispatch_unit(
        &self,
        attestation: &Attestation,
        proxy: Option<&ProxyDescriptor>,
    ) -> DispatchResult {
        let valid = self.policy.evaluate(attestation, Utc::now());

        // 没有验证键就无从提交，直接落定为失败单元
        let Some(msg_hash) = attestation.msg_hash.clone() else {
            tracing::warn!(
                asset = %attestation.asset_id,
                "[Dispatcher] 签名价格缺少 msg_hash，跳过提交"
            );
            return DispatchResult {
                msg_hash: String::new(),
                succeeded: false,
                attempts: 0,
                error: Some("缺少 msg_hash".to_string()),
            };
        };

        let verdict = ValidationVerdict {
            msg_hash: msg_hash.clone(),
            valid,
        };

        let mut credential = match self.credentials.obtain_valid().await {
            Ok(credential) => credential,
            Err(e) => {
                return DispatchResult {
                    msg_hash,
                    succeeded: false,
                    attempts: 0,
                    error: Some(format!("获取凭证失败: {e}")),
                }
            }
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.api.submit_verdict(&verdict, proxy, &credential).await {
                Ok(()) => {
                    return DispatchResult {
                        msg_hash,
                        succeeded: true,
                        attempts,
                        error: None,
                    }
                }
                Err(AgentError::Unauthorized) if self.retry.allows_retry(attempts) => {
                    match self.credentials.renew_after_rejection(&credential).await {
                        Ok(renewed) => credential = renewed,
                        Err(e) => {
                            return DispatchResult {
                                msg_hash,
                                succeeded: false,
                                attempts,
                                error: Some(format!("续期失败: {e}")),
                            }
                        }
                    }
                }
                Err(e) => {
                    return DispatchResult {
                        msg_hash,
                        succeeded: false,
                        attempts,
                        error: Some(e.to_string()),
                    }
                }
            }
        }
    }
}
