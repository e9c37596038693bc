//! 周期调度器
//!
//! 两个互不持锁的定时循环：
//! - 周期循环（默认 10 秒）：抓取 -> 分发 -> 对账，循环体内联执行，
//!   周期之间严格串行，绝不并发两个对账窗口
//! - 保活循环（默认 50 分钟）：只调用一次 obtain_valid，在长期无
//!   价格可验证时也能预先续期
//!
//! 循环体内未就地处理的任何错误都在循环边界捕获并记录，
//! 下一个定时点照常触发；进程关停之前没有终态。

use crate::credential::{with_auth_retry, CredentialManager};
use crate::dispatch::ValidationDispatcher;
use crate::proxy::ProxyPool;
use crate::services::ValidationApi;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use storkwatch_core::{
    reconcile, AgentError, CycleOutcome, RetryPolicy, RunningTotals, StatsSnapshot,
};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 保活续期的提前量（分钟）：凭证剩余有效期低于该值时提前续期
const KEEPALIVE_RENEW_MARGIN_MINUTES: i64 = 10;

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 周期间隔
    pub cycle_interval: Duration,
    /// 凭证保活间隔
    pub keepalive_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(50 * 60),
        }
    }
}

/// 周期调度器
pub struct CycleScheduler {
    api: Arc<dyn ValidationApi>,
    credentials: Arc<CredentialManager>,
    dispatcher: Arc<ValidationDispatcher>,
    proxies: Arc<ProxyPool>,
    retry: RetryPolicy,
    /// 进程级对账基线，只在周期循环内修改
    totals: Mutex<RunningTotals>,
    config: SchedulerConfig,
    cancel_token: CancellationToken,
}

impl CycleScheduler {
    pub fn new(
        api: Arc<dyn ValidationApi>,
        credentials: Arc<CredentialManager>,
        dispatcher: Arc<ValidationDispatcher>,
        proxies: Arc<ProxyPool>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            api,
            credentials,
            dispatcher,
            proxies,
            retry: RetryPolicy::unauthorized_once(),
            totals: Mutex::new(RunningTotals::default()),
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// 启动周期循环与保活循环
    pub fn start(self: Arc<Self>) {
        let scheduler = self.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = scheduler.config.cycle_interval.as_secs(),
                "[CycleScheduler] 启动周期循环"
            );

            let mut ticker = interval(scheduler.config.cycle_interval);
            // 周期超时时顺延下一个定时点，保证周期串行而不是补跑
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scheduler.run_cycle().await {
                            Ok(Some(outcome)) => {
                                tracing::info!(
                                    valid_delta = outcome.valid_delta,
                                    invalid_delta = outcome.invalid_delta,
                                    "[CycleScheduler] 周期完成"
                                );
                            }
                            Ok(None) => {
                                tracing::warn!("[CycleScheduler] 周期完成但缺少统计快照，跳过对账");
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "[CycleScheduler] 周期执行失败");
                            }
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        tracing::info!("[CycleScheduler] 收到取消信号，停止周期循环");
                        break;
                    }
                }
            }
        });

        let scheduler = self.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = scheduler.config.keepalive_interval.as_secs(),
                "[CycleScheduler] 启动凭证保活循环"
            );

            let mut ticker = interval(scheduler.config.keepalive_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval 的第一个 tick 立即触发，启动时已经认证过，跳过
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let margin = chrono::Duration::minutes(KEEPALIVE_RENEW_MARGIN_MINUTES);
                        match scheduler.credentials.keepalive(margin).await {
                            Ok(credential) => {
                                tracing::info!(
                                    expires_at = %credential.expires_at,
                                    "[CycleScheduler] 凭证保活完成"
                                );
                            }
                            Err(e) => {
                                // 运行期间认证失败不致命，下个保活点再试；
                                // 周期循环可继续使用尚未过期的旧凭证
                                tracing::error!(error = %e, "[CycleScheduler] 凭证保活失败");
                            }
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        tracing::info!("[CycleScheduler] 收到取消信号，停止保活循环");
                        break;
                    }
                }
            }
        });
    }

    /// 请求停止两个循环
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// 执行一个完整周期：快照 -> 抓取 -> 分发 -> 快照 -> 对账
    ///
    /// 抓取的临时失败降级为零价格批次，周期照常走到对账；
    /// 统计快照任一侧缺失时跳过对账，返回 Ok(None)。
    pub async fn run_cycle(&self) -> Result<Option<CycleOutcome>, AgentError> {
        let before = self.fetch_stats().await;

        let attestations = match with_auth_retry(self.retry, &self.credentials, |credential| {
            let api = self.api.clone();
            async move { api.fetch_signed_prices(&credential).await }
        })
        .await
        {
            Ok(attestations) => attestations,
            Err(AgentError::Transient(e)) | Err(AgentError::MalformedResponse(e)) => {
                tracing::warn!(error = %e, "[CycleScheduler] 抓取失败，本周期按零价格处理");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(count = attestations.len(), "[CycleScheduler] 开始分发");
        let results = self.dispatcher.dispatch(&attestations, &self.proxies).await;
        let succeeded = results.iter().filter(|r| r.succeeded).count();
        tracing::debug!(
            succeeded,
            failed = results.len() - succeeded,
            "[CycleScheduler] 分发落定"
        );

        let after = self.fetch_stats().await;

        match (before, after) {
            (Some(before), Some(after)) => {
                let outcome = {
                    let mut totals = self.totals.lock();
                    reconcile(&before, &after, &mut totals)
                };
                Ok(Some(outcome))
            }
            _ => Ok(None),
        }
    }

    /// 查询统计快照，失败时只记录不报错
    async fn fetch_stats(&self) -> Option<StatsSnapshot> {
        let result = with_auth_retry(self.retry, &self.credentials, |credential| {
            let api = self.api.clone();
            async move { api.fetch_user_stats(&credential).await }
        })
        .await;

        match result {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, "[CycleScheduler] 查询账户统计失败");
                None
            }
        }
    }
}
