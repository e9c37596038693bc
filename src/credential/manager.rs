//! 凭证管理器
//!
//! 持有唯一的在用凭证，对外只暴露"拿一个当前有效的凭证"。续期是
//! 临界区而非幂等操作（并发的两次续期会互相作废对方的刷新令牌），
//! 因此整个续期过程都在同一把锁内完成：续期期间到达的调用方等待
//! 并共享这一次续期的结果，绝不各自再发起一次。

use crate::credential::store::CredentialStore;
use crate::identity::IdentityExchange;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use storkwatch_core::{AgentError, Credential, RetryPolicy};
use tokio::sync::Mutex;

/// 凭证管理器
pub struct CredentialManager {
    identity: Arc<dyn IdentityExchange>,
    store: Arc<dyn CredentialStore>,
    username: String,
    password: String,
    /// 在用凭证。锁跨越整个续期临界区
    current: Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn new(
        identity: Arc<dyn IdentityExchange>,
        store: Arc<dyn CredentialStore>,
        username: String,
        password: String,
        initial: Option<Credential>,
    ) -> Self {
        Self {
            identity,
            store,
            username,
            password,
            current: Mutex::new(initial),
        }
    }

    /// 获取一个当前有效的凭证，必要时透明续期
    ///
    /// 没有凭证或已过期时触发续期；并发调用方在锁上排队，
    /// 醒来后先复查有效性，避免重复续期。
    pub async fn obtain_valid(&self) -> Result<Credential, AgentError> {
        let mut guard = self.current.lock().await;

        if let Some(credential) = guard.as_ref() {
            if !credential.is_expired(Utc::now()) {
                return Ok(credential.clone());
            }
        }

        self.renew_locked(&mut guard).await
    }

    /// 保活：凭证将在 `margin` 内过期时提前续期
    ///
    /// `obtain_valid` 只在真正过期后才续期；保活定时器走这条路径，
    /// 在长期无价格可验证时也不会撞上过期瞬间。
    pub async fn keepalive(&self, margin: chrono::Duration) -> Result<Credential, AgentError> {
        let mut guard = self.current.lock().await;

        if let Some(credential) = guard.as_ref() {
            if !credential.expires_within(Utc::now(), margin) {
                return Ok(credential.clone());
            }
        }

        self.renew_locked(&mut guard).await
    }

    /// 下游返回 401 后强制续期
    ///
    /// 调用方带着被拒的凭证进来；如果锁内的凭证已经换过
    /// （别的单元先续期了），直接返回现有的新凭证。
    pub async fn renew_after_rejection(
        &self,
        rejected: &Credential,
    ) -> Result<Credential, AgentError> {
        let mut guard = self.current.lock().await;

        if let Some(credential) = guard.as_ref() {
            if credential.access_token != rejected.access_token {
                return Ok(credential.clone());
            }
        }

        self.renew_locked(&mut guard).await
    }

    /// 续期临界区：刷新优先，失败回退密码认证，成功后先持久化再替换
    ///
    /// 调用前提：已持有 `current` 的锁。
    async fn renew_locked(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<Credential>>,
    ) -> Result<Credential, AgentError> {
        let previous = guard.as_ref().cloned();

        let mut renewed = match previous.as_ref().and_then(|c| c.refresh_token.clone()) {
            Some(refresh_token) => match self.identity.refresh(&refresh_token).await {
                Ok(credential) => credential,
                Err(e) => {
                    // 刷新被拒的原因不影响策略，一律回退密码认证
                    tracing::warn!(error = %e, "[CredentialManager] 刷新令牌续期失败，回退密码认证");
                    self.identity
                        .authenticate(&self.username, &self.password)
                        .await?
                }
            },
            None => {
                self.identity
                    .authenticate(&self.username, &self.password)
                    .await?
            }
        };

        // 刷新交换不回传刷新令牌时沿用旧值
        if renewed.refresh_token.is_none() {
            renewed.refresh_token = previous.and_then(|c| c.refresh_token);
        }

        // 释放临界区之前持久化，保证磁盘上的凭证不落后于内存
        if let Err(e) = self.store.save(&renewed) {
            tracing::error!(error = %e, "[CredentialManager] 凭证持久化失败，仅保留在内存中");
        }

        tracing::info!(
            expires_at = %renewed.expires_at,
            "[CredentialManager] 凭证已续期"
        );
        **guard = Some(renewed.clone());
        Ok(renewed)
    }
}

/// 带认证重试的统一调用封装
///
/// 抓取、提交、统计查询都经由此处消费同一个 RetryPolicy：
/// 遇到 Unauthorized 且还有重试额度时续期一次并重跑操作，
/// 第二次 Unauthorized 原样上抛。
pub async fn with_auth_retry<T, F, Fut>(
    policy: RetryPolicy,
    manager: &CredentialManager,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut(Credential) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut credential = manager.obtain_valid().await?;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op(credential.clone()).await {
            Err(AgentError::Unauthorized) if policy.allows_retry(attempt) => {
                credential = manager.renew_after_rejection(&credential).await?;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::store::{FileCredentialStore, MemoryCredentialStore};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    /// 计数型身份交换桩
    #[derive(Default)]
    struct StubIdentity {
        authenticate_calls: AtomicU32,
        refresh_calls: AtomicU32,
        refresh_fails: bool,
        authenticate_fails: bool,
    }

    impl StubIdentity {
        fn issue(prefix: &str, n: u32) -> Credential {
            Credential::from_exchange(
                format!("{prefix}-access-{n}"),
                format!("{prefix}-id-{n}"),
                Some(format!("{prefix}-refresh-{n}")),
                3600,
                Utc::now(),
            )
        }
    }

    #[async_trait]
    impl IdentityExchange for StubIdentity {
        async fn authenticate(
            &self,
            _username: &str,
            _password: &str,
        ) -> Result<Credential, AgentError> {
            let n = self.authenticate_calls.fetch_add(1, Ordering::SeqCst) + 1;
            // 模拟网络往返，让并发调用方真正在锁上重叠
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if self.authenticate_fails {
                return Err(AgentError::AuthFailure("bad password".to_string()));
            }
            Ok(Self::issue("auth", n))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Credential, AgentError> {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if self.refresh_fails {
                return Err(AgentError::AuthFailure("refresh rejected".to_string()));
            }
            Ok(Self::issue("refresh", n))
        }
    }

    fn expired_credential() -> Credential {
        Credential::from_exchange(
            "stale-access".to_string(),
            "stale-id".to_string(),
            Some("stale-refresh".to_string()),
            -60,
            Utc::now(),
        )
    }

    fn valid_credential() -> Credential {
        Credential::from_exchange(
            "valid-access".to_string(),
            "valid-id".to_string(),
            Some("valid-refresh".to_string()),
            3600,
            Utc::now(),
        )
    }

    fn build_manager(
        identity: Arc<StubIdentity>,
        initial: Option<Credential>,
    ) -> (Arc<CredentialManager>, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = Arc::new(CredentialManager::new(
            identity,
            store.clone(),
            "user@example.com".to_string(),
            "secret".to_string(),
            initial,
        ));
        (manager, store)
    }

    #[tokio::test]
    async fn test_valid_credential_needs_no_renewal() {
        let identity = Arc::new(StubIdentity::default());
        let (manager, _) = build_manager(identity.clone(), Some(valid_credential()));

        let credential = manager.obtain_valid().await.unwrap();
        assert_eq!(credential.access_token, "valid-access");
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(identity.authenticate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reloaded_credential_needs_no_renewal() {
        // 模拟进程重启：落盘 -> 重新读取 -> 未过期的凭证直接拿用
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        FileCredentialStore::new(path.clone())
            .save(&valid_credential())
            .unwrap();

        let store = Arc::new(FileCredentialStore::new(path));
        let restored = store.load().unwrap();
        assert!(restored.is_some());

        let identity = Arc::new(StubIdentity::default());
        let manager = CredentialManager::new(
            identity.clone(),
            store,
            "user@example.com".to_string(),
            "secret".to_string(),
            restored,
        );

        let credential = manager.obtain_valid().await.unwrap();
        assert_eq!(credential.access_token, "valid-access");
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(identity.authenticate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_credential_triggers_refresh() {
        let identity = Arc::new(StubIdentity::default());
        let (manager, store) = build_manager(identity.clone(), Some(expired_credential()));

        let credential = manager.obtain_valid().await.unwrap();
        assert_eq!(credential.access_token, "refresh-access-1");
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(identity.authenticate_calls.load(Ordering::SeqCst), 0);
        // 续期结果已持久化
        assert_eq!(store.current().unwrap(), credential);
    }

    #[tokio::test]
    async fn test_missing_credential_uses_password_auth() {
        let identity = Arc::new(StubIdentity::default());
        let (manager, _) = build_manager(identity.clone(), None);

        let credential = manager.obtain_valid().await.unwrap();
        assert_eq!(credential.access_token, "auth-access-1");
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(identity.authenticate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_password() {
        let identity = Arc::new(StubIdentity {
            refresh_fails: true,
            ..Default::default()
        });
        let (manager, _) = build_manager(identity.clone(), Some(expired_credential()));

        let credential = manager.obtain_valid().await.unwrap();
        assert_eq!(credential.access_token, "auth-access-1");
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(identity.authenticate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_paths_failing_surfaces_auth_failure() {
        let identity = Arc::new(StubIdentity {
            refresh_fails: true,
            authenticate_fails: true,
            ..Default::default()
        });
        let (manager, _) = build_manager(identity, Some(expired_credential()));

        let result = manager.obtain_valid().await;
        assert!(matches!(result, Err(AgentError::AuthFailure(_))));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_single_renewal() {
        let identity = Arc::new(StubIdentity::default());
        let (manager, _) = build_manager(identity.clone(), Some(expired_credential()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.obtain_valid().await },
            ));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap().access_token);
        }

        // 8 个并发调用方只触发一次续期，且观察到同一结果
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(identity.authenticate_calls.load(Ordering::SeqCst), 0);
        assert!(tokens.iter().all(|t| t == "refresh-access-1"));
    }

    #[tokio::test]
    async fn test_renew_after_rejection_deduplicates() {
        let identity = Arc::new(StubIdentity::default());
        let (manager, _) = build_manager(identity.clone(), Some(valid_credential()));

        // 两个单元同时带着同一个被拒凭证请求续期
        let rejected = valid_credential();
        let first = manager.renew_after_rejection(&rejected).await.unwrap();
        let second = manager.renew_after_rejection(&rejected).await.unwrap();

        // 第二个调用方发现凭证已更换，不再触发新的续期
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn test_refresh_token_carried_forward() {
        // 刷新交换不回传刷新令牌时沿用旧值
        #[derive(Default)]
        struct NoRefreshToken {
            calls: AtomicU32,
        }

        #[async_trait]
        impl IdentityExchange for NoRefreshToken {
            async fn authenticate(
                &self,
                _u: &str,
                _p: &str,
            ) -> Result<Credential, AgentError> {
                unreachable!("该场景不应走密码认证")
            }

            async fn refresh(&self, _t: &str) -> Result<Credential, AgentError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Credential::from_exchange(
                    "new-access".to_string(),
                    "new-id".to_string(),
                    None,
                    3600,
                    Utc::now(),
                ))
            }
        }

        let store = Arc::new(MemoryCredentialStore::new());
        let manager = CredentialManager::new(
            Arc::new(NoRefreshToken::default()),
            store,
            "u".to_string(),
            "p".to_string(),
            Some(expired_credential()),
        );

        let credential = manager.obtain_valid().await.unwrap();
        assert_eq!(credential.access_token, "new-access");
        assert_eq!(credential.refresh_token.as_deref(), Some("stale-refresh"));
    }

    #[tokio::test]
    async fn test_keepalive_renews_before_expiry() {
        let identity = Arc::new(StubIdentity::default());
        // 凭证还有 5 分钟过期，obtain_valid 不续期，保活应提前续期
        let nearly_expired = Credential::from_exchange(
            "near-access".to_string(),
            "near-id".to_string(),
            Some("near-refresh".to_string()),
            300,
            Utc::now(),
        );
        let (manager, _) = build_manager(identity.clone(), Some(nearly_expired));

        let credential = manager.obtain_valid().await.unwrap();
        assert_eq!(credential.access_token, "near-access");
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 0);

        let credential = manager.keepalive(Duration::minutes(10)).await.unwrap();
        assert_eq!(credential.access_token, "refresh-access-1");
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);

        // 刚续期的凭证再保活不触发第二次续期
        manager.keepalive(Duration::minutes(10)).await.unwrap();
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_auth_retry_renews_once() {
        let identity = Arc::new(StubIdentity::default());
        let (manager, _) = build_manager(identity.clone(), Some(valid_credential()));

        let attempts = AtomicU32::new(0);
        let result = with_auth_retry(RetryPolicy::unauthorized_once(), &manager, |_cred| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(AgentError::Unauthorized)
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_auth_retry_second_unauthorized_is_terminal() {
        let identity = Arc::new(StubIdentity::default());
        let (manager, _) = build_manager(identity.clone(), Some(valid_credential()));

        let attempts = AtomicU32::new(0);
        let result: Result<(), _> =
            with_auth_retry(RetryPolicy::unauthorized_once(), &manager, |_cred| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(AgentError::Unauthorized) }
            })
            .await;

        assert!(matches!(result, Err(AgentError::Unauthorized)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
    }
}
