//! storkwatch - 签名价格验证代理
//!
//! 启动流程：初始化日志 -> 加载配置 -> 恢复持久化凭证 -> 初始认证
//! （失败即退出）-> 启动周期调度 -> 等待 ctrl-c。

mod credential;
mod dispatch;
mod identity;
mod proxy;
mod scheduler;
mod services;

use anyhow::Context;
use credential::{CredentialManager, CredentialStore, FileCredentialStore};
use dispatch::ValidationDispatcher;
use identity::CognitoClient;
use proxy::{ProxyClientFactory, ProxyPool};
use scheduler::{CycleScheduler, SchedulerConfig};
use services::{StorkApiClient, ValidationApi};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storkwatch_core::config::AppConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = storkwatch_core::version(), "storkwatch 启动");

    let config = AppConfig::load(Path::new("config.json")).context("加载配置失败")?;

    let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(PathBuf::from(
        &config.token_path,
    )));
    let persisted = store.load().context("读取持久化凭证失败")?;
    if persisted.is_some() {
        tracing::info!("已恢复持久化凭证");
    }

    let identity = Arc::new(CognitoClient::new(&config.cognito).context("初始化身份客户端失败")?);
    let credentials = Arc::new(CredentialManager::new(
        identity,
        store,
        config.auth.username.clone(),
        config.auth.password.clone(),
        persisted,
    ));

    // 没有初始凭证进程无法工作，这是唯一允许致命的认证失败
    credentials
        .obtain_valid()
        .await
        .context("初始认证失败，进程无法启动")?;
    tracing::info!(username = %config.auth.username, "初始认证完成");

    let proxies = Arc::new(ProxyPool::from_urls(&config.proxies).context("加载代理列表失败")?);
    if proxies.is_empty() {
        tracing::info!("未配置代理，所有请求直连");
    } else {
        tracing::info!(count = proxies.len(), "代理池已加载");
    }

    let factory = Arc::new(ProxyClientFactory::new());
    let api: Arc<dyn ValidationApi> = Arc::new(StorkApiClient::new(
        config.stork.base_url.clone(),
        factory,
    ));

    let dispatcher = Arc::new(ValidationDispatcher::new(
        api.clone(),
        credentials.clone(),
        config.threads.max_workers,
    ));

    let scheduler = Arc::new(CycleScheduler::new(
        api,
        credentials,
        dispatcher,
        proxies,
        SchedulerConfig {
            cycle_interval: Duration::from_secs(config.stork.interval_seconds),
            keepalive_interval: Duration::from_secs(config.stork.keepalive_minutes * 60),
        },
    ));
    scheduler.clone().start();

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    tracing::info!("收到退出信号，正在停止");
    scheduler.stop();

    Ok(())
}
