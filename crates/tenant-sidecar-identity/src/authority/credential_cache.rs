//! 证书缓存模块
//!
//! 该模块实现按身份缓存的短期证书，并在最早过期时间到达时从证书颁发机构刷新。
//! 读取不会被刷新阻塞；刷新按身份逐个替换，响应中未出现的身份保持不变。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tenant_sidecar_common::{parse_expiry, Certificate, Error, Result};

use super::authority_client::CertificateAuthority;
use crate::provider::CertProvider;
use crate::utils::format_duration;

/// 响应中没有任何过期时间时的默认刷新间隔
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// 刷新失败后的重试间隔
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Sidecar 自身的身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    /// 本机地址
    pub address: String,
    /// 本机主机名
    pub hostname: String,
}

/// 刷新结果观察者
pub trait RefreshObserver: Send + Sync {
    /// 刷新成功
    fn refresh_succeeded(&self, stored: usize, cached: usize, next_refresh_at: DateTime<Utc>);
    /// 刷新失败
    fn refresh_failed(&self, error: &Error);
}

/// 只写日志的观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RefreshObserver for LogObserver {
    fn refresh_succeeded(&self, stored: usize, cached: usize, next_refresh_at: DateTime<Utc>) {
        info!(stored, cached, next_refresh_at = %next_refresh_at, "证书刷新完成");
    }

    fn refresh_failed(&self, error: &Error) {
        error!(error = %error, "证书刷新失败");
    }
}

#[derive(Debug, Clone, Copy)]
struct RefreshSchedule {
    next_refresh_at: DateTime<Utc>,
    last_refreshed_at: DateTime<Utc>,
}

/// 证书缓存管理器
pub struct CredentialCache {
    /// 身份到证书的映射
    entries: DashMap<String, Certificate>,
    /// 证书颁发机构
    authority: Arc<dyn CertificateAuthority>,
    /// 本机身份
    identity: SelfIdentity,
    /// 刷新时间表
    schedule: RwLock<RefreshSchedule>,
    /// 保证同一时刻只有一个刷新在进行
    refresh_lock: Mutex<()>,
    /// 默认刷新间隔
    default_interval: Duration,
    /// 失败重试间隔
    retry_interval: Duration,
    /// 刷新结果观察者
    observer: Arc<dyn RefreshObserver>,
}

impl CredentialCache {
    /// 创建新的证书缓存，首次调度会立即刷新
    pub fn new(authority: Arc<dyn CertificateAuthority>, identity: SelfIdentity) -> Self {
        let now = Utc::now();
        Self {
            entries: DashMap::new(),
            authority,
            identity,
            schedule: RwLock::new(RefreshSchedule {
                next_refresh_at: now,
                last_refreshed_at: now,
            }),
            refresh_lock: Mutex::new(()),
            default_interval: DEFAULT_REFRESH_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            observer: Arc::new(LogObserver),
        }
    }

    /// 设置默认刷新间隔和失败重试间隔
    pub fn with_intervals(mut self, default_interval: Duration, retry_interval: Duration) -> Self {
        self.default_interval = default_interval;
        self.retry_interval = retry_interval;
        self
    }

    /// 设置刷新结果观察者
    pub fn with_observer(mut self, observer: Arc<dyn RefreshObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// 查找指定身份的证书
    pub fn lookup(&self, identity: &str) -> Result<Certificate> {
        let certificate = self
            .entries
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(identity.to_string()))?;

        if certificate.is_expired() {
            debug!(identity = %identity, "证书已过期，等待下一次刷新");
        }
        Ok(certificate)
    }

    /// 缓存的证书数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 本机身份
    pub fn identity(&self) -> &SelfIdentity {
        &self.identity
    }

    /// 下一次刷新时间
    pub fn next_refresh_at(&self) -> DateTime<Utc> {
        self.schedule.read().next_refresh_at
    }

    /// 上一次成功刷新的时间
    pub fn last_refreshed_at(&self) -> DateTime<Utc> {
        self.schedule.read().last_refreshed_at
    }

    /// 交给下游 HTTP 客户端的证书提供者
    pub fn cert_provider(self: &Arc<Self>) -> Arc<dyn CertProvider> {
        self.clone()
    }

    /// 执行一次刷新，返回本次存入的证书数量
    ///
    /// 证书颁发机构请求失败时缓存保持不变。单个证书的过期字段无法解析时，
    /// 证书仍然存入缓存，只是不参与下一次刷新时间的计算。
    pub async fn refresh_once(&self) -> Result<usize> {
        let _guard = self.refresh_lock.lock().await;

        let now = Utc::now();
        let fallback = self.fallback_refresh_at(now)?;

        let bundle = self
            .authority
            .fetch_certificates(&self.identity.hostname, &self.identity.address)
            .await?;

        let mut earliest: Option<DateTime<Utc>> = None;
        let mut stored = 0;

        for issued in bundle.certificates {
            let expires_at = match parse_expiry(&issued.payload) {
                Ok(expires_at) => expires_at,
                Err(e) => {
                    warn!(identity = %issued.identity, error = %e, "证书过期时间无法解析，不参与刷新调度");
                    None
                }
            };

            if let Some(expires_at) = expires_at {
                earliest = Some(earliest.map_or(expires_at, |current| current.min(expires_at)));
            }

            let certificate = Certificate::with_expiry(issued.identity.clone(), issued.payload, expires_at);
            self.entries.insert(issued.identity, certificate);
            stored += 1;
        }

        let next_refresh_at = earliest.unwrap_or(fallback);
        {
            let mut schedule = self.schedule.write();
            schedule.next_refresh_at = next_refresh_at;
            schedule.last_refreshed_at = now;
        }

        debug!(stored, next_refresh_at = %next_refresh_at, "证书缓存已更新");
        Ok(stored)
    }

    /// 响应中没有过期时间时的下一次刷新时间
    fn fallback_refresh_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        chrono::Duration::from_std(self.default_interval)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| Error::InvalidDuration {
                field: "default refresh interval".to_string(),
                value: format!("{:?}", self.default_interval),
                reason: "interval out of range".to_string(),
            })
    }

    fn time_until_refresh(&self) -> Duration {
        (self.next_refresh_at() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// 运行刷新调度，直到取消
    ///
    /// 在下一次刷新时间或取消信号到达之前挂起。刷新失败只记录，
    /// 在重试间隔后再次尝试。
    pub async fn run_scheduler(self: Arc<Self>, cancel: CancellationToken) {
        info!(hostname = %self.identity.hostname, "证书刷新调度已启动");

        loop {
            let wait = self.time_until_refresh();
            if !wait.is_zero() {
                debug!("下一次证书刷新在 {} 后", format_duration(wait));
                if sleep_or_cancel(&cancel, wait).await {
                    break;
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.refresh_once() => outcome,
            };

            match outcome {
                Ok(stored) => {
                    let next_refresh_at = self.next_refresh_at();
                    self.observer.refresh_succeeded(stored, self.len(), next_refresh_at);
                    // 颁发的证书已经过期时避免连续请求
                    if next_refresh_at <= Utc::now() && sleep_or_cancel(&cancel, self.retry_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    self.observer.refresh_failed(&e);
                    if sleep_or_cancel(&cancel, self.retry_interval).await {
                        break;
                    }
                }
            }
        }

        info!("证书刷新调度已停止");
    }

    /// 在后台启动刷新调度
    pub fn start_scheduler(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_scheduler(cancel))
    }
}

impl CertProvider for CredentialCache {
    fn certificate(&self, identity: &str) -> Result<Certificate> {
        self.lookup(identity)
    }
}

/// 等待指定时间，被取消时返回 true
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
