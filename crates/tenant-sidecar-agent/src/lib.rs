//! Tenant Sidecar Agent - 凭证刷新与本机凭证服务
//!
//! 该模块实现了 Sidecar 的生命周期编排：签发并刷新主体令牌，
//! 按过期时间刷新证书缓存，提供角色令牌，并在同一个取消信号下
//! 运行网络监听器。所有终止错误汇总后通过一个通道交付一次。

pub mod config;
pub mod metrics;
pub mod role;
pub mod router;
pub mod server;
pub mod token;

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tenant_sidecar_common::{Error, Result};
use tenant_sidecar_identity::authority::create_credential_cache;
use tenant_sidecar_identity::utils::format_duration;
use tenant_sidecar_identity::{CertProvider, CredentialCache, TokenProvider};

pub use config::{ConfigManager, SidecarConfig};

use crate::metrics::SidecarMetrics;
use crate::role::{RoleProvider, RoleService};
use crate::router::Router;
use crate::server::Server;
use crate::token::{NTokenService, TokenService};

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 取消信号
    Cancelled,
    /// 网络监听器失败
    ListenerFailed,
}

/// Tenant 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    /// 已创建，尚未启动
    Created,
    /// 正在启动后台任务
    Starting,
    /// 运行中
    Running,
    /// 已停止
    Stopped(StopReason),
}

/// Tenant 主结构体
pub struct Tenant {
    /// 主体令牌服务
    token: Arc<dyn TokenService>,
    /// 角色令牌提供者
    role: Arc<dyn RoleProvider>,
    /// 证书缓存，未启用证书颁发机构时为空
    credentials: Option<Arc<CredentialCache>>,
    /// 网络监听器
    server: Server,
    /// 停止时等待后台任务结束的时间
    shutdown_timeout: Duration,
    /// 当前状态
    state: Mutex<TenantState>,
    /// 本次运行的取消信号
    run: Mutex<Option<CancellationToken>>,
}

impl Tenant {
    /// 根据配置创建 Tenant，返回的实例尚未启动
    pub fn new(config: &SidecarConfig) -> Result<Self> {
        let shutdown_timeout = config.server.shutdown_timeout()?;

        // 创建指标收集器
        let metrics = Arc::new(SidecarMetrics::new()?);

        // 创建主体令牌服务
        let token = NTokenService::new(&config.token)?.with_metrics(metrics.clone());
        let token_provider = token.token_provider();

        // 创建角色令牌服务
        let role = RoleService::new(&config.role, token_provider.clone())?.role_provider();

        // 创建证书缓存
        let credentials = if config.authority.enabled {
            let (default_interval, retry_interval) = config.authority.intervals()?;
            let cache = create_credential_cache(
                config.authority.client_config()?,
                config.authority.identity()?,
                token_provider.clone(),
            )?
            .with_intervals(default_interval, retry_interval)
            .with_observer(metrics.clone());
            Some(Arc::new(cache))
        } else {
            None
        };

        // 创建路由与网络监听器
        let router = Router::new(&config.server.health_check_path, token_provider, role.clone())
            .with_metrics(metrics);
        let server = Server::new(&config.server, Arc::new(router))?;

        info!(
            port = config.server.port,
            tls = server.is_tls(),
            certificates = credentials.is_some(),
            "Tenant 已创建"
        );
        Ok(Self::from_parts(
            Arc::new(token),
            role,
            credentials,
            server,
            shutdown_timeout,
        ))
    }

    /// 由已构建的组件组装 Tenant
    pub fn from_parts(
        token: Arc<dyn TokenService>,
        role: Arc<dyn RoleProvider>,
        credentials: Option<Arc<CredentialCache>>,
        server: Server,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            token,
            role,
            credentials,
            server,
            shutdown_timeout,
            state: Mutex::new(TenantState::Created),
            run: Mutex::new(None),
        }
    }

    /// 当前状态
    pub fn state(&self) -> TenantState {
        *self.state.lock()
    }

    /// 主体令牌提供者
    pub fn token_provider(&self) -> Arc<dyn TokenProvider> {
        self.token.token_provider()
    }

    /// 角色令牌提供者
    pub fn role_provider(&self) -> Arc<dyn RoleProvider> {
        self.role.clone()
    }

    /// 交给下游 HTTP 客户端的证书提供者，未启用证书颁发机构时为空
    pub fn cert_provider(&self) -> Option<Arc<dyn CertProvider>> {
        self.credentials.as_ref().map(|cache| cache.cert_provider())
    }

    /// 启动 Tenant
    ///
    /// 立即返回一个通道。`parent` 被取消或监听器失败时，所有后台任务
    /// 收到同一个取消信号，通道收到一次终止时的错误列表。
    pub fn start(
        self: &Arc<Self>,
        parent: &CancellationToken,
    ) -> Result<oneshot::Receiver<Vec<Error>>> {
        let cancel = parent.child_token();
        {
            let mut state = self.state.lock();
            if *state != TenantState::Created {
                return Err(Error::Config(format!("Tenant 无法在 {:?} 状态下启动", *state)));
            }
            *state = TenantState::Starting;
            // 持有状态锁时登记取消信号，stop 不会错过启动中的 Tenant
            *self.run.lock() = Some(cancel.clone());
        }

        // 启动令牌刷新与证书刷新
        let mut tasks = vec![self.token.start_token_updater(cancel.clone())];
        if let Some(credentials) = &self.credentials {
            tasks.push(credentials.start_scheduler(cancel.clone()));
        }

        *self.state.lock() = TenantState::Running;

        let (tx, rx) = oneshot::channel();
        let tenant = self.clone();
        tokio::spawn(async move {
            let (errors, reason) = tokio::select! {
                _ = cancel.cancelled() => (vec![Error::Cancelled], StopReason::Cancelled),
                result = tenant.server.listen_and_serve(cancel.clone()) => match result {
                    Ok(()) => (vec![Error::Cancelled], StopReason::Cancelled),
                    Err(e) => (vec![e], StopReason::ListenerFailed),
                },
            };

            // 通知所有后台任务停止
            cancel.cancel();
            match tokio::time::timeout(tenant.shutdown_timeout, join_all(tasks)).await {
                Ok(results) => {
                    for e in results.into_iter().filter_map(|result| result.err()) {
                        error!(error = %e, "后台任务异常退出");
                    }
                }
                Err(_) => warn!(
                    "后台任务未能在 {} 内停止",
                    format_duration(tenant.shutdown_timeout)
                ),
            }

            *tenant.state.lock() = TenantState::Stopped(reason);
            info!(reason = ?reason, "Tenant 已停止");

            if tx.send(errors).is_err() {
                debug!("终止结果的接收方已关闭");
            }
        });

        Ok(rx)
    }

    /// 停止 Tenant，可重复调用
    pub fn stop(&self) {
        let mut state = self.state.lock();
        match self.run.lock().as_ref() {
            Some(cancel) => cancel.cancel(),
            None if *state == TenantState::Created => {
                *state = TenantState::Stopped(StopReason::Cancelled);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{create_default_config, ServerConfig};
    use crate::role::RoleToken;
    use crate::router::Handler;
    use async_trait::async_trait;
    use hyper::{Body, Request, Response};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tenant_sidecar_identity::{
        CertificateAuthority, CertificateBundle, IssuedCertificate, SelfIdentity,
    };
    use tokio::task::JoinHandle;

    // 每次都返回同一张证书的证书颁发机构
    struct FakeAuthority {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateAuthority for FakeAuthority {
        async fn fetch_certificates(&self, hostname: &str, _address: &str) -> Result<CertificateBundle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CertificateBundle {
                hostname: hostname.to_string(),
                certificates: vec![IssuedCertificate {
                    identity: "app.one".to_string(),
                    payload: "v=Y1;a=app.one;k=4000000000;s=sig".to_string(),
                }],
            })
        }
    }

    struct FakeToken {
        stopped: Arc<AtomicBool>,
    }

    impl TokenService for FakeToken {
        fn get_token(&self) -> Result<String> {
            Ok("v=S1;d=tenant.domain".to_string())
        }

        fn start_token_updater(&self, cancel: CancellationToken) -> JoinHandle<()> {
            let stopped = self.stopped.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                stopped.store(true, Ordering::SeqCst);
            })
        }

        fn token_provider(&self) -> Arc<dyn TokenProvider> {
            Arc::new(|| -> Result<String> { Ok("v=S1;d=tenant.domain".to_string()) })
        }
    }

    struct FakeRoles;

    #[async_trait]
    impl RoleProvider for FakeRoles {
        async fn get_role_token(
            &self,
            _domain: &str,
            _roles: &str,
            _min_expiry: Option<Duration>,
            _max_expiry: Option<Duration>,
        ) -> Result<RoleToken> {
            Err(Error::Transport("unreachable".to_string()))
        }
    }

    struct Ok200;

    #[async_trait]
    impl Handler for Ok200 {
        async fn handle(&self, _req: Request<Body>) -> Response<Body> {
            Response::new(Body::from("OK"))
        }
    }

    fn tenant(port: u16) -> (Arc<Tenant>, Arc<AtomicBool>) {
        tenant_with_credentials(port, None)
    }

    fn tenant_with_credentials(
        port: u16,
        credentials: Option<Arc<CredentialCache>>,
    ) -> (Arc<Tenant>, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        let token = Arc::new(FakeToken {
            stopped: stopped.clone(),
        });
        let server = Server::new(
            &ServerConfig {
                port,
                ..Default::default()
            },
            Arc::new(Ok200),
        )
        .unwrap();

        let tenant = Tenant::from_parts(
            token,
            Arc::new(FakeRoles),
            credentials,
            server,
            Duration::from_secs(1),
        );
        (Arc::new(tenant), stopped)
    }

    #[tokio::test]
    async fn test_cancel_delivers_cancelled() {
        let (tenant, updater_stopped) = tenant(0);
        let parent = CancellationToken::new();

        let rx = tenant.start(&parent).unwrap();
        assert_eq!(tenant.state(), TenantState::Running);

        parent.cancel();
        let errors = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("result should be delivered")
            .unwrap();

        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_cancelled());
        assert!(updater_stopped.load(Ordering::SeqCst));
        assert_eq!(tenant.state(), TenantState::Stopped(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_listener_failure_stops_run() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let (tenant, updater_stopped) = tenant(port);
        let parent = CancellationToken::new();
        let rx = tenant.start(&parent).unwrap();

        let errors = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("result should be delivered")
            .unwrap();

        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Listener(_)));
        assert!(updater_stopped.load(Ordering::SeqCst));
        assert_eq!(tenant.state(), TenantState::Stopped(StopReason::ListenerFailed));
        // 父级取消信号不受影响
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (tenant, _) = tenant(0);
        let rx = tenant.start(&CancellationToken::new()).unwrap();

        tenant.stop();
        tenant.stop();

        let errors = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("result should be delivered")
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_cancelled());

        tenant.stop();
        assert!(matches!(tenant.start(&CancellationToken::new()), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_certificate_refresh_runs_under_tenant() {
        let authority = Arc::new(FakeAuthority {
            calls: AtomicUsize::new(0),
        });
        let identity = SelfIdentity {
            address: "10.0.0.1".to_string(),
            hostname: "host.example.jp".to_string(),
        };
        let cache = Arc::new(CredentialCache::new(authority.clone(), identity));
        let (tenant, _) = tenant_with_credentials(0, Some(cache.clone()));

        let parent = CancellationToken::new();
        let rx = tenant.start(&parent).unwrap();

        // 首次刷新在启动后立即执行
        let refreshed = async {
            while authority.calls.load(Ordering::SeqCst) == 0 || cache.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), refreshed)
            .await
            .expect("certificate refresh should run");

        let certs = tenant.cert_provider().unwrap();
        assert_eq!(
            certs.certificate("app.one").unwrap().payload(),
            "v=Y1;a=app.one;k=4000000000;s=sig"
        );
        drop(certs);

        parent.cancel();
        let errors = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("result should be delivered")
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_cancelled());

        // 调度任务结束后只剩测试和 Tenant 持有证书缓存
        assert_eq!(Arc::strong_count(&cache), 2);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_racing_start_is_not_lost() {
        for _ in 0..20 {
            let (tenant, _) = tenant(0);

            // 在另一个线程上与 start 并发调用一次 stop
            let stopper = {
                let tenant = tenant.clone();
                tokio::task::spawn_blocking(move || tenant.stop())
            };
            let started = tenant.start(&CancellationToken::new());
            stopper.await.unwrap();

            match started {
                Ok(rx) => {
                    let errors = tokio::time::timeout(Duration::from_secs(2), rx)
                        .await
                        .expect("stop should cancel the run")
                        .unwrap();
                    assert!(errors[0].is_cancelled());
                }
                Err(_) => assert_eq!(tenant.state(), TenantState::Stopped(StopReason::Cancelled)),
            }
        }
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (tenant, _) = tenant(0);
        tenant.stop();
        assert_eq!(tenant.state(), TenantState::Stopped(StopReason::Cancelled));
        assert!(tenant.start(&CancellationToken::new()).is_err());
    }

    fn config_with_key(dir: &tempfile::TempDir) -> SidecarConfig {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key_path = dir.path().join("private.key");
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        let mut config = create_default_config();
        config.server.port = 0;
        config.token.athenz_domain = "tenant.domain".to_string();
        config.token.service_name = "sidecar".to_string();
        config.token.private_key_path = key_path.to_str().unwrap().to_string();
        config.token.hostname = String::new();
        config.token.ip = String::new();
        config
    }

    #[tokio::test]
    async fn test_new_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_key(&dir);

        let tenant = Tenant::new(&config).unwrap();
        assert_eq!(tenant.state(), TenantState::Created);
        assert!(tenant.cert_provider().is_none());
        assert!(tenant.token_provider().token().unwrap().starts_with("v=S1;d=tenant.domain;n=sidecar"));

        let mut config = config_with_key(&dir);
        config.authority.enabled = true;
        config.authority.hostname = "host.example.jp".to_string();
        let tenant = Tenant::new(&config).unwrap();
        let certs = tenant.cert_provider().unwrap();
        assert!(certs.certificate("app.one").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = config_with_key(&dir);
        config.token.refresh_duration = "dummy".to_string();
        assert!(matches!(Tenant::new(&config), Err(Error::InvalidDuration { .. })));

        let mut config = config_with_key(&dir);
        config.token.private_key_path = "/tmp/tenant-sidecar-missing.key".to_string();
        assert!(matches!(Tenant::new(&config), Err(Error::KeyLoad { .. })));

        // 启用证书颁发机构时必须配置主机名
        let mut config = config_with_key(&dir);
        config.authority.enabled = true;
        assert!(matches!(Tenant::new(&config), Err(Error::Config(_))));
    }
}
