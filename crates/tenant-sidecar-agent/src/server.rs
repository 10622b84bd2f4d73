//! 网络监听模块
//!
//! 在 `0.0.0.0:<port>` 上接受连接，按配置包装 TLS，
//! 以 HTTP/1.1 把请求交给路由处理，直到取消。

use hyper::server::conn::Http;
use hyper::service::service_fn;
use std::convert::Infallible;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tenant_sidecar_common::{Error, Result};
use tenant_sidecar_identity::build_tls_policy;

use crate::config::ServerConfig;
use crate::router::Handler;

/// 网络监听器
pub struct Server {
    /// 监听端口
    port: u16,
    /// 请求处理器
    handler: Arc<dyn Handler>,
    /// TLS 接收器，未启用 TLS 时为空
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// 创建新的监听器，启用 TLS 时立即加载证书和私钥
    pub fn new(cfg: &ServerConfig, handler: Arc<dyn Handler>) -> Result<Self> {
        let tls = if cfg.tls.enabled {
            let policy = build_tls_policy(&cfg.tls.options())?;
            info!(client_auth = ?policy.client_auth_mode(), "已加载 TLS 策略");
            Some(TlsAcceptor::from(policy.server_config()?))
        } else {
            None
        };

        Ok(Self {
            port: cfg.port,
            handler,
            tls,
        })
    }

    /// 是否启用了 TLS
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// 绑定监听端口
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Listener(format!("无法监听 {}: {}", addr, e)))
    }

    /// 绑定端口并开始服务
    pub async fn listen_and_serve(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// 在已绑定的监听器上接受连接，取消后停止接受新连接
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| Error::Listener(e.to_string()))?;
        info!(addr = %local, tls = self.is_tls(), "服务器启动");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "接受连接失败");
                        continue;
                    }
                    Err(e) => return Err(Error::Listener(format!("接受连接失败: {}", e))),
                },
            };

            let handler = self.handler.clone();
            let tls = self.tls.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => serve_connection(stream, handler, cancel).await,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS 握手失败");
                            return;
                        }
                    },
                    None => serve_connection(stream, handler, cancel).await,
                };

                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "连接处理结束");
                }
            });
        }

        info!(addr = %local, "服务器已停止");
        Ok(())
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

async fn serve_connection<I>(
    io: I,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
) -> hyper::Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    let conn = Http::new().http1_only(true).serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    }
}
