//! 路由模块
//!
//! 向本机应用提供健康检查、主体令牌、角色令牌与监控指标接口。

use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tenant_sidecar_common::Error;
use tenant_sidecar_identity::TokenProvider;

use crate::metrics::SidecarMetrics;
use crate::role::RoleProvider;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// HTTP 请求处理器
#[async_trait]
pub trait Handler: Send + Sync {
    /// 处理一个请求
    async fn handle(&self, req: Request<Body>) -> Response<Body>;
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RoleTokenRequest {
    domain: String,
    role: String,
    #[serde(rename = "minExpiry", default)]
    min_expiry: Option<u64>,
    #[serde(rename = "maxExpiry", default)]
    max_expiry: Option<u64>,
}

/// Sidecar 路由
pub struct Router {
    /// 健康检查路径
    health_check_path: String,
    /// 主体令牌提供者
    token: Arc<dyn TokenProvider>,
    /// 角色令牌提供者
    role: Arc<dyn RoleProvider>,
    /// 指标收集器
    metrics: Option<Arc<SidecarMetrics>>,
}

impl Router {
    /// 创建新的路由
    pub fn new(
        health_check_path: &str,
        token: Arc<dyn TokenProvider>,
        role: Arc<dyn RoleProvider>,
    ) -> Self {
        Self {
            health_check_path: health_check_path.to_string(),
            token,
            role,
            metrics: None,
        }
    }

    /// 在 `/metrics` 导出指标
    pub fn with_metrics(mut self, metrics: Arc<SidecarMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn handle_token(&self) -> Response<Body> {
        match self.token.token() {
            Ok(token) => json(StatusCode::OK, &TokenResponse { token }),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_role_token(&self, req: Request<Body>) -> Response<Body> {
        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(e) => return respond(StatusCode::BAD_REQUEST, TEXT_PLAIN, e.to_string()),
        };
        let request: RoleTokenRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return respond(StatusCode::BAD_REQUEST, TEXT_PLAIN, e.to_string()),
        };

        let result = self
            .role
            .get_role_token(
                &request.domain,
                &request.role,
                request.min_expiry.map(Duration::from_secs),
                request.max_expiry.map(Duration::from_secs),
            )
            .await;

        match result {
            Ok(token) => json(StatusCode::OK, &token),
            Err(e) => {
                warn!(domain = %request.domain, role = %request.role, error = %e, "获取角色令牌失败");
                error_response(&e)
            }
        }
    }

    fn handle_metrics(&self) -> Response<Body> {
        let Some(metrics) = &self.metrics else {
            return not_found();
        };
        match metrics.encode() {
            Ok(text) => respond(StatusCode::OK, TEXT_PLAIN, text),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT_PLAIN, e.to_string()),
        }
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        debug!(method = %req.method(), path = %req.uri().path(), "收到请求");

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match (method, path.as_str()) {
            (Method::GET, p) if p == self.health_check_path => {
                respond(StatusCode::OK, TEXT_PLAIN, "OK")
            }
            (Method::GET, "/ntoken") => self.handle_token(),
            (Method::POST, "/roletoken") => self.handle_role_token(req).await,
            (Method::GET, "/metrics") => self.handle_metrics(),
            _ => not_found(),
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, APPLICATION_JSON, body),
        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT_PLAIN, e.to_string()),
    }
}

fn not_found() -> Response<Body> {
    respond(StatusCode::NOT_FOUND, TEXT_PLAIN, "Not Found")
}

fn error_response(error: &Error) -> Response<Body> {
    let status = match error {
        Error::Config(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        // 上游服务不可达、返回错误或响应无法解码
        Error::Transport(_) | Error::Status { .. } | Error::Parse(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond(status, TEXT_PLAIN, error.to_string())
}
