//! 角色令牌模块
//!
//! 用主体令牌向角色令牌服务换取指定域、指定角色的角色令牌，
//! 并按 (域, 角色) 缓存，直到令牌即将过期或不满足调用方要求的最短有效期。

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use tenant_sidecar_common::{Error, Result};
use tenant_sidecar_identity::utils::parse_duration;
use tenant_sidecar_identity::TokenProvider;

use crate::config::RoleConfig;

/// 携带主体令牌的请求头
pub const ROLE_AUTH_HEADER: &str = "Athenz-Principal-Auth";

/// 角色令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleToken {
    /// 令牌内容
    pub token: String,
    /// 过期时间（Unix 秒）
    #[serde(rename = "expiryTime")]
    pub expiry_time: i64,
}

/// 角色令牌提供者
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// 获取 `domain` 下 `roles`（逗号分隔）的角色令牌
    async fn get_role_token(
        &self,
        domain: &str,
        roles: &str,
        min_expiry: Option<Duration>,
        max_expiry: Option<Duration>,
    ) -> Result<RoleToken>;
}

struct RoleState {
    url: String,
    expiry_margin: Duration,
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
    cache: DashMap<String, RoleToken>,
}

/// 角色令牌服务
#[derive(Clone)]
pub struct RoleService {
    state: Arc<RoleState>,
}

impl RoleService {
    /// 创建新的角色令牌服务
    pub fn new(cfg: &RoleConfig, token: Arc<dyn TokenProvider>) -> Result<Self> {
        let expiry_margin = parse_duration("role expiry margin", &cfg.expiry_margin)?;
        let timeout = parse_duration("role timeout", &cfg.timeout)?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!(url = %cfg.url, "角色令牌服务已创建");
        Ok(Self {
            state: Arc::new(RoleState {
                url: cfg.url.clone(),
                expiry_margin,
                http,
                token,
                cache: DashMap::new(),
            }),
        })
    }

    /// 交给路由使用的角色令牌提供者
    pub fn role_provider(&self) -> Arc<dyn RoleProvider> {
        Arc::new(self.clone())
    }

    /// 构造请求地址：`<url>/domain/<domain>/token?role=<roles>`
    fn request_url(
        &self,
        domain: &str,
        roles: &str,
        min_expiry: Option<Duration>,
        max_expiry: Option<Duration>,
    ) -> Result<Url> {
        let base = &self.state.url;
        let mut url = Url::parse(base)
            .map_err(|e| Error::Config(format!("无效的角色令牌服务地址 {}: {}", base, e)))?;

        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("无效的角色令牌服务地址: {}", base)))?
            .pop_if_empty()
            .extend(["domain", domain, "token"]);

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("role", roles);
            if let Some(min) = min_expiry {
                query.append_pair("minExpiryTime", &min.as_secs().to_string());
            }
            if let Some(max) = max_expiry {
                query.append_pair("maxExpiryTime", &max.as_secs().to_string());
            }
        }

        Ok(url)
    }

    /// 剩余有效期需同时超过过期余量和调用方要求的最短有效期
    fn cached(&self, key: &str, min_expiry: Option<Duration>) -> Option<RoleToken> {
        let entry = self.state.cache.get(key)?;
        let remaining = entry.expiry_time - Utc::now().timestamp();
        let required = self
            .state
            .expiry_margin
            .max(min_expiry.unwrap_or_default())
            .as_secs();
        if remaining > i64::try_from(required).unwrap_or(i64::MAX) {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// 写入缓存，同时清理已经过期的条目
    fn store(&self, key: String, token: RoleToken) {
        let now = Utc::now().timestamp();
        self.state.cache.retain(|_, cached| cached.expiry_time > now);
        self.state.cache.insert(key, token);
    }
}

#[async_trait]
impl RoleProvider for RoleService {
    async fn get_role_token(
        &self,
        domain: &str,
        roles: &str,
        min_expiry: Option<Duration>,
        max_expiry: Option<Duration>,
    ) -> Result<RoleToken> {
        if domain.is_empty() || roles.is_empty() {
            return Err(Error::Config("domain and role are required".to_string()));
        }

        let key = format!("{};{}", domain, roles);
        if let Some(token) = self.cached(&key, min_expiry) {
            return Ok(token);
        }

        let url = self.request_url(domain, roles, min_expiry, max_expiry)?;
        let principal = self.state.token.token()?;

        debug!(url = %url, "请求角色令牌");
        let response = self
            .state
            .http
            .get(url.clone())
            .header(ROLE_AUTH_HEADER, principal)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let token: RoleToken = serde_json::from_slice(&body)
            .map_err(|e| Error::Parse(format!("无法解码角色令牌响应: {}", e)))?;

        self.store(key, token.clone());
        Ok(token)
    }
}
