//! 主体令牌模块
//!
//! 该模块使用服务私钥签发主体令牌，并在后台按固定间隔重新签发。
//! 令牌格式为分号分隔的字段：
//! `v=S1;d=<域>;n=<服务>;h=<主机>;i=<地址>;k=<密钥版本>;t=<签发时间>;e=<过期时间>;s=<签名>`。

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use parking_lot::RwLock;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING, RSA_PKCS1_SHA256};
use rustls_pemfile::Item;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tenant_sidecar_common::{Error, Result};
use tenant_sidecar_identity::utils::{format_duration, get_actual_value, parse_duration};
use tenant_sidecar_identity::TokenProvider;

use crate::config::TokenConfig;
use crate::metrics::SidecarMetrics;

/// 令牌格式版本
pub const TOKEN_VERSION: &str = "S1";

/// 主体令牌服务
pub trait TokenService: Send + Sync {
    /// 获取当前令牌
    fn get_token(&self) -> Result<String>;

    /// 在后台按刷新间隔重新签发令牌，直到取消
    fn start_token_updater(&self, cancel: CancellationToken) -> JoinHandle<()>;

    /// 交给其他组件使用的令牌提供者
    fn token_provider(&self) -> Arc<dyn TokenProvider>;
}

enum TokenSigner {
    Rsa(RsaKeyPair),
    Ecdsa(EcdsaKeyPair),
}

impl TokenSigner {
    fn from_pem(pem: &[u8], rng: &SystemRandom) -> std::result::Result<Self, String> {
        let items = rustls_pemfile::read_all(&mut BufReader::new(pem))
            .map_err(|e| format!("Unable to create signer: {}", e))?;

        for item in items {
            match item {
                Item::PKCS8Key(der) => {
                    if let Ok(key) = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &der, rng) {
                        return Ok(TokenSigner::Ecdsa(key));
                    }
                    return RsaKeyPair::from_pkcs8(&der)
                        .map(TokenSigner::Rsa)
                        .map_err(|e| format!("Unable to create signer: {}", e));
                }
                Item::RSAKey(der) => {
                    return RsaKeyPair::from_der(&der)
                        .map(TokenSigner::Rsa)
                        .map_err(|e| format!("Unable to create signer: {}", e));
                }
                Item::ECKey(_) => {
                    return Err("Unable to create signer: SEC1 EC keys must be converted to PKCS#8".to_string());
                }
                _ => continue,
            }
        }

        Err("Unable to create signer: Unable to load private key".to_string())
    }

    fn sign(&self, rng: &SystemRandom, message: &[u8]) -> std::result::Result<Vec<u8>, String> {
        match self {
            TokenSigner::Rsa(key) => {
                let mut signature = vec![0; key.public().modulus_len()];
                key.sign(&RSA_PKCS1_SHA256, rng, message, &mut signature)
                    .map_err(|_| "RSA 签名失败".to_string())?;
                Ok(signature)
            }
            TokenSigner::Ecdsa(key) => key
                .sign(rng, message)
                .map(|signature| signature.as_ref().to_vec())
                .map_err(|_| "ECDSA 签名失败".to_string()),
        }
    }
}

struct TokenBuilder {
    domain: String,
    service: String,
    key_version: String,
    hostname: String,
    ip: String,
    expiration: Duration,
    signer: TokenSigner,
    rng: SystemRandom,
}

impl TokenBuilder {
    fn build(&self) -> Result<String> {
        let issued = Utc::now().timestamp();
        let expiry = issued + self.expiration.as_secs() as i64;

        let mut unsigned = format!("v={};d={};n={}", TOKEN_VERSION, self.domain, self.service);
        if !self.hostname.is_empty() {
            unsigned.push_str(&format!(";h={}", self.hostname));
        }
        if !self.ip.is_empty() {
            unsigned.push_str(&format!(";i={}", self.ip));
        }
        unsigned.push_str(&format!(";k={};t={};e={}", self.key_version, issued, expiry));

        let signature = self
            .signer
            .sign(&self.rng, unsigned.as_bytes())
            .map_err(|reason| self.error(reason))?;

        Ok(format!("{};s={}", unsigned, URL_SAFE_NO_PAD.encode(signature)))
    }

    fn error(&self, reason: String) -> Error {
        Error::TokenBuilder {
            domain: self.domain.clone(),
            service: self.service.clone(),
            key_version: self.key_version.clone(),
            reason,
        }
    }
}

struct TokenState {
    builder: TokenBuilder,
    refresh_duration: Duration,
    token: RwLock<String>,
}

impl TokenState {
    fn refresh(&self) -> Result<()> {
        let token = self.builder.build()?;
        *self.token.write() = token;
        Ok(())
    }
}

/// 基于服务私钥的主体令牌服务
#[derive(Clone)]
pub struct NTokenService {
    state: Arc<TokenState>,
    metrics: Option<Arc<SidecarMetrics>>,
}

impl NTokenService {
    /// 根据配置创建令牌服务，并立即签发第一个令牌
    pub fn new(cfg: &TokenConfig) -> Result<Self> {
        let refresh_duration = parse_duration("token refresh duration", &cfg.refresh_duration)?;
        if refresh_duration.is_zero() {
            return Err(Error::InvalidDuration {
                field: "token refresh duration".to_string(),
                value: cfg.refresh_duration.clone(),
                reason: "must be positive".to_string(),
            });
        }
        let expiration = parse_duration("token expiration", &cfg.expiration)?;

        let key_path = get_actual_value(&cfg.private_key_path);
        let key_data = std::fs::read(&key_path).map_err(|source| Error::KeyLoad {
            path: key_path.clone(),
            source,
        })?;

        let domain = get_actual_value(&cfg.athenz_domain);
        let service = get_actual_value(&cfg.service_name);
        let builder_error = |reason: String| Error::TokenBuilder {
            domain: domain.clone(),
            service: service.clone(),
            key_version: cfg.key_version.clone(),
            reason,
        };

        let rng = SystemRandom::new();
        let signer = TokenSigner::from_pem(&key_data, &rng).map_err(builder_error)?;
        if domain.is_empty() || service.is_empty() {
            return Err(builder_error("domain and service name are required".to_string()));
        }

        let builder = TokenBuilder {
            domain: domain.clone(),
            service: service.clone(),
            key_version: cfg.key_version.clone(),
            hostname: get_actual_value(&cfg.hostname),
            ip: get_actual_value(&cfg.ip),
            expiration,
            signer,
            rng,
        };
        let token = builder.build()?;

        info!(domain = %domain, service = %service, "主体令牌服务已创建");
        Ok(Self {
            state: Arc::new(TokenState {
                builder,
                refresh_duration,
                token: RwLock::new(token),
            }),
            metrics: None,
        })
    }

    /// 记录令牌刷新失败的指标
    pub fn with_metrics(mut self, metrics: Arc<SidecarMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl TokenService for NTokenService {
    fn get_token(&self) -> Result<String> {
        Ok(self.state.token.read().clone())
    }

    fn start_token_updater(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            info!("令牌刷新任务已启动，间隔: {}", format_duration(state.refresh_duration));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(state.refresh_duration) => {}
                }

                match state.refresh() {
                    Ok(()) => debug!("主体令牌已刷新"),
                    Err(e) => {
                        error!(error = %e, "主体令牌刷新失败");
                        if let Some(metrics) = &metrics {
                            metrics.token_refresh_failed();
                        }
                    }
                }
            }
            info!("令牌刷新任务已停止");
        })
    }

    fn token_provider(&self) -> Arc<dyn TokenProvider> {
        Arc::new(self.clone())
    }
}

impl TokenProvider for NTokenService {
    fn token(&self) -> Result<String> {
        self.get_token()
    }
}
