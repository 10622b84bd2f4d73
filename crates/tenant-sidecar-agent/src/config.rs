//! 配置管理模块
//!
//! 该模块负责加载 Sidecar 的配置文件，支持 YAML/JSON 格式。
//! 凭证路径、域名等字段支持 `_NAME_` 形式的环境变量引用。

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use tenant_sidecar_common::{Error, Result};
use tenant_sidecar_identity::authority::{
    AuthorityClientConfig, SelfIdentity, DEFAULT_AUTHORITY_URL, DEFAULT_LEASE_DURATION,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_INTERVAL,
};
use tenant_sidecar_identity::utils::{get_actual_value, parse_duration_or, parse_interval};
use tenant_sidecar_identity::TlsOptions;

/// 默认的角色令牌服务地址
pub const DEFAULT_ROLE_URL: &str = "https://zts.athenz.yahoo.co.jp:4443/zts/v1";

/// Sidecar 配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// 网络监听配置
    pub server: ServerConfig,
    /// 主体令牌配置
    pub token: TokenConfig,
    /// 角色令牌配置
    pub role: RoleConfig,
    /// 证书颁发机构配置
    pub authority: AuthorityConfig,
    /// 日志级别
    pub log_level: String,
}

/// 网络监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听端口
    pub port: u16,
    /// 健康检查路径
    pub health_check_path: String,
    /// 停止时等待后台任务结束的时间
    pub shutdown_timeout: String,
    /// TLS 配置
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            health_check_path: "/healthz".to_string(),
            shutdown_timeout: "5s".to_string(),
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// 解析停止等待时间
    pub fn shutdown_timeout(&self) -> Result<Duration> {
        parse_duration_or("server shutdown timeout", &self.shutdown_timeout, Duration::from_secs(5))
    }
}

/// TLS 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// 是否启用 TLS
    pub enabled: bool,
    /// 证书路径
    pub cert: String,
    /// 私钥路径
    pub key: String,
    /// CA 证书路径，设置后要求客户端证书
    pub ca: String,
}

impl TlsConfig {
    /// 转换为 TLS 构建选项
    pub fn options(&self) -> TlsOptions {
        TlsOptions {
            certificate_path: self.cert.clone(),
            private_key_path: self.key.clone(),
            trust_anchor_path: self.ca.clone(),
        }
    }
}

/// 主体令牌配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// 域名
    pub athenz_domain: String,
    /// 服务名
    pub service_name: String,
    /// 私钥路径
    pub private_key_path: String,
    /// 密钥版本
    pub key_version: String,
    /// 令牌刷新间隔
    pub refresh_duration: String,
    /// 令牌有效期
    pub expiration: String,
    /// 写入令牌的主机名
    pub hostname: String,
    /// 写入令牌的地址
    pub ip: String,
}

/// 角色令牌配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// 角色令牌服务地址
    pub url: String,
    /// 令牌剩余有效期低于该值时重新获取
    pub expiry_margin: String,
    /// 请求超时
    pub timeout: String,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ROLE_URL.to_string(),
            expiry_margin: "1m".to_string(),
            timeout: "30s".to_string(),
        }
    }
}

/// 证书颁发机构配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// 是否启用证书刷新
    pub enabled: bool,
    /// 证书颁发机构地址
    pub url: String,
    /// 本机地址
    pub ip: String,
    /// 本机主机名
    pub hostname: String,
    /// 申请的证书有效期
    pub lease_duration: String,
    /// 响应中没有过期时间时的刷新间隔
    pub default_refresh: String,
    /// 刷新失败后的重试间隔
    pub retry_interval: String,
    /// 请求超时
    pub timeout: String,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: DEFAULT_AUTHORITY_URL.to_string(),
            ip: String::new(),
            hostname: String::new(),
            lease_duration: "1h".to_string(),
            default_refresh: "30m".to_string(),
            retry_interval: "10s".to_string(),
            timeout: "30s".to_string(),
        }
    }
}

impl AuthorityConfig {
    /// 证书颁发机构客户端配置
    pub fn client_config(&self) -> Result<AuthorityClientConfig> {
        Ok(AuthorityClientConfig {
            url: self.url.clone(),
            lease_duration: parse_duration_or("authority lease duration", &self.lease_duration, DEFAULT_LEASE_DURATION)?,
            timeout: parse_duration_or("authority timeout", &self.timeout, DEFAULT_REQUEST_TIMEOUT)?,
        })
    }

    /// 默认刷新间隔与重试间隔
    pub fn intervals(&self) -> Result<(Duration, Duration)> {
        Ok((
            parse_interval("authority default refresh", &self.default_refresh, DEFAULT_REFRESH_INTERVAL)?,
            parse_interval("authority retry interval", &self.retry_interval, DEFAULT_RETRY_INTERVAL)?,
        ))
    }

    /// 本机身份
    pub fn identity(&self) -> Result<SelfIdentity> {
        let hostname = get_actual_value(&self.hostname);
        if hostname.is_empty() {
            return Err(Error::Config("证书颁发机构配置缺少 hostname".to_string()));
        }

        Ok(SelfIdentity {
            address: get_actual_value(&self.ip),
            hostname,
        })
    }
}

/// 配置管理器
pub struct ConfigManager {
    /// 配置文件路径
    config_path: PathBuf,
    /// 当前配置
    config: SidecarConfig,
}

impl ConfigManager {
    /// 创建新的配置管理器
    pub fn new(config_path: &str) -> Result<Self> {
        let config_path = PathBuf::from(config_path);
        let config = Self::load_config(&config_path)?;

        info!("从 {:?} 加载配置成功", config_path);
        Ok(Self {
            config_path,
            config,
        })
    }

    /// 加载配置文件
    fn load_config(config_path: &Path) -> Result<SidecarConfig> {
        let config_file = config_path
            .to_str()
            .ok_or_else(|| Error::Config("配置路径无效".to_string()))?;

        // 确定配置文件格式
        let format = match config_path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => {
                return Err(Error::Config(
                    "不支持的配置文件格式，仅支持 YAML 或 JSON".to_string(),
                ))
            }
        };

        let config = Config::builder()
            .add_source(File::new(config_file, format))
            .build()
            .map_err(|e| Error::Config(format!("无法加载配置文件 {}: {}", config_file, e)))?;

        config
            .try_deserialize::<SidecarConfig>()
            .map_err(|e| Error::Config(format!("配置格式错误: {}", e)))
    }

    /// 配置文件路径
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 获取完整配置
    pub fn get_config(&self) -> &SidecarConfig {
        &self.config
    }

    /// 取出配置
    pub fn into_config(self) -> SidecarConfig {
        self.config
    }
}

/// 创建默认配置
pub fn create_default_config() -> SidecarConfig {
    SidecarConfig {
        server: ServerConfig::default(),
        token: TokenConfig {
            athenz_domain: "_ATHENZ_DOMAIN_".to_string(),
            service_name: "_SERVICE_NAME_".to_string(),
            private_key_path: "_ATHENZ_PRIVATE_KEY_".to_string(),
            key_version: "1".to_string(),
            refresh_duration: "30m".to_string(),
            expiration: "1h".to_string(),
            hostname: "_HOSTNAME_".to_string(),
            ip: "_POD_IP_".to_string(),
        },
        role: RoleConfig::default(),
        authority: AuthorityConfig::default(),
        log_level: "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            r#"
server:
  port: 8443
  health_check_path: /ready
  tls:
    enabled: true
    cert: _TLS_CERT_
    key: _TLS_KEY_
token:
  athenz_domain: tenant.domain
  service_name: sidecar
  private_key_path: /etc/keys/private.pem
  key_version: "2"
  refresh_duration: 1m
  expiration: 1h
authority:
  enabled: true
  hostname: host.example.jp
  ip: 10.0.0.1
log_level: debug
"#,
        )
        .unwrap();

        let manager = ConfigManager::new(path.to_str().unwrap()).unwrap();
        assert_eq!(manager.config_path(), path.as_path());
        let config = manager.get_config();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.health_check_path, "/ready");
        assert!(config.server.tls.enabled);
        assert_eq!(config.server.tls.options().certificate_path, "_TLS_CERT_");
        assert_eq!(config.token.key_version, "2");
        assert_eq!(config.log_level, "debug");

        // 未配置的字段使用默认值
        assert_eq!(config.server.shutdown_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(config.role.url, DEFAULT_ROLE_URL);
        assert_eq!(config.authority.url, DEFAULT_AUTHORITY_URL);

        let identity = config.authority.identity().unwrap();
        assert_eq!(identity.hostname, "host.example.jp");
        assert_eq!(identity.address, "10.0.0.1");
    }

    #[test]
    fn test_load_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"server": {"port": 9000}, "log_level": "warn"}"#).unwrap();

        let config = ConfigManager::new(path.to_str().unwrap()).unwrap().into_config();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.health_check_path, "/healthz");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_unsupported_or_missing_config() {
        assert!(matches!(ConfigManager::new("/tmp/config.toml"), Err(Error::Config(_))));
        assert!(matches!(
            ConfigManager::new("/tmp/tenant-sidecar-missing.yaml"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_authority_config() {
        let authority = AuthorityConfig::default();
        let client = authority.client_config().unwrap();
        assert_eq!(client.lease_duration, Duration::from_secs(3600));
        assert_eq!(authority.intervals().unwrap(), (Duration::from_secs(1800), Duration::from_secs(10)));

        // 没有主机名时无法确定本机身份
        assert!(matches!(authority.identity(), Err(Error::Config(_))));

        let authority = AuthorityConfig {
            retry_interval: "soon".to_string(),
            ..Default::default()
        };
        assert!(matches!(authority.intervals(), Err(Error::InvalidDuration { .. })));

        // 超出时间范围的刷新间隔在加载时拒绝
        let authority = AuthorityConfig {
            default_refresh: "300000years".to_string(),
            ..Default::default()
        };
        match authority.intervals() {
            Err(Error::InvalidDuration { field, .. }) => assert_eq!(field, "authority default refresh"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
