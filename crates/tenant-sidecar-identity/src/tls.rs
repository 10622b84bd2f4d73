//! mTLS 配置模块
//!
//! 该模块根据证书、私钥和信任锚文件构建服务端 TLS 策略。策略固定加固：
//! 最低 TLS 1.2，限定密钥交换曲线，禁用会话票据。
//! 只有提供了信任锚时才要求并验证客户端证书。

use rustls::kx_group::{SECP256R1, SECP384R1, X25519};
use rustls::server::{AllowAnyAuthenticatedClient, NoServerSessionStorage};
use rustls::version::{TLS12, TLS13};
use rustls::{
    Certificate as TlsCertificate, NamedGroup, PrivateKey, ProtocolVersion, RootCertStore,
    ServerConfig, SupportedKxGroup, SupportedProtocolVersion,
};
use rustls_pemfile::Item;
use std::fmt;
use std::fs;
use std::io::{self, BufReader};
use std::sync::Arc;
use tracing::{debug, info};

use tenant_sidecar_common::{CredentialArtifact, Error, Result};

use crate::utils::get_actual_value;

/// 最低协议版本
pub const MIN_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::TLSv1_2;

/// 允许的密钥交换曲线，按优先顺序排列
pub static ALLOWED_KX_GROUPS: [&SupportedKxGroup; 3] = [&SECP256R1, &SECP384R1, &X25519];

static PROTOCOL_VERSIONS: [&SupportedProtocolVersion; 2] = [&TLS13, &TLS12];

/// 客户端证书验证模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMode {
    /// 不要求客户端证书
    None,
    /// 要求并验证客户端证书
    RequireAndVerify,
}

/// TLS 文件配置
///
/// 每个值可以是文件路径，也可以是 `_NAME_` 形式的环境变量引用。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// 证书路径
    pub certificate_path: String,
    /// 私钥路径
    pub private_key_path: String,
    /// 信任锚（CA）路径，可为空
    pub trust_anchor_path: String,
}

/// 构建完成的 TLS 策略，构建后不可变
#[derive(Clone)]
pub struct TlsPolicy {
    min_protocol_version: ProtocolVersion,
    allowed_curves: Vec<NamedGroup>,
    session_tickets_enabled: bool,
    identity_certificates: Vec<TlsCertificate>,
    private_key: PrivateKey,
    trusted_ca_pool: Option<RootCertStore>,
    client_auth_mode: ClientAuthMode,
}

impl TlsPolicy {
    /// 最低协议版本
    pub fn min_protocol_version(&self) -> ProtocolVersion {
        self.min_protocol_version
    }

    /// 允许的曲线，按优先顺序
    pub fn allowed_curves(&self) -> &[NamedGroup] {
        &self.allowed_curves
    }

    /// 是否签发会话票据
    pub fn session_tickets_enabled(&self) -> bool {
        self.session_tickets_enabled
    }

    /// 服务端证书链
    pub fn identity_certificates(&self) -> &[TlsCertificate] {
        &self.identity_certificates
    }

    /// 验证客户端证书使用的信任锚
    pub fn trusted_ca_pool(&self) -> Option<&RootCertStore> {
        self.trusted_ca_pool.as_ref()
    }

    /// 客户端证书验证模式
    pub fn client_auth_mode(&self) -> ClientAuthMode {
        self.client_auth_mode
    }

    /// 生成 rustls 服务端配置
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let builder = ServerConfig::builder()
            .with_cipher_suites(rustls::DEFAULT_CIPHER_SUITES)
            .with_kx_groups(&ALLOWED_KX_GROUPS)
            .with_protocol_versions(&PROTOCOL_VERSIONS)
            .map_err(|e| Error::Tls(e.to_string()))?;

        let builder = match &self.trusted_ca_pool {
            Some(roots) => builder
                .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots.clone()).boxed()),
            None => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(self.identity_certificates.clone(), self.private_key.clone())
            .map_err(|e| Error::Tls(e.to_string()))?;

        // 不保存会话状态，每次连接都完整握手
        config.session_storage = Arc::new(NoServerSessionStorage {});
        config.send_tls13_tickets = 0;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("min_protocol_version", &self.min_protocol_version)
            .field("allowed_curves", &self.allowed_curves)
            .field("session_tickets_enabled", &self.session_tickets_enabled)
            .field("identity_certificates", &self.identity_certificates.len())
            .field("trusted_ca_pool", &self.trusted_ca_pool.as_ref().map(RootCertStore::len))
            .field("client_auth_mode", &self.client_auth_mode)
            .finish()
    }
}

/// 构建 TLS 策略
pub fn build_tls_policy(options: &TlsOptions) -> Result<TlsPolicy> {
    let certificate_path = get_actual_value(&options.certificate_path);
    let private_key_path = get_actual_value(&options.private_key_path);
    if certificate_path.is_empty() || private_key_path.is_empty() {
        return Err(Error::MissingCredential);
    }

    let identity_certificates = load_certificates(&certificate_path)?;
    let private_key = load_private_key(&private_key_path)?;

    let trust_anchor_path = get_actual_value(&options.trust_anchor_path);
    let (trusted_ca_pool, client_auth_mode) = if trust_anchor_path.is_empty() {
        (None, ClientAuthMode::None)
    } else {
        (Some(load_trust_pool(&trust_anchor_path)?), ClientAuthMode::RequireAndVerify)
    };

    info!(
        certificate = %certificate_path,
        client_auth = ?client_auth_mode,
        "TLS 策略已构建"
    );

    Ok(TlsPolicy {
        min_protocol_version: MIN_PROTOCOL_VERSION,
        allowed_curves: ALLOWED_KX_GROUPS.iter().map(|group| group.name).collect(),
        session_tickets_enabled: false,
        identity_certificates,
        private_key,
        trusted_ca_pool,
        client_auth_mode,
    })
}

/// 加载信任锚证书池
///
/// 路径为空或文件不存在时返回 I/O 错误，文件中没有有效证书时返回 `Error::TrustAnchor`。
pub fn load_trust_pool(path: &str) -> Result<RootCertStore> {
    if path.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "open : no such file or directory",
        )));
    }

    let pem = fs::read(path)?;
    let ders = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .map_err(|_| Error::TrustAnchor)?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&ders);
    if added == 0 {
        return Err(Error::TrustAnchor);
    }

    debug!(path, added, ignored, "信任锚已加载");
    Ok(roots)
}

fn load_certificates(path: &str) -> Result<Vec<TlsCertificate>> {
    let pem = fs::read(path)?;
    let ders = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice())).map_err(|e| {
        Error::CredentialParse {
            artifact: CredentialArtifact::Certificate,
            reason: e.to_string(),
        }
    })?;

    if ders.is_empty() {
        return Err(Error::CredentialParse {
            artifact: CredentialArtifact::Certificate,
            reason: "failed to find any PEM data in certificate input".to_string(),
        });
    }

    Ok(ders.into_iter().map(TlsCertificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let pem = fs::read(path)?;
    let items = rustls_pemfile::read_all(&mut BufReader::new(pem.as_slice())).map_err(|e| {
        Error::CredentialParse {
            artifact: CredentialArtifact::PrivateKey,
            reason: e.to_string(),
        }
    })?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| Error::CredentialParse {
            artifact: CredentialArtifact::PrivateKey,
            reason: "failed to find any PEM data in key input".to_string(),
        })
}
