//! Tenant Sidecar 身份凭证层
//!
//! 该模块负责从证书颁发机构获取短期证书并缓存，按最早过期时间调度刷新，
//! 以及根据证书、私钥和信任锚文件构建加固的 mTLS 配置。

pub mod authority;
pub mod provider;
pub mod tls;
pub mod utils;

pub use authority::{
    AuthorityClient, AuthorityClientConfig, CertificateAuthority, CertificateBundle,
    CredentialCache, IssuedCertificate, LogObserver, RefreshObserver, SelfIdentity,
};
pub use provider::{CertProvider, TokenProvider};
pub use tls::{build_tls_policy, load_trust_pool, ClientAuthMode, TlsOptions, TlsPolicy};
