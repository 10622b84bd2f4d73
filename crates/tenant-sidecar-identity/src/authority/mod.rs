//! 证书颁发机构与证书缓存
//!
//! 包含证书颁发机构客户端和按过期时间刷新的证书缓存。

mod authority_client;
mod credential_cache;

pub use authority_client::{
    decode_certificates, AuthorityClient, AuthorityClientConfig, CertificateAuthority,
    CertificateBundle, IssuedCertificate, DEFAULT_AUTHORITY_URL, DEFAULT_LEASE_DURATION,
    DEFAULT_REQUEST_TIMEOUT, PRINCIPAL_AUTH_HEADER,
};
pub use credential_cache::{
    CredentialCache, LogObserver, RefreshObserver, SelfIdentity, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_RETRY_INTERVAL,
};

use std::sync::Arc;
use tenant_sidecar_common::Result;

use crate::provider::TokenProvider;

/// 创建基于 HTTP 证书颁发机构的证书缓存
pub fn create_credential_cache(
    config: AuthorityClientConfig,
    identity: SelfIdentity,
    token: Arc<dyn TokenProvider>,
) -> Result<CredentialCache> {
    let client = AuthorityClient::new(config, token)?;
    Ok(CredentialCache::new(Arc::new(client), identity))
}
