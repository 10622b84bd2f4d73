//! 证书颁发机构客户端模块
//!
//! 该模块实现与证书颁发机构的通信：以主体令牌认证，请求本机主机名下所有身份的
//! 短期证书，并解码 XML 格式的多证书响应。

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use tenant_sidecar_common::{Error, Result};

use crate::provider::TokenProvider;

/// 默认的证书颁发机构地址
pub const DEFAULT_AUTHORITY_URL: &str = "https://zts.athenz.yahoo.co.jp:4443/wsca/v1";

/// 携带主体令牌的请求头
pub const PRINCIPAL_AUTH_HEADER: &str = "Yahoo-Principal-Auth";

/// 默认申请的证书有效期
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60 * 60);

/// 默认请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 证书颁发机构客户端配置
#[derive(Debug, Clone)]
pub struct AuthorityClientConfig {
    /// 证书颁发机构基础地址
    pub url: String,
    /// 申请的证书有效期
    pub lease_duration: Duration,
    /// 请求超时
    pub timeout: Duration,
}

impl Default for AuthorityClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_AUTHORITY_URL.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// 颁发给某个身份的证书
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// 身份（应用 ID）
    pub identity: String,
    /// 证书内容
    pub payload: String,
}

/// 一次请求返回的全部证书
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateBundle {
    /// 查询的主机名
    pub hostname: String,
    /// 证书列表
    pub certificates: Vec<IssuedCertificate>,
}

/// 证书颁发机构
///
/// 缓存只依赖该接口，测试中可以替换为内存实现。
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// 获取指定主机名下所有身份的证书，`address` 用于颁发机构侧的范围限定
    async fn fetch_certificates(&self, hostname: &str, address: &str) -> Result<CertificateBundle>;
}

#[derive(Debug, Deserialize)]
struct CertificatesDocument {
    #[serde(rename = "@hostname", default)]
    hostname: String,
    #[serde(rename = "certificate", default)]
    certificates: Vec<CertificateElement>,
}

#[derive(Debug, Deserialize)]
struct CertificateElement {
    #[serde(rename = "@appid")]
    appid: String,
    #[serde(rename = "$text", default)]
    payload: String,
}

/// 解码证书颁发机构的 XML 响应
pub fn decode_certificates(body: &str) -> Result<CertificateBundle> {
    let document: CertificatesDocument = quick_xml::de::from_str(body)
        .map_err(|e| Error::Parse(format!("无法解码证书响应: {}", e)))?;

    Ok(CertificateBundle {
        hostname: document.hostname,
        certificates: document
            .certificates
            .into_iter()
            .map(|element| IssuedCertificate {
                identity: element.appid,
                payload: element.payload.trim().to_string(),
            })
            .collect(),
    })
}

/// 基于 HTTP 的证书颁发机构客户端
pub struct AuthorityClient {
    /// 客户端配置
    config: AuthorityClientConfig,
    /// HTTP 客户端
    http: reqwest::Client,
    /// 主体令牌提供者
    token: Arc<dyn TokenProvider>,
}

impl AuthorityClient {
    /// 创建新的证书颁发机构客户端
    pub fn new(config: AuthorityClientConfig, token: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self { config, http, token })
    }

    /// 构造请求地址：`<url>/caontainercerts/mh/<hostname>?d=<秒>&ip=<地址>`
    pub fn request_url(&self, hostname: &str, address: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| Error::Config(format!("无效的证书颁发机构地址 {}: {}", self.config.url, e)))?;

        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("无效的证书颁发机构地址: {}", self.config.url)))?
            .pop_if_empty()
            .extend(["caontainercerts", "mh", hostname]);

        url.query_pairs_mut()
            .append_pair("d", &self.config.lease_duration.as_secs().to_string())
            .append_pair("ip", address);

        Ok(url)
    }
}

#[async_trait]
impl CertificateAuthority for AuthorityClient {
    async fn fetch_certificates(&self, hostname: &str, address: &str) -> Result<CertificateBundle> {
        let url = self.request_url(hostname, address)?;
        let token = self.token.token()?;

        debug!(url = %url, "请求证书颁发机构");
        let response = self
            .http
            .get(url.clone())
            .header(PRINCIPAL_AUTH_HEADER, token)
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
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        decode_certificates(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<certificates hostname="host.example.jp">
  <certificate appid="app.one">v=Y1;a=app.one;k=1700000000;s=sig1</certificate>
  <certificate appid="app.two">v=Y1;a=app.two;k=1700000600;s=sig2</certificate>
</certificates>"#;

    fn client(url: &str) -> AuthorityClient {
        let config = AuthorityClientConfig {
            url: url.to_string(),
            ..Default::default()
        };
        let token = Arc::new(|| -> Result<String> { Ok("principal-token".to_string()) });
        AuthorityClient::new(config, token).unwrap()
    }

    #[test]
    fn test_decode_certificates() {
        let bundle = decode_certificates(RESPONSE).unwrap();
        assert_eq!(bundle.hostname, "host.example.jp");
        assert_eq!(bundle.certificates.len(), 2);
        assert_eq!(bundle.certificates[0].identity, "app.one");
        assert_eq!(bundle.certificates[0].payload, "v=Y1;a=app.one;k=1700000000;s=sig1");
        assert_eq!(bundle.certificates[1].identity, "app.two");
    }

    #[test]
    fn test_decode_empty_and_invalid() {
        let bundle = decode_certificates(r#"<certificates hostname="host"></certificates>"#).unwrap();
        assert!(bundle.certificates.is_empty());

        let truncated = r#"<certificates hostname="host"><certificate appid="a">k=1</certificates>"#;
        assert!(matches!(decode_certificates(truncated), Err(Error::Parse(_))));
    }

    #[test]
    fn test_request_url() {
        let client = client("https://authority.example.jp:4443/wsca/v1");
        let url = client.request_url("host.example.jp", "10.0.0.1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://authority.example.jp:4443/wsca/v1/caontainercerts/mh/host.example.jp?d=3600&ip=10.0.0.1"
        );

        // 地址需要转义
        let url = client.request_url("host", "fe80::1%eth0").unwrap();
        assert_eq!(url.query(), Some("d=3600&ip=fe80%3A%3A1%25eth0"));
    }

    #[tokio::test]
    async fn test_fetch_certificates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/caontainercerts/mh/host.example.jp"))
            .and(query_param("d", "3600"))
            .and(query_param("ip", "10.0.0.1"))
            .and(header(PRINCIPAL_AUTH_HEADER, "principal-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RESPONSE))
            .expect(1)
            .mount(&server)
            .await;

        let bundle = client(&server.uri())
            .fetch_certificates("host.example.jp", "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(bundle.certificates.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_certificates_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let result = client(&server.uri())
            .fetch_certificates("host.example.jp", "10.0.0.1")
            .await;
        assert!(matches!(result, Err(Error::Status { status: 403, .. })));
    }

    #[tokio::test]
    async fn test_fetch_certificates_token_error() {
        let config = AuthorityClientConfig {
            url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let client = AuthorityClient::new(
            config,
            Arc::new(|| -> Result<String> { Err(Error::Config("token not ready".to_string())) }),
        )
        .unwrap();

        let result = client.fetch_certificates("host", "10.0.0.1").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
