//! 错误处理模块
//!
//! 该模块提供 Tenant Sidecar 的统一错误类型。错误按照处理方式分类：
//! 构造阶段的配置与凭证错误是致命的，运行期的传输与解析错误可以恢复，
//! 监听器故障会终止整个运行周期。

use std::fmt;
use std::io;
use thiserror::Error;

/// 无法解码的凭证文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialArtifact {
    /// 证书文件
    Certificate,
    /// 私钥文件
    PrivateKey,
}

impl fmt::Display for CredentialArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialArtifact::Certificate => write!(f, "certificate"),
            CredentialArtifact::PrivateKey => write!(f, "private key"),
        }
    }
}

/// Tenant Sidecar 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 持续时间字符串无效
    #[error("invalid {field} {value}: {reason}")]
    InvalidDuration {
        /// 出错的配置字段
        field: String,
        /// 原始配置值
        value: String,
        /// 解析失败原因
        reason: String,
    },

    /// 缺少证书或私钥路径
    #[error("cert/key path not found")]
    MissingCredential,

    /// 证书或私钥无法解码
    #[error("failed to decode {artifact}: {reason}")]
    CredentialParse {
        /// 出错的文件类型
        artifact: CredentialArtifact,
        /// 解码失败原因
        reason: String,
    },

    /// 信任锚文件中没有有效证书
    #[error("certification failed")]
    TrustAnchor,

    /// 私钥文件无法读取
    #[error("invalid token certificate {path}: {source}")]
    KeyLoad {
        /// 私钥路径
        path: String,
        /// 底层 I/O 错误
        #[source]
        source: io::Error,
    },

    /// 令牌构造器创建失败
    #[error("failed to create token builder\nAthenzDomain:\t{domain}\nServiceName:\t{service}\nKeyVersion:\t{key_version}\nError: {reason}")]
    TokenBuilder {
        /// 域名
        domain: String,
        /// 服务名
        service: String,
        /// 密钥版本
        key_version: String,
        /// 失败原因
        reason: String,
    },

    /// 与证书颁发机构的通信失败
    #[error("传输错误: {0}")]
    Transport(String),

    /// 远端返回非成功状态码
    #[error("GET {url} returned status code {status}")]
    Status {
        /// 请求地址
        url: String,
        /// HTTP 状态码
        status: u16,
    },

    /// 响应或证书内容解析失败
    #[error("解析错误: {0}")]
    Parse(String),

    /// 缓存中不存在该身份的证书
    #[error("certification not found: {0}")]
    NotFound(String),

    /// 网络监听器故障
    #[error("监听器错误: {0}")]
    Listener(String),

    /// 运行周期被取消
    #[error("context canceled")]
    Cancelled,

    /// TLS 配置错误
    #[error("TLS 错误: {0}")]
    Tls(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 是否为"未找到"结果
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// 是否为取消信号
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// 是否为致命错误
    ///
    /// 构造阶段的错误和监听器故障不会重试；传输、解析和未找到错误可以恢复。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidDuration { .. }
                | Error::MissingCredential
                | Error::CredentialParse { .. }
                | Error::TrustAnchor
                | Error::KeyLoad { .. }
                | Error::TokenBuilder { .. }
                | Error::Listener(_)
                | Error::Tls(_)
        )
    }
}

/// Tenant Sidecar 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
