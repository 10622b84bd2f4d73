//! 凭证提供者接口
//!
//! 下游组件通过这些单方法接口获取令牌和证书，而不直接访问缓存。
//! 闭包自动实现这些接口，测试中可以直接传入闭包作为替身。

use tenant_sidecar_common::{Certificate, Result};

/// 提供访问证书颁发机构所需的主体令牌
pub trait TokenProvider: Send + Sync {
    /// 获取当前令牌
    fn token(&self) -> Result<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Result<String> + Send + Sync,
{
    fn token(&self) -> Result<String> {
        self()
    }
}

/// 按身份提供证书
pub trait CertProvider: Send + Sync {
    /// 获取指定身份的证书，不存在时返回 `Error::NotFound`
    fn certificate(&self, identity: &str) -> Result<Certificate>;
}

impl<F> CertProvider for F
where
    F: Fn(&str) -> Result<Certificate> + Send + Sync,
{
    fn certificate(&self, identity: &str) -> Result<Certificate> {
        self(identity)
    }
}
