//! 证书模型
//!
//! 证书颁发机构返回的证书内容是不透明字符串，由分号分隔的 `键=值` 字段组成。
//! 其中 `k=<unix 时间戳>` 字段表示过期时间，用于计算下一次刷新时间。

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

use crate::error::{Error, Result};

/// 过期时间字段前缀
pub const EXPIRY_MARKER: &str = "k=";

/// 字段分隔符
pub const FIELD_SEPARATOR: char = ';';

/// 缓存中的证书
///
/// 存入缓存后不可变，刷新时整体替换。
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    /// 证书所属身份（应用 ID）
    identity: String,
    /// 证书内容
    payload: String,
    /// 过期时间，内容中没有可解析的过期字段时为 None
    expires_at: Option<DateTime<Utc>>,
}

impl Certificate {
    /// 创建证书，过期时间从内容中解析
    ///
    /// 过期字段无法解析时视为没有已知过期时间。
    pub fn new(identity: impl Into<String>, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let expires_at = parse_expiry(&payload).ok().flatten();
        Self::with_expiry(identity, payload, expires_at)
    }

    /// 使用已解析的过期时间创建证书
    pub fn with_expiry(
        identity: impl Into<String>,
        payload: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            identity: identity.into(),
            payload: payload.into(),
            expires_at,
        }
    }

    /// 证书所属身份
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 证书内容
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// 过期时间
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// 证书是否已过期，没有已知过期时间的证书永不过期
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| expires_at <= Utc::now())
            .unwrap_or(false)
    }
}

// 证书内容是凭证，不写入日志
impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("identity", &self.identity)
            .field("payload", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// 从证书内容中解析过期时间
///
/// 返回第一个 `k=` 字段的时间；没有该字段时返回 `Ok(None)`，
/// 字段值不是合法的 unix 时间戳时返回解析错误。
pub fn parse_expiry(payload: &str) -> Result<Option<DateTime<Utc>>> {
    let raw = match payload
        .split(FIELD_SEPARATOR)
        .find_map(|field| field.strip_prefix(EXPIRY_MARKER))
    {
        Some(raw) => raw,
        None => return Ok(None),
    };

    let seconds: i64 = raw
        .trim()
        .parse()
        .map_err(|e| Error::Parse(format!("无效的过期时间字段 {:?}: {}", raw, e)))?;

    Utc.timestamp_opt(seconds, 0)
        .single()
        .map(Some)
        .ok_or_else(|| Error::Parse(format!("过期时间超出范围: {}", seconds)))
}
