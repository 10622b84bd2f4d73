//! Tenant Sidecar Common - 跨模块共享工具与数据结构
//!
//! 该模块提供 Tenant Sidecar 各组件共享的数据结构和错误处理机制，
//! 包括证书模型、过期时间解析以及统一的错误类型。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::{CredentialArtifact, Error, Result};
pub use models::certificate::*;
