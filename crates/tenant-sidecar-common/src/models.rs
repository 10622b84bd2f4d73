//! 数据模型
//!
//! 包含证书等共享数据结构。

pub mod certificate;
