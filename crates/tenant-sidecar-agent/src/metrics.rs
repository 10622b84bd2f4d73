//! 指标收集与导出模块
//!
//! 记录证书刷新与令牌刷新的结果，并通过 Prometheus 文本格式导出。
//! 同时作为证书缓存的刷新观察者。

use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{error, info};

use tenant_sidecar_common::{Error, Result};
use tenant_sidecar_identity::RefreshObserver;

/// 指标收集器
pub struct SidecarMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 证书刷新成功次数
    cert_refresh_total: IntCounter,
    /// 证书刷新失败次数
    cert_refresh_failures_total: IntCounter,
    /// 当前缓存的证书数
    cached_certificates: IntGauge,
    /// 下一次证书刷新的时间戳
    next_cert_refresh_timestamp: IntGauge,
    /// 令牌刷新失败次数
    token_refresh_failures_total: IntCounter,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Config(format!("创建监控指标失败: {}", e))
}

impl SidecarMetrics {
    /// 创建新的指标收集器
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cert_refresh_total = IntCounter::new(
            "tenant_sidecar_cert_refresh_total",
            "Total number of successful certificate refreshes",
        )
        .map_err(metric_error)?;

        let cert_refresh_failures_total = IntCounter::new(
            "tenant_sidecar_cert_refresh_failures_total",
            "Total number of failed certificate refreshes",
        )
        .map_err(metric_error)?;

        let cached_certificates = IntGauge::new(
            "tenant_sidecar_cached_certificates",
            "Number of certificates currently cached",
        )
        .map_err(metric_error)?;

        let next_cert_refresh_timestamp = IntGauge::new(
            "tenant_sidecar_next_cert_refresh_timestamp_seconds",
            "Unix time of the next scheduled certificate refresh",
        )
        .map_err(metric_error)?;

        let token_refresh_failures_total = IntCounter::new(
            "tenant_sidecar_token_refresh_failures_total",
            "Total number of failed principal token refreshes",
        )
        .map_err(metric_error)?;

        // 注册指标
        registry.register(Box::new(cert_refresh_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(cert_refresh_failures_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(cached_certificates.clone())).map_err(metric_error)?;
        registry.register(Box::new(next_cert_refresh_timestamp.clone())).map_err(metric_error)?;
        registry.register(Box::new(token_refresh_failures_total.clone())).map_err(metric_error)?;

        Ok(Self {
            registry,
            cert_refresh_total,
            cert_refresh_failures_total,
            cached_certificates,
            next_cert_refresh_timestamp,
            token_refresh_failures_total,
        })
    }

    /// 记录一次令牌刷新失败
    pub fn token_refresh_failed(&self) {
        self.token_refresh_failures_total.inc();
    }

    /// 以 Prometheus 文本格式导出全部指标
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Parse(format!("导出监控指标失败: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| Error::Parse(e.to_string()))
    }
}

impl RefreshObserver for SidecarMetrics {
    fn refresh_succeeded(&self, stored: usize, cached: usize, next_refresh_at: DateTime<Utc>) {
        self.cert_refresh_total.inc();
        self.cached_certificates.set(cached as i64);
        self.next_cert_refresh_timestamp.set(next_refresh_at.timestamp());
        info!(stored, cached, next_refresh_at = %next_refresh_at, "证书刷新完成");
    }

    fn refresh_failed(&self, error: &Error) {
        self.cert_refresh_failures_total.inc();
        error!(error = %error, "证书刷新失败，继续使用缓存中的证书");
    }
}
