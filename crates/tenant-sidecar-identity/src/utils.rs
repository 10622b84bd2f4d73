//! 配置值工具函数
//!
//! 包括环境变量间接引用、持续时间解析和格式化。

use chrono::Utc;
use std::time::Duration;
use tenant_sidecar_common::{Error, Result};

/// 解析配置值中的环境变量引用
///
/// 形如 `_NAME_` 的值会被替换为环境变量 `NAME` 的值（未设置时为空字符串），
/// 其他值原样返回。
pub fn get_actual_value(value: &str) -> String {
    match env_name(value) {
        Some(name) => std::env::var(name).unwrap_or_default(),
        None => value.to_string(),
    }
}

fn env_name(value: &str) -> Option<&str> {
    value
        .strip_prefix('_')
        .and_then(|rest| rest.strip_suffix('_'))
        .filter(|name| !name.is_empty())
}

/// 解析持续时间字符串（如 `30s`、`1m`、`1h`）
///
/// `field` 用于错误信息中标明出错的配置项。
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| Error::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// 解析可选的持续时间，空字符串时返回默认值
pub fn parse_duration_or(field: &str, value: &str, default: Duration) -> Result<Duration> {
    if value.trim().is_empty() {
        return Ok(default);
    }
    parse_duration(field, value)
}

/// 解析调度间隔，空字符串时返回默认值
///
/// 间隔必须能加到当前时间上而不溢出，否则返回 `Error::InvalidDuration`。
pub fn parse_interval(field: &str, value: &str, default: Duration) -> Result<Duration> {
    let interval = parse_duration_or(field, value, default)?;
    let schedulable = chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .is_some();
    if !schedulable {
        return Err(Error::InvalidDuration {
            field: field.to_string(),
            value: value.to_string(),
            reason: "interval out of range".to_string(),
        });
    }
    Ok(interval)
}

/// 格式化持续时间为人类可读的字符串
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();

    if seconds < 60 {
        return format!("{} 秒", seconds);
    }

    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{} 分钟 {} 秒", minutes, seconds % 60);
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} 小时 {} 分钟", hours, minutes % 60);
    }

    let days = hours / 24;
    format!("{} 天 {} 小时", days, hours % 24)
}
