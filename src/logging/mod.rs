//! # 日志记录模块 (Logging Module)
//!
//! ## 业务说明
//! 统一使用 `log` 门面 + `env_logger` 后端输出日志，
//! 默认级别来自 [`LoggingConfig`]，`RUST_LOG` 环境变量存在时以其为准
//!
//! ## 日志策略
//! 只对四类核心事件提供便捷宏，避免日志冗余：
//! - **通讯失败**: 网关最终失败（已耗尽重试）
//! - **测试失败**: 通道硬点或人工测试判定失败
//! - **状态转换**: 批次阶段变化
//! - **用户操作**: 操作员确认、取消、重测等

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;

use crate::utils::config::LoggingConfig;
use crate::utils::error::{AppError, AppResult};

static SHOW_MODULE_PATH: AtomicBool = AtomicBool::new(false);
static LEVEL_FROM_ENV: AtomicBool = AtomicBool::new(false);

/// 初始化全局日志
///
/// 启动时先用默认配置初始化，保证加载配置期间的日志不丢失；
/// 配置加载完成后再调用 [`apply_logging_config`] 调整级别和格式。
/// 重复初始化返回配置错误，调用方可以选择忽略
pub fn init_logging(config: &LoggingConfig) -> AppResult<()> {
    let level = parse_level(&config.log_level)?;
    SHOW_MODULE_PATH.store(config.show_module_path, Ordering::Relaxed);

    // 后端放行全部级别，实际级别由 log::set_max_level 控制，便于运行时调整
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Trace);
    let env_filters = std::env::var("RUST_LOG").ok();
    if let Some(filters) = &env_filters {
        builder.parse_filters(filters);
    }
    builder.format(|buf, record| {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if SHOW_MODULE_PATH.load(Ordering::Relaxed) {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                now,
                record.level(),
                record.module_path().unwrap_or("-"),
                record.args()
            )
        } else {
            writeln!(buf, "{} [{}] {}", now, record.level(), record.args())
        }
    });

    builder
        .try_init()
        .map_err(|e| AppError::configuration_error(format!("日志系统初始化失败: {}", e)))?;

    LEVEL_FROM_ENV.store(env_filters.is_some(), Ordering::Relaxed);
    if env_filters.is_none() {
        log::set_max_level(level);
    }
    log::info!("日志系统初始化完成，级别: {}", log::max_level());
    Ok(())
}

/// 按加载后的配置调整日志级别与格式
///
/// 设置了 `RUST_LOG` 时级别以环境变量为准，只调整格式
pub fn apply_logging_config(config: &LoggingConfig) -> AppResult<()> {
    let level = parse_level(&config.log_level)?;
    SHOW_MODULE_PATH.store(config.show_module_path, Ordering::Relaxed);
    if !LEVEL_FROM_ENV.load(Ordering::Relaxed) {
        log::set_max_level(level);
    }
    log::debug!("日志配置已应用，级别: {}", log::max_level());
    Ok(())
}

fn parse_level(level: &str) -> AppResult<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::configuration_error(format!("无效的日志级别: {}", level)))
}

/// 记录通讯失败日志
#[macro_export]
macro_rules! log_communication_failure {
    ($msg:expr) => {
        log::error!("[通讯失败] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::error!("[通讯失败] {}", format!($msg, $($arg)*));
    };
}

/// 记录测试执行失败日志
#[macro_export]
macro_rules! log_test_failure {
    ($msg:expr) => {
        log::warn!("[测试失败] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::warn!("[测试失败] {}", format!($msg, $($arg)*));
    };
}

/// 记录批次状态转换日志
#[macro_export]
macro_rules! log_state_transition {
    ($msg:expr) => {
        log::info!("[状态转换] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::info!("[状态转换] {}", format!($msg, $($arg)*));
    };
}

/// 记录用户操作日志
#[macro_export]
macro_rules! log_user_operation {
    ($msg:expr) => {
        log::info!("[用户操作] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::info!("[用户操作] {}", format!($msg, $($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_accepts_config_values() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_level("WARN").unwrap(), LevelFilter::Warn);
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn test_apply_logging_config_adjusts_level_after_startup() {
        let mut config = LoggingConfig {
            log_level: "warn".to_string(),
            ..LoggingConfig::default()
        };
        apply_logging_config(&config).unwrap();
        assert_eq!(log::max_level(), LevelFilter::Warn);

        config.log_level = "debug".to_string();
        config.show_module_path = true;
        apply_logging_config(&config).unwrap();
        assert_eq!(log::max_level(), LevelFilter::Debug);
        assert!(SHOW_MODULE_PATH.load(Ordering::Relaxed));

        config.log_level = "loud".to_string();
        assert!(apply_logging_config(&config).is_err());
        assert_eq!(log::max_level(), LevelFilter::Debug, "无效级别不应该改变当前级别");
    }
}
