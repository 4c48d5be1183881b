/// 工具模块
/// 包含错误处理、配置管理等通用功能

pub mod error;
pub mod config;

pub use error::{AppError, AppResult};
pub use config::{AppConfig, ConfigManager, LoggingConfig, PersistenceConfig, PlcConnectionConfig, TestConfig};
