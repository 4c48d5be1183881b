use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// 环境变量前缀，例如 `FAT_TEST_PLC__HOST=192.168.1.10`
pub const ENV_PREFIX: &str = "FAT";

/// 提供给 serde 的默认字节顺序（CDAB）
fn default_byte_order() -> String {
    "CDAB".to_string()
}

/// 应用程序主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 测试PLC（信号源/采集侧）连接配置
    pub test_plc: PlcConnectionConfig,
    /// 被测PLC连接配置
    pub target_plc: PlcConnectionConfig,
    /// 测试参数配置
    pub test_config: TestConfig,
    /// 日志配置
    pub logging_config: LoggingConfig,
    /// 数据存储配置
    pub persistence_config: PersistenceConfig,
}

/// 单个PLC的连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConnectionConfig {
    /// 连接名称（用于日志）
    pub name: String,
    pub host: String,
    pub port: u16,
    pub slave_id: u8,
    /// 浮点数字节顺序（ABCD / CDAB / BADC / DCBA）
    #[serde(default = "default_byte_order")]
    pub byte_order: String,
    /// 通讯地址是否从0开始
    pub zero_based_address: bool,
    /// 建立连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 单次读写超时时间（毫秒）
    pub operation_timeout_ms: u64,
    /// 瞬时故障的最大尝试次数（含首次）
    pub retry_count: u32,
    /// 重试间隔（毫秒，固定间隔）
    pub retry_interval_ms: u64,
}

impl Default for PlcConnectionConfig {
    fn default() -> Self {
        Self {
            name: "PLC".to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            slave_id: 1,
            byte_order: default_byte_order(),
            zero_based_address: false,
            connection_timeout_ms: 3000,
            operation_timeout_ms: 2000,
            retry_count: 3,
            retry_interval_ms: 1000,
        }
    }
}

/// 测试执行参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// 模拟量写入后的稳定时间（毫秒）
    pub analog_stabilization_time_ms: u64,
    /// 数字量写入后的稳定时间（毫秒）
    pub digital_stabilization_time_ms: u64,
    /// 模拟量允许偏差（量程百分比）
    pub analog_tolerance_percent: f64,
    /// 报警测试时越过设定值的偏移量（量程百分比）
    pub alarm_offset_percent: f64,
    /// 报警触发后等待反馈的时间（毫秒）
    pub alarm_test_wait_time_ms: u64,
    /// 显示值核对时写入的百分比
    pub show_value_percent: f64,
    /// 是否对所有通道进行显示值人工核对
    pub require_show_value_check: bool,
    /// 保存失败后重试前的等待时间（毫秒）
    pub persistence_retry_delay_ms: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            analog_stabilization_time_ms: 2000,
            digital_stabilization_time_ms: 500,
            analog_tolerance_percent: 1.0,
            alarm_offset_percent: 5.0,
            alarm_test_wait_time_ms: 3000,
            show_value_percent: 50.0,
            require_show_value_check: true,
            persistence_retry_delay_ms: 200,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 是否在日志中输出模块路径
    pub show_module_path: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            show_module_path: false,
        }
    }
}

/// 数据存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite 数据库文件路径
    pub database_path: PathBuf,
    /// 启动时是否执行旧哨兵值迁移
    pub migrate_legacy_sentinels_on_startup: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/fat_test.db"),
            migrate_legacy_sentinels_on_startup: true,
        }
    }
}

/// 配置管理器
///
/// 加载顺序：内置默认值 → JSON 配置文件 → `FAT_` 前缀环境变量
pub struct ConfigManager {
    config: AppConfig,
    config_file_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_file_path: impl Into<PathBuf>) -> Self {
        Self {
            config: AppConfig::default(),
            config_file_path: config_file_path.into(),
        }
    }

    pub fn config_file_path(&self) -> &Path {
        &self.config_file_path
    }

    /// 从配置文件与环境变量加载配置
    ///
    /// 配置文件不存在时会先写出一份默认配置
    pub async fn load(&mut self) -> AppResult<()> {
        if !self.config_file_path.exists() {
            log::info!("配置文件不存在，写入默认配置: {:?}", self.config_file_path);
            self.save_to_file().await?;
        }

        let settings = config::Config::builder()
            .add_source(
                config::File::from(self.config_file_path.clone())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        self.config = settings
            .try_deserialize()
            .map_err(|e| AppError::configuration_error(format!("解析配置文件失败: {}", e)))?;

        self.validate_config()?;
        log::info!("配置加载完成: {:?}", self.config_file_path);
        Ok(())
    }

    /// 将配置保存到文件
    pub async fn save_to_file(&self) -> AppResult<()> {
        if let Some(parent) = self.config_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    AppError::io_error(format!("创建配置目录失败: {}", e), format!("{:?}", e.kind()))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(&self.config)?;

        tokio::fs::write(&self.config_file_path, content)
            .await
            .map_err(|e| AppError::io_error(format!("写入配置文件失败: {}", e), format!("{:?}", e.kind())))?;

        Ok(())
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    /// 验证配置的有效性
    pub fn validate_config(&self) -> AppResult<()> {
        for plc in [&self.config.test_plc, &self.config.target_plc] {
            if plc.host.is_empty() {
                return Err(AppError::configuration_error(format!("{} 主机地址不能为空", plc.name)));
            }
            if plc.port == 0 {
                return Err(AppError::configuration_error(format!("{} 端口号不能为0", plc.name)));
            }
            if plc.retry_count == 0 {
                return Err(AppError::configuration_error(format!(
                    "{} 重试次数至少为1（包含首次尝试）",
                    plc.name
                )));
            }
            plc.byte_order
                .parse::<crate::models::ByteOrder>()
                .map_err(|e| AppError::configuration_error(format!("{} 字节顺序无效: {}", plc.name, e)))?;
        }

        let test = &self.config.test_config;
        if !(test.analog_tolerance_percent > 0.0 && test.analog_tolerance_percent < 100.0) {
            return Err(AppError::configuration_error(format!(
                "模拟量允许偏差必须在 (0, 100) 之间: {}",
                test.analog_tolerance_percent
            )));
        }
        if !(0.0..=100.0).contains(&test.show_value_percent) {
            return Err(AppError::configuration_error(format!(
                "显示值核对百分比必须在 [0, 100] 之间: {}",
                test.show_value_percent
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging_config.log_level.as_str()) {
            return Err(AppError::configuration_error(format!(
                "无效的日志级别: {}，有效值: {:?}",
                self.config.logging_config.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// 重置为默认配置
    pub fn reset_to_default(&mut self) {
        self.config = AppConfig::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app_config.json");
        let mut manager = ConfigManager::new(&path);

        manager.load().await.expect("加载默认配置应该成功");

        assert!(path.exists(), "应该写出默认配置文件");
        assert_eq!(manager.get_config().test_plc.retry_count, 3);
        assert_eq!(manager.get_config().test_config.analog_tolerance_percent, 1.0);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults_for_missing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app_config.json");
        tokio::fs::write(
            &path,
            r#"{ "target_plc": { "host": "10.0.0.5", "retry_interval_ms": 250 } }"#,
        )
        .await
        .unwrap();

        let mut manager = ConfigManager::new(&path);
        manager.load().await.expect("加载部分配置应该成功");

        let config = manager.get_config();
        assert_eq!(config.target_plc.host, "10.0.0.5");
        assert_eq!(config.target_plc.retry_interval_ms, 250);
        assert_eq!(config.target_plc.port, 502, "未配置的字段应该保持默认值");
        assert_eq!(config.target_plc.byte_order, "CDAB");
    }

    #[test]
    fn test_validate_rejects_zero_retry_budget() {
        let mut manager = ConfigManager::new("unused.json");
        manager.get_config_mut().test_plc.retry_count = 0;
        assert!(manager.validate_config().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_byte_order() {
        let mut manager = ConfigManager::new("unused.json");
        manager.get_config_mut().target_plc.byte_order = "XYZW".to_string();
        assert!(manager.validate_config().is_err());
    }
}
