//! 测试记录检查工具
//!
//! 用法: `fat_test_engine [配置文件路径] [--no-migrate]`
//!
//! 初始化日志、加载配置、打开测试记录库，按需迁移旧哨兵值，
//! 然后以 JSON 输出所有批次的摘要。

use anyhow::Context;
use fat_test_engine::logging::{apply_logging_config, init_logging};
use fat_test_engine::utils::LoggingConfig;
use fat_test_engine::{ConfigManager, ITestRecordStore, SqliteTestRecordStore};

const DEFAULT_CONFIG_PATH: &str = "config/fat_test.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_path = DEFAULT_CONFIG_PATH.to_string();
    let mut skip_migration = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--no-migrate" => skip_migration = true,
            other => config_path = other.to_string(),
        }
    }

    // 先用默认配置初始化日志，加载配置时的输出才不会丢失
    init_logging(&LoggingConfig::default()).context("初始化日志失败")?;

    let mut config_manager = ConfigManager::new(&config_path);
    config_manager
        .load()
        .await
        .with_context(|| format!("加载配置失败: {}", config_path))?;
    let config = config_manager.get_config().clone();

    apply_logging_config(&config.logging_config).context("应用日志配置失败")?;

    let store = SqliteTestRecordStore::open(&config.persistence_config.database_path)
        .await
        .context("打开测试记录库失败")?;

    if config.persistence_config.migrate_legacy_sentinels_on_startup && !skip_migration {
        let migrated = store.migrate_legacy_sentinels().await.context("迁移旧哨兵值失败")?;
        log::info!("旧哨兵值迁移: {} 行", migrated);
    }

    let batches = store.get_all_batches().await.context("读取批次列表失败")?;
    log::info!("共 {} 个批次", batches.len());
    println!("{}", serde_json::to_string_pretty(&batches)?);

    Ok(())
}
