/// FAT 通道测试编排引擎 - 核心库
pub mod models;
pub mod utils;
pub mod logging;
pub mod services;

// 重新导出常用类型，方便使用
pub use models::*;
pub use utils::{AppConfig, AppError, AppResult, ConfigManager};
pub use services::*;
