/// 领域服务层模块
/// 包含核心业务逻辑，不直接持有任何外部资源

/// 量程换算
pub mod range_converter;

/// 通道信号路径
pub mod channel_io;

/// 硬点测试执行器
pub mod hard_point_executor;

/// 人工测试流程
pub mod manual_test_workflow;

pub use channel_io::{ChannelIo, SignalRoute};
pub use hard_point_executor::{HardPointExecutor, HardPointOutcome};
pub use manual_test_workflow::{ConfirmationInbox, ItemDrive, ManualTestWorkflow};
pub use range_converter::RangeConverter;
