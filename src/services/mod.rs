/// 服务层模块，包含应用层和领域层的服务定义
///
/// 按照清洁架构原则组织：
/// - Application Layer: 批次编排，协调整个测试流程
/// - Domain Layer: 量程换算、硬点测试、人工测试等核心业务逻辑
/// - Infrastructure Layer: PLC 网关与测试记录存储

/// 应用层服务模块
pub mod application;

/// 领域层服务模块
pub mod domain;

/// 基础设施层服务模块
pub mod infrastructure;

/// 通道分配服务模块
pub mod channel_allocation_service;

pub use application::{BatchEvent, BatchOrchestrator, BatchSession};

pub use domain::{
    ChannelIo, ConfirmationInbox, HardPointExecutor, HardPointOutcome, ItemDrive, ManualTestWorkflow,
    RangeConverter, SignalRoute,
};

pub use channel_allocation_service::{AllocationResult, ChannelAllocationService};

pub use infrastructure::{
    BatchLease, BatchLeaseRegistry, BenchOperation, BenchOperationKind, BenchSide, ConnectionStats, DeviceInfo, FaultInjection, GatewayErrorKind,
    GatewayRetryPolicy, IDeviceGateway, ITestRecordStore, MockDeviceGateway, MockTestBench, ModbusTcpGateway,
    PlcResult, RetryingGateway, SqliteTestRecordStore,
};
