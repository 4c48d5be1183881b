/// PLC通信相关模块

/// 通信结果与错误分类
pub mod plc_result;

/// 设备网关接口与重试装饰器
pub mod device_gateway;

/// Modbus 地址与浮点编解码
pub mod modbus_codec;

/// Modbus TCP 网关实现
pub mod modbus_gateway;

/// 内存测试台架（用于开发和测试）
pub mod mock_gateway;

pub use device_gateway::{ConnectionStats, DeviceInfo, GatewayRetryPolicy, IDeviceGateway, RetryingGateway};
pub use mock_gateway::{BenchOperation, BenchOperationKind, BenchSide, FaultInjection, MockDeviceGateway, MockTestBench};
pub use modbus_gateway::ModbusTcpGateway;
pub use plc_result::{GatewayErrorKind, PlcResult};
