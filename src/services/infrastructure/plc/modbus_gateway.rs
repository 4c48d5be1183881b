//! Modbus TCP 设备网关
//!
//! 每个实例持有一条 TCP 连接。链路被复位后上下文被丢弃，
//! 下一次读写时自动重建连接；显式断开后不再自动重连。

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use super::device_gateway::{ConnectionStats, DeviceInfo, IDeviceGateway};
use super::modbus_codec::{decode_f32, encode_f32, ModbusAddress, RegisterArea};
use super::plc_result::{GatewayErrorKind, PlcResult};
use crate::models::ByteOrder;
use crate::utils::config::PlcConnectionConfig;
use crate::utils::error::{AppError, AppResult};

/// 单次 Modbus 请求
#[derive(Debug, Clone, Copy)]
enum ModbusRequest {
    ReadFloat(ModbusAddress),
    WriteFloat(ModbusAddress, [u16; 2]),
    ReadBit(ModbusAddress),
    WriteCoil(ModbusAddress, bool),
}

#[derive(Debug)]
enum ModbusResponse {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
    Written,
}

type ModbusReply = Result<Result<ModbusResponse, tokio_modbus::ExceptionCode>, tokio_modbus::Error>;

async fn execute(ctx: &mut Context, request: ModbusRequest) -> ModbusReply {
    Ok(match request {
        ModbusRequest::ReadFloat(addr) => match addr.area {
            RegisterArea::InputRegister => ctx.read_input_registers(addr.offset, 2).await?.map(ModbusResponse::Registers),
            _ => ctx.read_holding_registers(addr.offset, 2).await?.map(ModbusResponse::Registers),
        },
        ModbusRequest::WriteFloat(addr, registers) => ctx
            .write_multiple_registers(addr.offset, &registers)
            .await?
            .map(|_| ModbusResponse::Written),
        ModbusRequest::ReadBit(addr) => match addr.area {
            RegisterArea::DiscreteInput => ctx.read_discrete_inputs(addr.offset, 1).await?.map(ModbusResponse::Bits),
            _ => ctx.read_coils(addr.offset, 1).await?.map(ModbusResponse::Bits),
        },
        ModbusRequest::WriteCoil(addr, value) => ctx
            .write_single_coil(addr.offset, value)
            .await?
            .map(|_| ModbusResponse::Written),
    })
}

/// Modbus TCP 网关
pub struct ModbusTcpGateway {
    config: PlcConnectionConfig,
    byte_order: ByteOrder,
    context: Mutex<Option<Context>>,
    /// 当前是否持有连接
    connected: AtomicBool,
    /// 调用方是否要求保持连接（链路复位后据此自动重连）
    keep_alive: AtomicBool,
    stats: StdMutex<ConnectionStats>,
}

impl ModbusTcpGateway {
    pub fn new(config: PlcConnectionConfig) -> AppResult<Self> {
        let byte_order = config
            .byte_order
            .parse::<ByteOrder>()
            .map_err(AppError::configuration_error)?;
        Ok(Self {
            config,
            byte_order,
            context: Mutex::new(None),
            connected: AtomicBool::new(false),
            keep_alive: AtomicBool::new(false),
            stats: StdMutex::new(ConnectionStats::default()),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn record<T>(&self, result: PlcResult<T>) -> PlcResult<T> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(&result);
        result
    }

    async fn resolve(&self) -> Result<SocketAddr, PlcResult<()>> {
        let endpoint = self.endpoint();
        let resolved = match tokio::net::lookup_host(endpoint.as_str()).await {
            Ok(mut addrs) => addrs.next().ok_or_else(|| {
                PlcResult::err(GatewayErrorKind::Connection, format!("无法解析地址: {}", endpoint))
            }),
            Err(e) => Err(PlcResult::err(GatewayErrorKind::Connection, format!("无法解析地址: {}", endpoint))
                .with_cause(e.to_string())),
        };
        resolved
    }

    /// 在已持有锁的情况下建立连接
    async fn open(&self, slot: &mut Option<Context>) -> PlcResult<()> {
        let socket_addr = match self.resolve().await {
            Ok(addr) => addr,
            Err(result) => return result,
        };
        let slave = Slave(self.config.slave_id);
        let connect_timeout = Duration::from_millis(self.config.connection_timeout_ms);

        match timeout(connect_timeout, tokio_modbus::client::tcp::connect_slave(socket_addr, slave)).await {
            Ok(Ok(ctx)) => {
                *slot = Some(ctx);
                self.connected.store(true, Ordering::SeqCst);
                self.stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .connection_count += 1;
                log::info!("[{}] 已连接到 {}", self.config.name, socket_addr);
                PlcResult::ok(())
            }
            Ok(Err(e)) => PlcResult::err(
                GatewayErrorKind::Connection,
                format!("[{}] 连接 {} 失败", self.config.name, socket_addr),
            )
            .with_cause(e.to_string()),
            Err(_) => PlcResult::err(
                GatewayErrorKind::Timeout,
                format!(
                    "[{}] 连接 {} 超时 ({}ms)",
                    self.config.name, socket_addr, self.config.connection_timeout_ms
                ),
            ),
        }
    }

    /// 执行一次请求并对失败分类
    async fn exchange(&self, operation: &str, request: ModbusRequest) -> PlcResult<ModbusResponse> {
        let mut slot = self.context.lock().await;

        if slot.is_none() {
            if !self.keep_alive.load(Ordering::SeqCst) {
                return PlcResult::err(
                    GatewayErrorKind::NotConnected,
                    format!("[{}] 未连接，无法{}", self.config.name, operation),
                );
            }
            log::info!("[{}] 链路已断开，尝试重新连接", self.config.name);
            let reconnect = self.open(&mut slot).await;
            if reconnect.is_err() {
                return reconnect.map(|_| ModbusResponse::Written);
            }
        }

        let Some(ctx) = slot.as_mut() else {
            return PlcResult::err(GatewayErrorKind::NotConnected, format!("[{}] 未连接", self.config.name));
        };

        let op_timeout = Duration::from_millis(self.config.operation_timeout_ms);
        match timeout(op_timeout, execute(ctx, request)).await {
            Ok(Ok(Ok(response))) => PlcResult::ok(response),
            Ok(Ok(Err(exception))) => PlcResult::err(
                GatewayErrorKind::Protocol,
                format!("[{}] {} 设备返回异常码", self.config.name, operation),
            )
            .with_cause(format!("{:?}", exception)),
            Ok(Err(e)) => {
                *slot = None;
                self.connected.store(false, Ordering::SeqCst);
                PlcResult::err(
                    GatewayErrorKind::LinkReset,
                    format!("[{}] {} 时链路中断", self.config.name, operation),
                )
                .with_cause(e.to_string())
            }
            Err(_) => {
                // 超时后的响应可能错位，丢弃该连接
                *slot = None;
                self.connected.store(false, Ordering::SeqCst);
                PlcResult::err(
                    GatewayErrorKind::Timeout,
                    format!("[{}] {} 超时 ({}ms)", self.config.name, operation, self.config.operation_timeout_ms),
                )
            }
        }
    }

    fn parse_address(&self, address: &str, analog: bool, write: bool) -> Result<ModbusAddress, String> {
        let parsed = ModbusAddress::parse(address, self.config.zero_based_address).map_err(|e| e.to_string())?;
        parsed.check_access(analog, write).map_err(|e| e.to_string())?;
        Ok(parsed)
    }
}

#[async_trait]
impl IDeviceGateway for ModbusTcpGateway {
    async fn connect(&self) -> PlcResult<()> {
        let mut slot = self.context.lock().await;
        self.keep_alive.store(true, Ordering::SeqCst);
        if slot.is_some() {
            return PlcResult::ok(());
        }
        let result = self.open(&mut slot).await;
        self.record(result)
    }

    async fn disconnect(&self) -> PlcResult<()> {
        let mut slot = self.context.lock().await;
        self.keep_alive.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if slot.take().is_some() {
            log::info!("[{}] 已断开连接", self.config.name);
        }
        PlcResult::ok(())
    }

    async fn read_analog(&self, address: &str) -> PlcResult<f64> {
        let addr = match self.parse_address(address, true, false) {
            Ok(addr) => addr,
            Err(message) => return self.record(PlcResult::err(GatewayErrorKind::Protocol, message)),
        };
        let operation = format!("读取模拟量 {}", address);
        let result = self.exchange(&operation, ModbusRequest::ReadFloat(addr)).await;
        if result.is_err() {
            return self.record(result.map(|_| 0.0));
        }
        let decoded = match result.data {
            Some(ModbusResponse::Registers(regs)) if regs.len() >= 2 => {
                PlcResult::ok(decode_f32([regs[0], regs[1]], self.byte_order) as f64)
            }
            _ => PlcResult::err(GatewayErrorKind::Protocol, format!("{} 返回的寄存器数量不足", operation)),
        };
        self.record(decoded)
    }

    async fn write_analog(&self, address: &str, value: f64) -> PlcResult<()> {
        let addr = match self.parse_address(address, true, true) {
            Ok(addr) => addr,
            Err(message) => return self.record(PlcResult::err(GatewayErrorKind::Protocol, message)),
        };
        let registers = encode_f32(value as f32, self.byte_order);
        let operation = format!("写入模拟量 {} = {}", address, value);
        let result = self.exchange(&operation, ModbusRequest::WriteFloat(addr, registers)).await;
        self.record(result.map(|_| ()))
    }

    async fn read_digital(&self, address: &str) -> PlcResult<bool> {
        let addr = match self.parse_address(address, false, false) {
            Ok(addr) => addr,
            Err(message) => return self.record(PlcResult::err(GatewayErrorKind::Protocol, message)),
        };
        let operation = format!("读取数字量 {}", address);
        let result = self.exchange(&operation, ModbusRequest::ReadBit(addr)).await;
        if result.is_err() {
            return self.record(result.map(|_| false));
        }
        let decoded = match result.data {
            Some(ModbusResponse::Bits(bits)) if !bits.is_empty() => PlcResult::ok(bits[0]),
            _ => PlcResult::err(GatewayErrorKind::Protocol, format!("{} 未返回数据", operation)),
        };
        self.record(decoded)
    }

    async fn write_digital(&self, address: &str, value: bool) -> PlcResult<()> {
        let addr = match self.parse_address(address, false, true) {
            Ok(addr) => addr,
            Err(message) => return self.record(PlcResult::err(GatewayErrorKind::Protocol, message)),
        };
        let operation = format!("写入数字量 {} = {}", address, value);
        let result = self.exchange(&operation, ModbusRequest::WriteCoil(addr, value)).await;
        self.record(result.map(|_| ()))
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_device_info(&self) -> PlcResult<DeviceInfo> {
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        PlcResult::ok(DeviceInfo {
            name: self.config.name.clone(),
            endpoint: self.endpoint(),
            protocol: format!("Modbus TCP (slave {}, {})", self.config.slave_id, self.byte_order),
            connected: self.connected.load(Ordering::SeqCst),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> PlcConnectionConfig {
        PlcConnectionConfig {
            name: "测试PLC".to_string(),
            // TEST-NET-1，保证不可达
            host: "192.0.2.1".to_string(),
            connection_timeout_ms: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_unknown_byte_order() {
        let config = PlcConnectionConfig {
            byte_order: "XYZW".to_string(),
            ..Default::default()
        };
        assert!(ModbusTcpGateway::new(config).is_err());
    }

    #[tokio::test]
    async fn test_operations_before_connect_report_not_connected() {
        let gateway = ModbusTcpGateway::new(unreachable_config()).unwrap();
        let result = gateway.read_analog("40001").await;
        assert_eq!(result.error_kind(), Some(GatewayErrorKind::NotConnected));
        assert!(!gateway.is_connected().await);
    }

    #[tokio::test]
    async fn test_bad_address_is_protocol_error() {
        let gateway = ModbusTcpGateway::new(unreachable_config()).unwrap();
        let result = gateway.write_analog("30001", 1.0).await;
        assert_eq!(result.error_kind(), Some(GatewayErrorKind::Protocol), "输入寄存器不可写");
        let result = gateway.read_digital("40001").await;
        assert_eq!(result.error_kind(), Some(GatewayErrorKind::Protocol));

        let info = gateway.get_device_info().await.data.unwrap();
        assert_eq!(info.stats.failed_operations, 2);
    }

    #[tokio::test]
    async fn test_resolve_literal_endpoint() {
        let gateway = ModbusTcpGateway::new(PlcConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: 1502,
            ..Default::default()
        })
        .unwrap();
        let addr = gateway.resolve().await.expect("IP 字面量应该可以直接解析");
        assert_eq!(addr, "127.0.0.1:1502".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_host_fails() {
        let gateway = ModbusTcpGateway::new(unreachable_config()).unwrap();
        let result = gateway.connect().await;
        assert!(result.is_err());
        assert!(matches!(
            result.error_kind(),
            Some(GatewayErrorKind::Timeout) | Some(GatewayErrorKind::Connection)
        ));
        assert!(!gateway.is_connected().await);
    }
}
