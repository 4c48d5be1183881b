//! 通道信号路径
//!
//! 被测输入通道（AI/DI）由测试PLC输出信号、被测PLC采集；
//! 被测输出通道（AO/DO）由被测PLC输出信号、测试PLC采集。

use crate::models::ChannelTestInstance;
use crate::services::infrastructure::plc::IDeviceGateway;
use crate::utils::error::{AppError, AppResult};

/// 一对网关的借用视图
#[derive(Clone, Copy)]
pub struct ChannelIo<'a> {
    pub test: &'a dyn IDeviceGateway,
    pub target: &'a dyn IDeviceGateway,
}

impl<'a> ChannelIo<'a> {
    pub fn new(test: &'a dyn IDeviceGateway, target: &'a dyn IDeviceGateway) -> Self {
        Self { test, target }
    }

    /// 根据通道方向确定信号的驱动端与采集端
    pub fn route(&self, instance: &ChannelTestInstance) -> AppResult<SignalRoute<'a>> {
        let test_address = instance
            .test_plc_communication_address
            .clone()
            .ok_or_else(|| {
                AppError::allocation_error(format!("通道 {} 未分配测试通道", instance.definition.tag))
            })?;
        let target_address = instance.channel_address().to_string();

        Ok(if instance.definition.module_type.is_input() {
            SignalRoute {
                source: self.test,
                source_address: test_address,
                sink: self.target,
                sink_address: target_address,
            }
        } else {
            SignalRoute {
                source: self.target,
                source_address: target_address,
                sink: self.test,
                sink_address: test_address,
            }
        })
    }
}

/// 信号路径：写 source，读 sink
#[derive(Clone)]
pub struct SignalRoute<'a> {
    pub source: &'a dyn IDeviceGateway,
    pub source_address: String,
    pub sink: &'a dyn IDeviceGateway,
    pub sink_address: String,
}
