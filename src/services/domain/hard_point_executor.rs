//! 硬点测试执行器
//!
//! 对单个通道执行无人值守的硬点测试：
//! - 模拟量：按 0→25→50→75→100% 依次写入、等待稳定、回读、换算并比较，
//!   结束后（无论通过与否）把信号源复位到 0% 对应的工程量
//! - 数字量：依次写入 低→高→低 并回读比较，最终状态为低
//!
//! 执行器只修改采样与 `hard_point_status`，整体状态由编排引擎负责

use std::time::Duration;

use super::channel_io::{ChannelIo, SignalRoute};
use super::range_converter::RangeConverter;
use crate::models::{ChannelTestInstance, DigitalStep, EngineeringRange, SubTestStatus, ANALOG_TEST_PERCENTAGES};
use crate::utils::config::TestConfig;
use crate::utils::error::{AppError, AppResult};

/// 数字量测试序列
const DIGITAL_TEST_SEQUENCE: [bool; 3] = [false, true, false];

/// 硬点测试结论
#[derive(Debug, Clone, PartialEq)]
pub struct HardPointOutcome {
    pub passed: bool,
    /// 失败时的诊断信息（包含最后一次实际值）
    pub message: Option<String>,
}

impl HardPointOutcome {
    fn passed() -> Self {
        Self { passed: true, message: None }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// 硬点测试执行器
#[derive(Debug, Clone)]
pub struct HardPointExecutor {
    converter: RangeConverter,
    analog_settle: Duration,
    digital_settle: Duration,
    /// 允许偏差（量程百分比）
    tolerance_percent: f64,
}

impl HardPointExecutor {
    pub fn new(converter: RangeConverter, config: &TestConfig) -> Self {
        Self {
            converter,
            analog_settle: Duration::from_millis(config.analog_stabilization_time_ms),
            digital_settle: Duration::from_millis(config.digital_stabilization_time_ms),
            tolerance_percent: config.analog_tolerance_percent,
        }
    }

    /// 执行一个通道的硬点测试
    ///
    /// 通讯失败不会以 `Err` 返回，而是记录为失败结论；
    /// 只有实例本身不满足测试条件时才返回 `Err`
    pub async fn execute(&self, instance: &mut ChannelTestInstance, io: &ChannelIo<'_>) -> AppResult<HardPointOutcome> {
        let route = io.route(instance)?;
        instance.hard_point_status = SubTestStatus::Testing;

        let outcome = if instance.definition.module_type.is_analog() {
            self.execute_analog(instance, &route).await?
        } else {
            self.execute_digital(instance, &route).await
        };

        instance.hard_point_status = if outcome.passed {
            SubTestStatus::Passed
        } else {
            SubTestStatus::Failed
        };
        if let Some(message) = &outcome.message {
            crate::log_test_failure!("通道 {} 硬点测试失败: {}", instance.definition.tag, message);
        } else {
            log::info!("通道 {} 硬点测试通过", instance.definition.tag);
        }
        Ok(outcome)
    }

    async fn execute_analog(
        &self,
        instance: &mut ChannelTestInstance,
        route: &SignalRoute<'_>,
    ) -> AppResult<HardPointOutcome> {
        let range = instance.definition.range().ok_or_else(|| {
            AppError::validation_error(format!("模拟量通道 {} 未配置量程", instance.definition.tag))
        })?;
        let reset_value = self.converter.percentage_to_real(&range, 0.0)?;

        let outcome = self.sweep_analog(instance, route, range).await;

        let reset = route.source.write_analog(&route.source_address, reset_value).await;
        if reset.is_err() {
            crate::log_communication_failure!(
                "通道 {} 复位 {} = {:.3} 失败: {}",
                instance.definition.tag,
                route.source_address,
                reset_value,
                reset.describe_error()
            );
        }

        outcome
    }

    async fn sweep_analog(
        &self,
        instance: &mut ChannelTestInstance,
        route: &SignalRoute<'_>,
        range: EngineeringRange,
    ) -> AppResult<HardPointOutcome> {
        for (index, percentage) in ANALOG_TEST_PERCENTAGES.iter().copied().enumerate() {
            let expected = self.converter.percentage_to_real(&range, percentage)?;

            let written = route.source.write_analog(&route.source_address, expected).await;
            if written.is_err() {
                let message = format!(
                    "{}% 点写入 {} 失败: {}",
                    percentage,
                    route.source_address,
                    written.describe_error()
                );
                instance.record_sample(index, expected, None, SubTestStatus::Failed)?;
                instance.skip_remaining_samples();
                return Ok(HardPointOutcome::failed(message));
            }

            tokio::time::sleep(self.analog_settle).await;

            let read = route.sink.read_analog(&route.sink_address).await;
            let actual = match read.data {
                Some(actual) if read.is_ok() => actual,
                _ => {
                    let message = format!(
                        "{}% 点读取 {} 失败: {}",
                        percentage,
                        route.sink_address,
                        read.describe_error()
                    );
                    instance.record_sample(index, expected, None, SubTestStatus::Failed)?;
                    instance.skip_remaining_samples();
                    return Ok(HardPointOutcome::failed(message));
                }
            };

            let actual_percentage = self.converter.real_to_percentage(&range, actual)?;
            let deviation = (actual_percentage - percentage).abs();
            if deviation <= self.tolerance_percent {
                instance.record_sample(index, expected, Some(actual), SubTestStatus::Passed)?;
                log::debug!(
                    "通道 {} {}% 点: 期望 {:.3}，实际 {:.3}",
                    instance.definition.tag,
                    percentage,
                    expected,
                    actual
                );
            } else {
                instance.record_sample(index, expected, Some(actual), SubTestStatus::Failed)?;
                instance.skip_remaining_samples();
                return Ok(HardPointOutcome::failed(format!(
                    "{}% 点偏差超限: 期望 {:.3}，实际 {:.3}（偏差 {:.2}%，允许 {:.2}%）",
                    percentage, expected, actual, deviation, self.tolerance_percent
                )));
            }
        }

        Ok(HardPointOutcome::passed())
    }

    async fn execute_digital(&self, instance: &mut ChannelTestInstance, route: &SignalRoute<'_>) -> HardPointOutcome {
        instance.digital_steps.clear();

        for value in DIGITAL_TEST_SEQUENCE {
            let written = route.source.write_digital(&route.source_address, value).await;
            if written.is_err() {
                instance.digital_steps.push(DigitalStep {
                    written: value,
                    read_back: None,
                    status: SubTestStatus::Failed,
                });
                return HardPointOutcome::failed(format!(
                    "写入 {} = {} 失败: {}",
                    route.source_address,
                    value,
                    written.describe_error()
                ));
            }

            tokio::time::sleep(self.digital_settle).await;

            let read = route.sink.read_digital(&route.sink_address).await;
            let read_back = if read.is_ok() { read.data } else { None };
            let matched = read_back == Some(value);
            instance.digital_steps.push(DigitalStep {
                written: value,
                read_back,
                status: if matched { SubTestStatus::Passed } else { SubTestStatus::Failed },
            });

            if !matched {
                if value {
                    self.reset_digital_source(route).await;
                }
                return HardPointOutcome::failed(match read_back {
                    Some(actual) => format!("写入 {} 后回读 {} 为 {}", value, route.sink_address, actual),
                    None => format!("读取 {} 失败: {}", route.sink_address, read.describe_error()),
                });
            }
        }

        HardPointOutcome::passed()
    }

    /// 高电平步骤失败时把信号源拉回低电平
    async fn reset_digital_source(&self, route: &SignalRoute<'_>) {
        let reset = route.source.write_digital(&route.source_address, false).await;
        if reset.is_err() {
            crate::log_communication_failure!("复位 {} = false 失败: {}", route.source_address, reset.describe_error());
        }
    }
}
