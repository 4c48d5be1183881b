//! 人工测试流程
//!
//! 每个需要人工确认的通道按以下状态机推进：
//! `NotTested → Waiting → Testing → {Passed, Failed, Skipped}`
//!
//! - 显示值核对：引擎写入一个已知值，由操作员确认显示是否一致
//! - 报警测试（仅 AI）：引擎依次把信号驱动越过每个已配置的报警设定值，
//!   有反馈地址时自动回读报警状态，否则等待操作员确认；每项结束后信号恢复到量程中点
//!
//! Skipped 只能从 NotTested/Waiting 进入；进入 Testing 之后只能通过 `abort` 显式中止

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel_io::ChannelIo;
use super::range_converter::RangeConverter;
use crate::models::{
    ChannelTestInstance, EngineeringRange, ManualTestState, ManualTestSubItem, ManualTestSubItemResult, ModuleType,
    OperatorConfirmation, OperatorDecision, SubTestStatus,
};
use crate::utils::config::TestConfig;
use crate::utils::error::{AppError, AppResult};

/// 子项驱动后的下一步
#[derive(Debug, Clone, PartialEq)]
pub enum ItemDrive {
    /// 已由自动回读（或通讯失败）得出结论
    Decided(ManualTestSubItemResult),
    /// 信号已驱动，等待操作员确认
    AwaitOperator(ManualTestSubItemResult),
}

/// 收件箱默认最多缓存的乱序确认条数
pub const MAX_BUFFERED_CONFIRMATIONS: usize = 64;

type ConfirmationKey = (String, ManualTestSubItem);

/// 操作员确认收件箱
///
/// 确认消息可能乱序到达，先到的消息按 (实例ID, 子项) 缓存。
/// 缓存有上限，超出时丢弃最早到达的一条；已结束实例的确认直接丢弃
pub struct ConfirmationInbox<'a> {
    receiver: &'a mut mpsc::Receiver<OperatorConfirmation>,
    pending: HashMap<ConfirmationKey, OperatorConfirmation>,
    arrival: VecDeque<ConfirmationKey>,
    closed: HashSet<String>,
    capacity: usize,
}

impl<'a> ConfirmationInbox<'a> {
    pub fn new(receiver: &'a mut mpsc::Receiver<OperatorConfirmation>) -> Self {
        Self::with_capacity(receiver, MAX_BUFFERED_CONFIRMATIONS)
    }

    pub fn with_capacity(receiver: &'a mut mpsc::Receiver<OperatorConfirmation>, capacity: usize) -> Self {
        Self {
            receiver,
            pending: HashMap::new(),
            arrival: VecDeque::new(),
            closed: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// 等待指定子项的确认
    ///
    /// 取消或通道关闭时返回 `None`
    pub async fn wait_for(
        &mut self,
        instance_id: &str,
        sub_item: ManualTestSubItem,
        cancel: &CancellationToken,
    ) -> Option<OperatorConfirmation> {
        let key = (instance_id.to_string(), sub_item);
        if let Some(confirmation) = self.take(&key) {
            return Some(confirmation);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                message = self.receiver.recv() => {
                    let confirmation = message?;
                    crate::log_user_operation!(
                        "收到确认: 实例 {} {} → {:?}",
                        confirmation.instance_id,
                        confirmation.sub_item,
                        confirmation.decision
                    );
                    let received_key = (confirmation.instance_id.clone(), confirmation.sub_item);
                    if received_key == key {
                        return Some(confirmation);
                    }
                    self.stash(received_key, confirmation);
                }
            }
        }
    }

    /// 实例的人工测试已结束：丢弃它的缓存确认，之后到达的也不再缓存
    pub fn close_instance(&mut self, instance_id: &str) -> usize {
        self.closed.insert(instance_id.to_string());
        let before = self.pending.len();
        self.pending.retain(|(id, _), _| id != instance_id);
        self.arrival.retain(|(id, _)| id != instance_id);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            log::debug!("实例 {} 已结束，丢弃 {} 条缓存确认", instance_id, dropped);
        }
        dropped
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn take(&mut self, key: &ConfirmationKey) -> Option<OperatorConfirmation> {
        let confirmation = self.pending.remove(key)?;
        self.arrival.retain(|k| k != key);
        Some(confirmation)
    }

    fn stash(&mut self, key: ConfirmationKey, confirmation: OperatorConfirmation) {
        if self.closed.contains(&key.0) {
            log::warn!("实例 {} 的人工测试已结束，丢弃确认 {}", key.0, key.1);
            return;
        }
        if self.pending.insert(key.clone(), confirmation).is_some() {
            log::warn!("实例 {} {} 收到重复确认，以最后一条为准", key.0, key.1);
        } else {
            self.arrival.push_back(key);
        }
        while self.pending.len() > self.capacity {
            let Some(oldest) = self.arrival.pop_front() else { break };
            if self.pending.remove(&oldest).is_some() {
                log::warn!("确认缓存已满（{} 条），丢弃最早的确认: 实例 {} {}", self.capacity, oldest.0, oldest.1);
            }
        }
    }
}

/// 人工测试流程
#[derive(Debug, Clone)]
pub struct ManualTestWorkflow {
    converter: RangeConverter,
    config: TestConfig,
}

impl ManualTestWorkflow {
    pub fn new(converter: RangeConverter, config: TestConfig) -> Self {
        Self { converter, config }
    }

    /// 通道需要执行的人工测试子项（按执行顺序）
    pub fn plan(&self, instance: &ChannelTestInstance) -> Vec<ManualTestSubItem> {
        let definition = &instance.definition;
        let mut items = Vec::new();
        if self.config.require_show_value_check {
            items.push(ManualTestSubItem::ShowValueCheck);
        }
        if matches!(definition.module_type, ModuleType::AI | ModuleType::AINone) && definition.range().is_some() {
            items.extend(
                definition
                    .configured_alarm_levels()
                    .into_iter()
                    .map(ManualTestSubItem::for_alarm),
            );
        }
        items
    }

    pub fn requires_manual_test(&self, instance: &ChannelTestInstance) -> bool {
        instance.is_allocated() && !self.plan(instance).is_empty()
    }

    /// NotTested → Waiting，并建立子项结果
    pub fn enter(&self, instance: &mut ChannelTestInstance) -> AppResult<()> {
        self.transition(instance, ManualTestState::Waiting)?;
        instance.manual_results = self.plan(instance).into_iter().map(ManualTestSubItemResult::new).collect();
        Ok(())
    }

    /// Waiting → Testing
    pub fn start(&self, instance: &mut ChannelTestInstance) -> AppResult<()> {
        self.transition(instance, ManualTestState::Testing)
    }

    /// 跳过尚未开始的人工测试
    pub fn skip(&self, instance: &mut ChannelTestInstance, reason: &str) -> AppResult<()> {
        self.transition(instance, ManualTestState::Skipped)?;
        self.skip_open_items(instance, reason);
        Ok(())
    }

    /// 显式中止进行中的人工测试
    pub fn abort(&self, instance: &mut ChannelTestInstance, reason: &str) -> AppResult<()> {
        if instance.manual_test_status.is_final() {
            return Err(AppError::state_transition_error(
                instance.manual_test_status.to_string(),
                ManualTestState::Skipped.to_string(),
                format!("通道 {} 的人工测试已结束，不能中止", instance.definition.tag),
            ));
        }
        crate::log_state_transition!(
            "通道 {} 人工测试中止: {} → Skipped ({})",
            instance.definition.tag,
            instance.manual_test_status,
            reason
        );
        instance.manual_test_status = ManualTestState::Skipped;
        self.skip_open_items(instance, reason);
        instance.last_updated_time = Utc::now();
        Ok(())
    }

    /// 下一个未完成的子项
    pub fn next_pending_item(&self, instance: &ChannelTestInstance) -> Option<ManualTestSubItem> {
        instance
            .manual_results
            .iter()
            .find(|result| !result.status.is_final())
            .map(|result| result.sub_item)
    }

    /// 驱动一个子项的信号
    pub async fn drive_item(
        &self,
        instance: &ChannelTestInstance,
        item: ManualTestSubItem,
        io: &ChannelIo<'_>,
    ) -> AppResult<ItemDrive> {
        let route = io.route(instance)?;
        let mut result = ManualTestSubItemResult::new(item);
        result.status = SubTestStatus::Testing;

        match item.alarm_level() {
            None => {
                if instance.definition.module_type.is_analog() {
                    let range = self.range_of(instance)?;
                    let value = self.converter.percentage_to_real(&range, self.config.show_value_percent)?;
                    let written = route.source.write_analog(&route.source_address, value).await;
                    if written.is_err() {
                        return Ok(ItemDrive::Decided(Self::device_failure(result, written.describe_error())));
                    }
                    result.driven_value = Some(value);
                    tokio::time::sleep(Duration::from_millis(self.config.analog_stabilization_time_ms)).await;
                    let observed = route.sink.read_analog(&route.sink_address).await;
                    if observed.is_ok() {
                        result.observed_value = observed.data;
                    }
                } else {
                    let written = route.source.write_digital(&route.source_address, true).await;
                    if written.is_err() {
                        return Ok(ItemDrive::Decided(Self::device_failure(result, written.describe_error())));
                    }
                    result.driven_value = Some(1.0);
                }
                Ok(ItemDrive::AwaitOperator(result))
            }
            Some(level) => {
                let set_value = instance.definition.alarm_set_value(level).ok_or_else(|| {
                    AppError::validation_error(format!("通道 {} 未配置 {} 报警设定值", instance.definition.tag, level))
                })?;
                let range = self.range_of(instance)?;
                let offset = range.span() * self.config.alarm_offset_percent / 100.0;
                let drive = if level.is_low_side() {
                    (set_value - offset).max(range.lower)
                } else {
                    (set_value + offset).min(range.upper)
                };

                let written = route.source.write_analog(&route.source_address, drive).await;
                if written.is_err() {
                    return Ok(ItemDrive::Decided(Self::device_failure(result, written.describe_error())));
                }
                result.driven_value = Some(drive);
                log::info!(
                    "通道 {} {}报警测试: 设定值 {}，驱动到 {}",
                    instance.definition.tag,
                    level,
                    set_value,
                    drive
                );

                let Some(feedback) = instance.definition.alarm_feedback_address(level) else {
                    return Ok(ItemDrive::AwaitOperator(result));
                };

                tokio::time::sleep(Duration::from_millis(self.config.alarm_test_wait_time_ms)).await;
                let alarm = io.target.read_digital(feedback).await;
                result.confirmed_automatically = true;
                result.test_time = Some(Utc::now());
                match alarm.data {
                    Some(true) if alarm.is_ok() => {
                        result.status = SubTestStatus::Passed;
                        result.observed_value = Some(1.0);
                    }
                    Some(false) if alarm.is_ok() => {
                        result.status = SubTestStatus::Failed;
                        result.observed_value = Some(0.0);
                        result.operator_notes = Some(format!("报警反馈 {} 未触发", feedback));
                    }
                    _ => {
                        return Ok(ItemDrive::Decided(Self::device_failure(result, alarm.describe_error())));
                    }
                }
                Ok(ItemDrive::Decided(result))
            }
        }
    }

    /// 将操作员确认应用到等待中的子项结果
    pub fn apply_confirmation(
        &self,
        mut pending: ManualTestSubItemResult,
        confirmation: &OperatorConfirmation,
    ) -> ManualTestSubItemResult {
        pending.status = match confirmation.decision {
            OperatorDecision::Pass => SubTestStatus::Passed,
            OperatorDecision::Fail => SubTestStatus::Failed,
            OperatorDecision::Skip => SubTestStatus::Skipped,
        };
        if confirmation.observed_value.is_some() {
            pending.observed_value = confirmation.observed_value;
        }
        pending.operator_notes = confirmation.notes.clone();
        if confirmation.decision == OperatorDecision::Skip {
            pending.skip_reason = Some(confirmation.notes.clone().unwrap_or_else(|| "操作员跳过".to_string()));
        }
        pending.confirmed_automatically = false;
        pending.test_time = Some(Utc::now());
        pending
    }

    /// 写入子项结论
    pub fn record_result(&self, instance: &mut ChannelTestInstance, result: ManualTestSubItemResult) -> AppResult<()> {
        if instance.manual_test_status != ManualTestState::Testing {
            return Err(AppError::state_transition_error(
                instance.manual_test_status.to_string(),
                ManualTestState::Testing.to_string(),
                format!("通道 {} 不在人工测试中，不能记录 {}", instance.definition.tag, result.sub_item),
            ));
        }
        let slot = instance
            .manual_results
            .iter_mut()
            .find(|existing| existing.sub_item == result.sub_item)
            .ok_or_else(|| {
                AppError::not_found_error(
                    "ManualTestSubItem",
                    format!("通道 {} 没有子项 {}", instance.definition.tag, result.sub_item),
                )
            })?;
        if result.status == SubTestStatus::Failed {
            crate::log_test_failure!(
                "通道 {} {} 失败: {}",
                instance.definition.tag,
                result.sub_item,
                result.operator_notes.as_deref().unwrap_or("-")
            );
        }
        *slot = result;
        instance.last_updated_time = Utc::now();
        Ok(())
    }

    /// 子项结束后恢复信号：模拟量回到量程中点，数字量复位
    pub async fn restore_signal(&self, instance: &ChannelTestInstance, io: &ChannelIo<'_>) -> AppResult<()> {
        let route = io.route(instance)?;
        let restored = if instance.definition.module_type.is_analog() {
            let range = self.range_of(instance)?;
            route.source.write_analog(&route.source_address, range.mid()).await
        } else {
            route.source.write_digital(&route.source_address, false).await
        };
        if restored.is_err() {
            crate::log_communication_failure!(
                "通道 {} 恢复信号失败: {}",
                instance.definition.tag,
                restored.describe_error()
            );
        }
        Ok(())
    }

    /// 所有子项完成后给出结论：任一子项失败则失败
    pub fn conclude(&self, instance: &mut ChannelTestInstance) -> AppResult<ManualTestState> {
        if let Some(open) = self.next_pending_item(instance) {
            return Err(AppError::validation_error(format!(
                "通道 {} 的子项 {} 尚未完成",
                instance.definition.tag, open
            )));
        }
        let failed = instance
            .manual_results
            .iter()
            .any(|result| result.status == SubTestStatus::Failed);
        let next = if failed {
            ManualTestState::Failed
        } else {
            ManualTestState::Passed
        };
        self.transition(instance, next)?;
        Ok(next)
    }

    fn transition(&self, instance: &mut ChannelTestInstance, next: ManualTestState) -> AppResult<()> {
        let current = instance.manual_test_status;
        let allowed = matches!(
            (current, next),
            (ManualTestState::NotTested, ManualTestState::Waiting)
                | (ManualTestState::Waiting, ManualTestState::Testing)
                | (ManualTestState::Testing, ManualTestState::Passed)
                | (ManualTestState::Testing, ManualTestState::Failed)
                | (ManualTestState::NotTested, ManualTestState::Skipped)
                | (ManualTestState::Waiting, ManualTestState::Skipped)
        );
        if !allowed {
            return Err(AppError::state_transition_error(
                current.to_string(),
                next.to_string(),
                format!("通道 {} 人工测试状态不允许该转换", instance.definition.tag),
            ));
        }
        crate::log_state_transition!("通道 {} 人工测试: {} → {}", instance.definition.tag, current, next);
        instance.manual_test_status = next;
        instance.last_updated_time = Utc::now();
        Ok(())
    }

    fn skip_open_items(&self, instance: &mut ChannelTestInstance, reason: &str) {
        for result in instance.manual_results.iter_mut().filter(|r| !r.status.is_final()) {
            result.status = SubTestStatus::Skipped;
            result.skip_reason = Some(reason.to_string());
        }
    }

    fn range_of(&self, instance: &ChannelTestInstance) -> AppResult<EngineeringRange> {
        instance.definition.range().ok_or_else(|| {
            AppError::validation_error(format!("模拟量通道 {} 未配置量程", instance.definition.tag))
        })
    }

    fn device_failure(mut result: ManualTestSubItemResult, message: String) -> ManualTestSubItemResult {
        result.status = SubTestStatus::Failed;
        result.operator_notes = Some(message);
        result.test_time = Some(Utc::now());
        result
    }
}
