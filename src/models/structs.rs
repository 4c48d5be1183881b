use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AlarmLevel, ChannelTestStatus, ModuleType, SubTestStatus};
use super::manual_test::{ManualTestState, ManualTestSubItemResult};
use crate::utils::error::{AppError, AppResult};

/// 模拟量硬点测试的五个百分比点，必须按此顺序写入
pub const ANALOG_TEST_PERCENTAGES: [f64; 5] = [0.0, 25.0, 50.0, 75.0, 100.0];

/// 生成默认UUID字符串的辅助函数
pub fn default_id() -> String {
    Uuid::new_v4().to_string()
}

/// 工程量程
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineeringRange {
    pub lower: f64,
    pub upper: f64,
}

impl EngineeringRange {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn span(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn mid(&self) -> f64 {
        self.lower + self.span() / 2.0
    }
}

/// 通道点位定义结构体
/// 描述一个被测点的静态配置信息，由外部导入，进入引擎后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPointDefinition {
    /// 唯一标识符
    #[serde(default = "default_id")]
    pub id: String,
    /// 位号
    pub tag: String,
    /// 变量描述
    #[serde(default)]
    pub variable_description: Option<String>,
    /// 模块类型（AI, DI, AINone 等）
    pub module_type: ModuleType,
    /// 被测PLC通信地址（批次内唯一）
    pub plc_communication_address: String,
    /// 所属批次标签
    pub batch_tag: String,

    // 量程信息（仅模拟量）
    pub range_lower_limit: Option<f64>,
    pub range_upper_limit: Option<f64>,

    // 报警设定值（仅模拟量）
    /// 低低报设定值
    pub sll_set_value: Option<f64>,
    /// 低报设定值
    pub sl_set_value: Option<f64>,
    /// 高报设定值
    pub sh_set_value: Option<f64>,
    /// 高高报设定值
    pub shh_set_value: Option<f64>,

    // 报警状态反馈地址（被测PLC），为空时由操作员确认
    #[serde(default)]
    pub sll_feedback_address: Option<String>,
    #[serde(default)]
    pub sl_feedback_address: Option<String>,
    #[serde(default)]
    pub sh_feedback_address: Option<String>,
    #[serde(default)]
    pub shh_feedback_address: Option<String>,
}

impl ChannelPointDefinition {
    /// 创建新的通道点位定义
    pub fn new(
        tag: impl Into<String>,
        module_type: ModuleType,
        plc_communication_address: impl Into<String>,
        batch_tag: impl Into<String>,
    ) -> Self {
        Self {
            id: default_id(),
            tag: tag.into(),
            variable_description: None,
            module_type,
            plc_communication_address: plc_communication_address.into(),
            batch_tag: batch_tag.into(),
            range_lower_limit: None,
            range_upper_limit: None,
            sll_set_value: None,
            sl_set_value: None,
            sh_set_value: None,
            shh_set_value: None,
            sll_feedback_address: None,
            sl_feedback_address: None,
            sh_feedback_address: None,
            shh_feedback_address: None,
        }
    }

    pub fn with_range(mut self, lower: f64, upper: f64) -> Self {
        self.range_lower_limit = Some(lower);
        self.range_upper_limit = Some(upper);
        self
    }

    pub fn with_alarms(mut self, ll: f64, l: f64, h: f64, hh: f64) -> Self {
        self.sll_set_value = Some(ll);
        self.sl_set_value = Some(l);
        self.sh_set_value = Some(h);
        self.shh_set_value = Some(hh);
        self
    }

    pub fn with_alarm_feedback(mut self, level: AlarmLevel, address: impl Into<String>) -> Self {
        let address = Some(address.into());
        match level {
            AlarmLevel::LowLow => self.sll_feedback_address = address,
            AlarmLevel::Low => self.sl_feedback_address = address,
            AlarmLevel::High => self.sh_feedback_address = address,
            AlarmLevel::HighHigh => self.shh_feedback_address = address,
        }
        self
    }

    /// 量程上下限都存在时返回量程
    pub fn range(&self) -> Option<EngineeringRange> {
        match (self.range_lower_limit, self.range_upper_limit) {
            (Some(lower), Some(upper)) => Some(EngineeringRange::new(lower, upper)),
            _ => None,
        }
    }

    pub fn alarm_set_value(&self, level: AlarmLevel) -> Option<f64> {
        match level {
            AlarmLevel::LowLow => self.sll_set_value,
            AlarmLevel::Low => self.sl_set_value,
            AlarmLevel::High => self.sh_set_value,
            AlarmLevel::HighHigh => self.shh_set_value,
        }
    }

    pub fn alarm_feedback_address(&self, level: AlarmLevel) -> Option<&str> {
        match level {
            AlarmLevel::LowLow => self.sll_feedback_address.as_deref(),
            AlarmLevel::Low => self.sl_feedback_address.as_deref(),
            AlarmLevel::High => self.sh_feedback_address.as_deref(),
            AlarmLevel::HighHigh => self.shh_feedback_address.as_deref(),
        }
    }

    /// 已配置设定值的报警等级（按 LL → HH 顺序）
    pub fn configured_alarm_levels(&self) -> Vec<AlarmLevel> {
        AlarmLevel::ALL
            .into_iter()
            .filter(|level| self.alarm_set_value(*level).is_some())
            .collect()
    }

    /// 校验导入定义的约束
    ///
    /// 违反约束的定义在导入边界被拒绝，不会进入引擎
    pub fn validate(&self) -> AppResult<()> {
        if self.tag.trim().is_empty() {
            return Err(AppError::validation_error(format!("通道 {} 位号不能为空", self.id)));
        }
        if self.plc_communication_address.trim().is_empty() {
            return Err(AppError::validation_error(format!("通道 {} 通信地址不能为空", self.tag)));
        }

        match (self.range_lower_limit, self.range_upper_limit) {
            (Some(lower), Some(upper)) => {
                if !lower.is_finite() || !upper.is_finite() {
                    return Err(AppError::validation_error(format!(
                        "通道 {} 量程包含非法数值: [{}, {}]",
                        self.tag, lower, upper
                    )));
                }
                if upper <= lower {
                    return Err(AppError::validation_error(format!(
                        "通道 {} 量程上限 {} 必须大于下限 {}",
                        self.tag, upper, lower
                    )));
                }
            }
            (None, None) => {}
            _ => {
                return Err(AppError::validation_error(format!(
                    "通道 {} 量程上下限必须同时配置",
                    self.tag
                )));
            }
        }

        if self.module_type.is_digital() && (self.range().is_some() || !self.configured_alarm_levels().is_empty()) {
            return Err(AppError::validation_error(format!(
                "数字量通道 {} 不能配置量程或报警设定值",
                self.tag
            )));
        }

        let mut previous: Option<(AlarmLevel, f64)> = None;
        for level in AlarmLevel::ALL {
            if let Some(value) = self.alarm_set_value(level) {
                if !value.is_finite() {
                    return Err(AppError::validation_error(format!(
                        "通道 {} 报警设定值 {} 非法: {}",
                        self.tag, level, value
                    )));
                }
                if let Some((prev_level, prev_value)) = previous {
                    if value < prev_value {
                        return Err(AppError::validation_error(format!(
                            "通道 {} 报警设定值顺序错误: {}={} 大于 {}={}",
                            self.tag, prev_level, prev_value, level, value
                        )));
                    }
                }
                previous = Some((level, value));
            }
        }

        Ok(())
    }
}

/// 测试PLC通道配置
///
/// 测试侧的一个物理通道，`module_type` 已包含有源/无源信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlcChannelConfig {
    #[serde(default = "default_id")]
    pub id: String,
    /// 通道位号 (如: AO1_1)
    pub channel_tag: String,
    pub module_type: ModuleType,
    /// 通讯地址 (如: 40101, 00101)
    pub communication_address: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl TestPlcChannelConfig {
    pub fn new(
        channel_tag: impl Into<String>,
        module_type: ModuleType,
        communication_address: impl Into<String>,
    ) -> Self {
        Self {
            id: default_id(),
            channel_tag: channel_tag.into(),
            module_type,
            communication_address: communication_address.into(),
            is_enabled: true,
            description: None,
        }
    }
}

/// 单个百分比点的采样
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentageSample {
    /// 期望值（工程量）
    pub expected: Option<f64>,
    /// 实际读回值（工程量）
    pub actual: Option<f64>,
    pub status: SubTestStatus,
}

impl PercentageSample {
    pub fn is_written(&self) -> bool {
        self.expected.is_some() || self.actual.is_some() || self.status.is_final()
    }
}

/// 数字量硬点测试的一步（写入 + 回读）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DigitalStep {
    pub written: bool,
    pub read_back: Option<bool>,
    pub status: SubTestStatus,
}

/// 通道测试实例
///
/// 一个 [`ChannelPointDefinition`] 在某个批次中的可变测试记录，
/// 测试执行期间只由编排引擎修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTestInstance {
    /// 唯一测试实例ID
    #[serde(default = "default_id")]
    pub instance_id: String,
    /// 批次内顺序号（恢复时按此排序）
    pub sequence_no: u32,
    /// 所属批次标签
    pub test_batch_tag: String,
    /// 通道定义
    pub definition: ChannelPointDefinition,

    /// 分配到的测试PLC通道位号
    pub test_plc_channel_tag: Option<String>,
    /// 分配到的测试PLC通讯地址
    pub test_plc_communication_address: Option<String>,
    /// 分配失败原因（与分配结果二选一）
    pub allocation_error: Option<String>,

    /// 整体状态
    pub overall_status: ChannelTestStatus,
    /// 硬点测试状态
    pub hard_point_status: SubTestStatus,
    /// 0/25/50/75/100% 采样（仅模拟量）
    pub analog_samples: [PercentageSample; 5],
    /// 数字量写入/回读步骤
    #[serde(default)]
    pub digital_steps: Vec<DigitalStep>,
    /// 人工测试状态
    pub manual_test_status: ManualTestState,
    /// 人工测试子项结果（含报警测试结果）
    #[serde(default)]
    pub manual_results: Vec<ManualTestSubItemResult>,

    /// 最近的错误信息
    pub error_message: Option<String>,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub creation_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    /// 重测次数
    pub retries_count: u32,
}

impl ChannelTestInstance {
    /// 基于定义和分配结果创建测试实例
    pub fn new(definition: ChannelPointDefinition, sequence_no: u32, test_channel: &TestPlcChannelConfig) -> Self {
        let mut instance = Self::blank(definition, sequence_no);
        instance.test_plc_channel_tag = Some(test_channel.channel_tag.clone());
        instance.test_plc_communication_address = Some(test_channel.communication_address.clone());
        instance
    }

    /// 创建带有分配失败标记的实例，状态直接为 Failed
    pub fn allocation_failed(definition: ChannelPointDefinition, sequence_no: u32, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut instance = Self::blank(definition, sequence_no);
        instance.overall_status = ChannelTestStatus::Failed;
        instance.hard_point_status = SubTestStatus::NotApplicable;
        instance.manual_test_status = ManualTestState::Skipped;
        instance.error_message = Some(reason.clone());
        instance.allocation_error = Some(reason);
        instance.end_time = Some(instance.creation_time);
        instance
    }

    fn blank(definition: ChannelPointDefinition, sequence_no: u32) -> Self {
        let now = Utc::now();
        Self {
            instance_id: default_id(),
            sequence_no,
            test_batch_tag: definition.batch_tag.clone(),
            definition,
            test_plc_channel_tag: None,
            test_plc_communication_address: None,
            allocation_error: None,
            overall_status: ChannelTestStatus::NotTested,
            hard_point_status: SubTestStatus::NotTested,
            analog_samples: [PercentageSample::default(); 5],
            digital_steps: Vec::new(),
            manual_test_status: ManualTestState::NotTested,
            manual_results: Vec::new(),
            error_message: None,
            start_time: None,
            end_time: None,
            creation_time: now,
            last_updated_time: now,
            retries_count: 0,
        }
    }

    /// 被测PLC通信地址（持久化主键的一部分）
    pub fn channel_address(&self) -> &str {
        &self.definition.plc_communication_address
    }

    pub fn is_allocated(&self) -> bool {
        self.test_plc_communication_address.is_some() && self.allocation_error.is_none()
    }

    /// 是否可以进行无人值守的硬点测试：已分配，且模拟量有量程
    pub fn is_eligible_for_hard_point(&self) -> bool {
        self.is_allocated()
            && (self.definition.module_type.is_digital() || self.definition.range().is_some())
    }

    /// 单调状态转换
    pub fn transition_to(&mut self, next: ChannelTestStatus) -> AppResult<()> {
        if !self.overall_status.can_transition_to(next) {
            return Err(AppError::state_transition_error(
                self.overall_status.to_string(),
                next.to_string(),
                format!("通道 {} 不允许该状态转换", self.definition.tag),
            ));
        }
        let now = Utc::now();
        if next == ChannelTestStatus::Testing && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if next.is_terminal() && !self.overall_status.is_terminal() {
            self.end_time = Some(now);
        }
        self.overall_status = next;
        self.last_updated_time = now;
        Ok(())
    }

    /// 标记失败并记录诊断信息
    pub fn fail(&mut self, message: impl Into<String>) -> AppResult<()> {
        self.error_message = Some(message.into());
        self.transition_to(ChannelTestStatus::Failed)
    }

    /// 显式重测请求：唯一允许从终态回到 NotTested 的路径
    pub fn reset_for_retest(&mut self) -> AppResult<()> {
        if let Some(reason) = &self.allocation_error {
            return Err(AppError::allocation_error(format!(
                "通道 {} 未分配测试通道，无法重测: {}",
                self.definition.tag, reason
            )));
        }
        self.overall_status = ChannelTestStatus::NotTested;
        self.hard_point_status = SubTestStatus::NotTested;
        self.analog_samples = [PercentageSample::default(); 5];
        self.digital_steps.clear();
        self.manual_test_status = ManualTestState::NotTested;
        self.manual_results.clear();
        self.error_message = None;
        self.start_time = None;
        self.end_time = None;
        self.retries_count += 1;
        self.last_updated_time = Utc::now();
        Ok(())
    }

    /// 记录一个百分比点的采样
    ///
    /// 只能写入下一个尚未写入的点，保证 0→25→50→75→100 的递增顺序
    pub fn record_sample(
        &mut self,
        index: usize,
        expected: f64,
        actual: Option<f64>,
        status: SubTestStatus,
    ) -> AppResult<()> {
        if index >= self.analog_samples.len() {
            return Err(AppError::validation_error(format!("百分比点索引越界: {}", index)));
        }
        let next = self.next_sample_index();
        if next != Some(index) {
            return Err(AppError::validation_error(format!(
                "通道 {} 百分比点必须递增写入: 期望索引 {:?}，实际 {}",
                self.definition.tag, next, index
            )));
        }
        self.analog_samples[index] = PercentageSample {
            expected: Some(expected),
            actual,
            status,
        };
        self.last_updated_time = Utc::now();
        Ok(())
    }

    /// 下一个可写入的百分比点索引
    pub fn next_sample_index(&self) -> Option<usize> {
        self.analog_samples.iter().position(|sample| !sample.is_written())
    }

    /// 将剩余未写入的百分比点标记为跳过
    pub fn skip_remaining_samples(&mut self) {
        for sample in self.analog_samples.iter_mut().filter(|s| !s.is_written()) {
            sample.status = SubTestStatus::Skipped;
        }
    }

    /// 最近一次观察到的实际值
    pub fn last_actual_value(&self) -> Option<f64> {
        self.analog_samples.iter().rev().find_map(|sample| sample.actual)
    }

    /// 报警测试结果（人工测试子项中的报警部分）
    pub fn alarm_outcomes(&self) -> impl Iterator<Item = &ManualTestSubItemResult> {
        self.manual_results.iter().filter(|r| r.sub_item.alarm_level().is_some())
    }
}

/// 分配失败记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationFailure {
    /// 定义在导入列表中的顺序号
    pub sequence_no: u32,
    pub definition_id: String,
    pub tag: String,
    pub module_type: ModuleType,
    /// 需要的测试侧通道类型
    pub required_type: ModuleType,
    pub reason: String,
}

/// 测试批次信息
///
/// 由同一标签下的全部通道测试实例聚合而来
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBatchInfo {
    /// 批次标签（唯一外部关联键）
    pub tag: String,
    pub creation_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    pub total_points: u32,
    pub tested_points: u32,
    pub passed_points: u32,
    pub failed_points: u32,
    pub skipped_points: u32,
}

impl TestBatchInfo {
    pub fn new(tag: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            tag: tag.into(),
            creation_time: now,
            last_updated_time: now,
            total_points: 0,
            tested_points: 0,
            passed_points: 0,
            failed_points: 0,
            skipped_points: 0,
        }
    }

    /// 从通道测试实例聚合统计
    pub fn from_instances(tag: impl Into<String>, instances: &[ChannelTestInstance]) -> Self {
        let mut info = Self::new(tag);
        if let Some(created) = instances.iter().map(|i| i.creation_time).min() {
            info.creation_time = created;
        }
        if let Some(updated) = instances.iter().map(|i| i.last_updated_time).max() {
            info.last_updated_time = updated;
        }
        for instance in instances {
            info.count(instance.overall_status);
        }
        info
    }

    /// 计入一个通道的最终状态
    pub fn count(&mut self, status: ChannelTestStatus) {
        self.total_points += 1;
        match status {
            ChannelTestStatus::Passed => {
                self.tested_points += 1;
                self.passed_points += 1;
            }
            ChannelTestStatus::Failed => {
                self.tested_points += 1;
                self.failed_points += 1;
            }
            ChannelTestStatus::Skipped => self.skipped_points += 1,
            _ => {}
        }
    }

    /// 通过率 = 通过点数 / 总点数
    pub fn pass_rate(&self) -> f64 {
        if self.total_points == 0 {
            0.0
        } else {
            self.passed_points as f64 / self.total_points as f64
        }
    }
}

/// 提供给外部报表模块的批次导出数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch: TestBatchInfo,
    pub mappings: Vec<ChannelTestInstance>,
    pub all_passed: bool,
}

impl BatchReport {
    pub fn new(batch: TestBatchInfo, mappings: Vec<ChannelTestInstance>) -> Self {
        let all_passed = !mappings.is_empty()
            && mappings
                .iter()
                .all(|m| m.overall_status == ChannelTestStatus::Passed);
        Self {
            batch,
            mappings,
            all_passed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ai_definition() -> ChannelPointDefinition {
        ChannelPointDefinition::new("TT-101", ModuleType::AI, "40001", "B1").with_range(0.0, 100.0)
    }

    fn test_channel() -> TestPlcChannelConfig {
        TestPlcChannelConfig::new("AO1_1", ModuleType::AO, "40101")
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let definition = ChannelPointDefinition::new("TT-1", ModuleType::AI, "40001", "B1").with_range(10.0, 0.0);
        assert!(definition.validate().is_err(), "量程颠倒应该被拒绝");
    }

    #[test]
    fn test_validate_rejects_unordered_alarms() {
        let definition = ai_definition().with_alarms(10.0, 5.0, 80.0, 90.0);
        assert!(definition.validate().is_err(), "低低报大于低报应该被拒绝");

        let definition = ai_definition().with_alarms(5.0, 10.0, 80.0, 90.0);
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_half_range() {
        let mut definition = ai_definition();
        definition.range_upper_limit = None;
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_samples_must_be_written_in_order() {
        let mut instance = ChannelTestInstance::new(ai_definition(), 0, &test_channel());

        assert!(instance.record_sample(1, 25.0, Some(25.0), SubTestStatus::Passed).is_err());
        instance.record_sample(0, 0.0, Some(0.0), SubTestStatus::Passed).unwrap();
        instance.record_sample(1, 25.0, Some(25.1), SubTestStatus::Passed).unwrap();
        assert!(instance.record_sample(0, 0.0, Some(0.0), SubTestStatus::Passed).is_err(), "不允许回写较低的百分比点");
        assert_eq!(instance.next_sample_index(), Some(2));
    }

    #[test]
    fn test_status_cannot_regress_without_retest() {
        let mut instance = ChannelTestInstance::new(ai_definition(), 0, &test_channel());
        instance.transition_to(ChannelTestStatus::Waiting).unwrap();
        instance.transition_to(ChannelTestStatus::Testing).unwrap();
        instance.transition_to(ChannelTestStatus::Passed).unwrap();

        assert!(instance.transition_to(ChannelTestStatus::Waiting).is_err());

        instance.reset_for_retest().unwrap();
        assert_eq!(instance.overall_status, ChannelTestStatus::NotTested);
        assert_eq!(instance.retries_count, 1);
        assert!(instance.end_time.is_none());
    }

    #[test]
    fn test_allocation_failure_is_marked() {
        let instance = ChannelTestInstance::allocation_failed(ai_definition(), 3, "无可用AO通道");
        assert_eq!(instance.overall_status, ChannelTestStatus::Failed);
        assert!(!instance.is_allocated());
        assert!(!instance.is_eligible_for_hard_point());
        let mut instance = instance;
        assert!(instance.reset_for_retest().is_err(), "未分配的通道不能重测");
    }

    #[test]
    fn test_pass_rate_matches_status_counts() {
        let mut instances: Vec<ChannelTestInstance> = (0..4)
            .map(|i| ChannelTestInstance::new(ai_definition(), i, &test_channel()))
            .collect();
        instances[0].overall_status = ChannelTestStatus::Passed;
        instances[1].overall_status = ChannelTestStatus::Passed;
        instances[2].overall_status = ChannelTestStatus::Failed;

        let info = TestBatchInfo::from_instances("B1", &instances);
        assert_eq!(info.total_points, 4);
        assert_eq!(info.tested_points, 3);
        assert!((info.pass_rate() - 0.5).abs() < f64::EPSILON);
    }
}
