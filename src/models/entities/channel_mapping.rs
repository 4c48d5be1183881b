// ChannelMappings 表的 SeaORM 实体定义
// 一行对应一个通道测试实例，主键为 (test_tag, channel_address)

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use serde::{Deserialize, Serialize};

use crate::models::enums::{ChannelTestStatus, ModuleType, SubTestStatus};
use crate::models::manual_test::{ManualTestState, ManualTestSubItemResult};
use crate::models::structs::{ChannelPointDefinition, ChannelTestInstance, DigitalStep, PercentageSample};
use crate::utils::error::{AppError, AppResult};

/// 旧版本用来表示"无值"的哨兵数值
pub const LEGACY_ABSENT_SENTINEL: f64 = -999999.0;

const SENTINEL_EPSILON: f64 = 0.5;

/// 是否为旧哨兵值
pub fn is_legacy_sentinel(value: f64) -> bool {
    (value - LEGACY_ABSENT_SENTINEL).abs() < SENTINEL_EPSILON
}

/// 将哨兵值规范化为 None，读写两个方向都使用
pub fn normalize_legacy(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !is_legacy_sentinel(*v))
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "channel_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub test_tag: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub channel_address: String,

    pub instance_id: String,
    pub sequence_no: i32,
    pub definition_id: String,
    pub channel_tag: String,
    #[sea_orm(nullable)]
    pub variable_description: Option<String>,
    pub module_type: String,

    // 分配信息
    #[sea_orm(nullable)]
    pub test_plc_channel_tag: Option<String>,
    #[sea_orm(nullable)]
    pub test_plc_communication_address: Option<String>,
    #[sea_orm(nullable)]
    pub allocation_error: Option<String>,

    // 量程与报警设定值
    #[sea_orm(column_type = "Double", nullable)]
    pub range_lower_limit: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub range_upper_limit: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub sll_set_value: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub sl_set_value: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub sh_set_value: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub shh_set_value: Option<f64>,
    #[sea_orm(nullable)]
    pub sll_feedback_address: Option<String>,
    #[sea_orm(nullable)]
    pub sl_feedback_address: Option<String>,
    #[sea_orm(nullable)]
    pub sh_feedback_address: Option<String>,
    #[sea_orm(nullable)]
    pub shh_feedback_address: Option<String>,

    // 五个百分比点的期望值/实际值
    #[sea_orm(column_type = "Double", nullable)]
    pub expected_0_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub actual_0_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub expected_25_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub actual_25_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub expected_50_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub actual_50_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub expected_75_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub actual_75_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub expected_100_percent: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub actual_100_percent: Option<f64>,
    /// 五个百分比点各自的子测试状态
    #[sea_orm(column_type = "Text", nullable)]
    pub sample_status_json: Option<String>,

    // 测试状态
    pub overall_status: String,
    /// 整体结果码（ChannelTestStatus::code）
    pub status_code: i32,
    pub hard_point_status: String,
    pub manual_test_status: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub digital_steps_json: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub manual_results_json: Option<String>,
    #[sea_orm(nullable)]
    pub error_message: Option<String>,

    // 时间信息
    #[sea_orm(nullable)]
    pub start_time: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub end_time: Option<DateTime<Utc>>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub retries_count: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 行内是否仍残留旧哨兵值
    pub fn contains_legacy_sentinel(&self) -> bool {
        self.numeric_columns().iter().any(|v| v.map_or(false, is_legacy_sentinel))
    }

    fn numeric_columns(&self) -> [Option<f64>; 16] {
        [
            self.range_lower_limit,
            self.range_upper_limit,
            self.sll_set_value,
            self.sl_set_value,
            self.sh_set_value,
            self.shh_set_value,
            self.expected_0_percent,
            self.actual_0_percent,
            self.expected_25_percent,
            self.actual_25_percent,
            self.expected_50_percent,
            self.actual_50_percent,
            self.expected_75_percent,
            self.actual_75_percent,
            self.expected_100_percent,
            self.actual_100_percent,
        ]
    }

    /// 返回把哨兵值替换为 NULL 后的行
    pub fn without_legacy_sentinels(&self) -> Model {
        let mut model = self.clone();
        model.range_lower_limit = normalize_legacy(model.range_lower_limit);
        model.range_upper_limit = normalize_legacy(model.range_upper_limit);
        model.sll_set_value = normalize_legacy(model.sll_set_value);
        model.sl_set_value = normalize_legacy(model.sl_set_value);
        model.sh_set_value = normalize_legacy(model.sh_set_value);
        model.shh_set_value = normalize_legacy(model.shh_set_value);
        model.expected_0_percent = normalize_legacy(model.expected_0_percent);
        model.actual_0_percent = normalize_legacy(model.actual_0_percent);
        model.expected_25_percent = normalize_legacy(model.expected_25_percent);
        model.actual_25_percent = normalize_legacy(model.actual_25_percent);
        model.expected_50_percent = normalize_legacy(model.expected_50_percent);
        model.actual_50_percent = normalize_legacy(model.actual_50_percent);
        model.expected_75_percent = normalize_legacy(model.expected_75_percent);
        model.actual_75_percent = normalize_legacy(model.actual_75_percent);
        model.expected_100_percent = normalize_legacy(model.expected_100_percent);
        model.actual_100_percent = normalize_legacy(model.actual_100_percent);
        model
    }
}

impl From<&ChannelTestInstance> for ActiveModel {
    fn from(instance: &ChannelTestInstance) -> Self {
        let definition = &instance.definition;
        let samples = &instance.analog_samples;
        let sample_status: Vec<SubTestStatus> = samples.iter().map(|s| s.status).collect();

        let digital_steps_json = if instance.digital_steps.is_empty() {
            None
        } else {
            serde_json::to_string(&instance.digital_steps).ok()
        };
        let manual_results_json = if instance.manual_results.is_empty() {
            None
        } else {
            serde_json::to_string(&instance.manual_results).ok()
        };

        Self {
            test_tag: Set(instance.test_batch_tag.clone()),
            channel_address: Set(definition.plc_communication_address.clone()),
            instance_id: Set(instance.instance_id.clone()),
            sequence_no: Set(instance.sequence_no as i32),
            definition_id: Set(definition.id.clone()),
            channel_tag: Set(definition.tag.clone()),
            variable_description: Set(definition.variable_description.clone()),
            module_type: Set(definition.module_type.to_string()),

            test_plc_channel_tag: Set(instance.test_plc_channel_tag.clone()),
            test_plc_communication_address: Set(instance.test_plc_communication_address.clone()),
            allocation_error: Set(instance.allocation_error.clone()),

            range_lower_limit: Set(normalize_legacy(definition.range_lower_limit)),
            range_upper_limit: Set(normalize_legacy(definition.range_upper_limit)),
            sll_set_value: Set(normalize_legacy(definition.sll_set_value)),
            sl_set_value: Set(normalize_legacy(definition.sl_set_value)),
            sh_set_value: Set(normalize_legacy(definition.sh_set_value)),
            shh_set_value: Set(normalize_legacy(definition.shh_set_value)),
            sll_feedback_address: Set(definition.sll_feedback_address.clone()),
            sl_feedback_address: Set(definition.sl_feedback_address.clone()),
            sh_feedback_address: Set(definition.sh_feedback_address.clone()),
            shh_feedback_address: Set(definition.shh_feedback_address.clone()),

            expected_0_percent: Set(normalize_legacy(samples[0].expected)),
            actual_0_percent: Set(normalize_legacy(samples[0].actual)),
            expected_25_percent: Set(normalize_legacy(samples[1].expected)),
            actual_25_percent: Set(normalize_legacy(samples[1].actual)),
            expected_50_percent: Set(normalize_legacy(samples[2].expected)),
            actual_50_percent: Set(normalize_legacy(samples[2].actual)),
            expected_75_percent: Set(normalize_legacy(samples[3].expected)),
            actual_75_percent: Set(normalize_legacy(samples[3].actual)),
            expected_100_percent: Set(normalize_legacy(samples[4].expected)),
            actual_100_percent: Set(normalize_legacy(samples[4].actual)),
            sample_status_json: Set(serde_json::to_string(&sample_status).ok()),

            overall_status: Set(instance.overall_status.to_string()),
            status_code: Set(instance.overall_status.code()),
            hard_point_status: Set(instance.hard_point_status.to_string()),
            manual_test_status: Set(instance.manual_test_status.to_string()),
            digital_steps_json: Set(digital_steps_json),
            manual_results_json: Set(manual_results_json),
            error_message: Set(instance.error_message.clone()),

            start_time: Set(instance.start_time),
            end_time: Set(instance.end_time),
            created_time: Set(instance.creation_time),
            updated_time: Set(instance.last_updated_time),
            retries_count: Set(instance.retries_count as i32),
        }
    }
}

impl TryFrom<&Model> for ChannelTestInstance {
    type Error = AppError;

    fn try_from(model: &Model) -> AppResult<Self> {
        let model = model.without_legacy_sentinels();
        let module_type: ModuleType = model
            .module_type
            .parse()
            .map_err(|e: String| AppError::persistence_error(format!("通道 {} 模块类型无效: {}", model.channel_tag, e)))?;

        let overall_status = ChannelTestStatus::from_code(model.status_code)
            .or_else(|| model.overall_status.parse().ok())
            .ok_or_else(|| {
                AppError::persistence_error(format!(
                    "通道 {} 状态无效: {} / {}",
                    model.channel_tag, model.overall_status, model.status_code
                ))
            })?;

        let sample_status: Vec<SubTestStatus> = model
            .sample_status_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();
        let status_at = |index: usize| sample_status.get(index).copied().unwrap_or_default();

        let digital_steps: Vec<DigitalStep> = parse_json_column(model.digital_steps_json.as_deref(), "digital_steps_json")?;
        let manual_results: Vec<ManualTestSubItemResult> =
            parse_json_column(model.manual_results_json.as_deref(), "manual_results_json")?;

        let definition = ChannelPointDefinition {
            id: model.definition_id.clone(),
            tag: model.channel_tag.clone(),
            variable_description: model.variable_description.clone(),
            module_type,
            plc_communication_address: model.channel_address.clone(),
            batch_tag: model.test_tag.clone(),
            range_lower_limit: model.range_lower_limit,
            range_upper_limit: model.range_upper_limit,
            sll_set_value: model.sll_set_value,
            sl_set_value: model.sl_set_value,
            sh_set_value: model.sh_set_value,
            shh_set_value: model.shh_set_value,
            sll_feedback_address: model.sll_feedback_address.clone(),
            sl_feedback_address: model.sl_feedback_address.clone(),
            sh_feedback_address: model.sh_feedback_address.clone(),
            shh_feedback_address: model.shh_feedback_address.clone(),
        };

        let pairs = [
            (model.expected_0_percent, model.actual_0_percent),
            (model.expected_25_percent, model.actual_25_percent),
            (model.expected_50_percent, model.actual_50_percent),
            (model.expected_75_percent, model.actual_75_percent),
            (model.expected_100_percent, model.actual_100_percent),
        ];
        let mut analog_samples = [PercentageSample::default(); 5];
        for (index, (expected, actual)) in pairs.into_iter().enumerate() {
            analog_samples[index] = PercentageSample {
                expected,
                actual,
                status: status_at(index),
            };
        }

        Ok(ChannelTestInstance {
            instance_id: model.instance_id.clone(),
            sequence_no: model.sequence_no.max(0) as u32,
            test_batch_tag: model.test_tag.clone(),
            definition,
            test_plc_channel_tag: model.test_plc_channel_tag.clone(),
            test_plc_communication_address: model.test_plc_communication_address.clone(),
            allocation_error: model.allocation_error.clone(),
            overall_status,
            hard_point_status: model.hard_point_status.parse().unwrap_or_default(),
            analog_samples,
            digital_steps,
            manual_test_status: model
                .manual_test_status
                .parse::<ManualTestState>()
                .unwrap_or_default(),
            manual_results,
            error_message: model.error_message.clone(),
            start_time: model.start_time,
            end_time: model.end_time,
            creation_time: model.created_time,
            last_updated_time: model.updated_time,
            retries_count: model.retries_count.max(0) as u32,
        })
    }
}

fn parse_json_column<T: serde::de::DeserializeOwned + Default>(raw: Option<&str>, column: &str) -> AppResult<T> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(T::default()),
        Some(json) => serde_json::from_str(json)
            .map_err(|e| AppError::persistence_error(format!("解析列 {} 失败: {}", column, e))),
    }
}
