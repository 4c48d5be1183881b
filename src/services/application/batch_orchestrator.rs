//! 批次编排引擎
//!
//! 一个批次按 `Created → Allocating → AutomatedTesting → ManualTesting → Aggregating → Finalized`
//! 推进，任意非终态都可以被取消。
//!
//! **设计要点**:
//! - 批次状态 [`BatchSession`] 由调用方独占持有，引擎的每个操作都通过 `&mut` 驱动它
//! - 同一批次标签同一时刻只能有一个会话：租约登记表由存储持有，共享同一存储的引擎互斥；
//!   新建批次在存储层以单事务检查并插入，跨进程同样只有一个能成功
//! - 每次状态转换后立即保存；保存失败重试一次，仍失败则对该批次致命
//! - 通讯失败和分配失败只影响对应通道，不会中止批次

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{
    BatchPhase, BatchReport, ChannelPointDefinition, ChannelTestInstance, ChannelTestStatus, ManualTestState,
    ManualTestSubItem, ManualTestSubItemResult, OperatorConfirmation, SubTestStatus, TestBatchInfo, TestPlcChannelConfig,
};
use crate::services::channel_allocation_service::ChannelAllocationService;
use crate::services::domain::{
    ChannelIo, ConfirmationInbox, HardPointExecutor, ItemDrive, ManualTestWorkflow, RangeConverter,
};
use crate::services::infrastructure::persistence::{BatchLease, ITestRecordStore};
use crate::services::infrastructure::plc::{GatewayRetryPolicy, IDeviceGateway, ModbusTcpGateway, RetryingGateway};
use crate::utils::config::{AppConfig, PlcConnectionConfig, TestConfig};
use crate::utils::error::{AppError, AppResult};

/// 批次事件，供界面层订阅
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchEvent {
    PhaseChanged {
        tag: String,
        from: BatchPhase,
        to: BatchPhase,
    },
    ChannelStatusChanged {
        tag: String,
        instance_id: String,
        channel_tag: String,
        status: ChannelTestStatus,
        message: Option<String>,
    },
    /// 信号已驱动，等待操作员确认
    ManualConfirmationRequested {
        tag: String,
        instance_id: String,
        channel_tag: String,
        sub_item: ManualTestSubItem,
        driven_value: Option<f64>,
        observed_value: Option<f64>,
    },
    BatchFinished {
        summary: TestBatchInfo,
        cancelled: bool,
        finished_at: DateTime<Utc>,
    },
}

/// 一个批次的可变状态
#[derive(Debug)]
pub struct BatchSession {
    tag: String,
    phase: BatchPhase,
    mappings: Vec<ChannelTestInstance>,
    cancel: CancellationToken,
    _lease: BatchLease,
}

impl BatchSession {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    pub fn mappings(&self) -> &[ChannelTestInstance] {
        &self.mappings
    }

    pub fn mapping_by_tag(&self, channel_tag: &str) -> Option<&ChannelTestInstance> {
        self.mappings.iter().find(|m| m.definition.tag == channel_tag)
    }

    /// 用于在其他任务中取消本批次
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        crate::log_user_operation!("取消批次 {}", self.tag);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn summary(&self) -> TestBatchInfo {
        TestBatchInfo::from_instances(self.tag.clone(), &self.mappings)
    }
}

/// 批次编排引擎
pub struct BatchOrchestrator {
    test_gateway: Arc<dyn IDeviceGateway>,
    target_gateway: Arc<dyn IDeviceGateway>,
    store: Arc<dyn ITestRecordStore>,
    allocator: ChannelAllocationService,
    hard_point: HardPointExecutor,
    workflow: ManualTestWorkflow,
    config: TestConfig,
    event_tx: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl BatchOrchestrator {
    pub fn new(
        test_gateway: Arc<dyn IDeviceGateway>,
        target_gateway: Arc<dyn IDeviceGateway>,
        store: Arc<dyn ITestRecordStore>,
        converter: RangeConverter,
        config: TestConfig,
    ) -> Self {
        Self {
            test_gateway,
            target_gateway,
            store,
            allocator: ChannelAllocationService::new(),
            hard_point: HardPointExecutor::new(converter, &config),
            workflow: ManualTestWorkflow::new(converter, config.clone()),
            config,
            event_tx: None,
        }
    }

    pub fn with_event_sender(mut self, event_tx: mpsc::UnboundedSender<BatchEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// 按配置组装：两侧均为带重试的 Modbus TCP 网关
    pub fn from_config(config: &AppConfig, store: Arc<dyn ITestRecordStore>) -> AppResult<Self> {
        let test_gateway = Self::modbus_gateway(&config.test_plc)?;
        let target_gateway = Self::modbus_gateway(&config.target_plc)?;
        Ok(Self::new(
            test_gateway,
            target_gateway,
            store,
            RangeConverter::new(),
            config.test_config.clone(),
        ))
    }

    fn modbus_gateway(plc: &PlcConnectionConfig) -> AppResult<Arc<dyn IDeviceGateway>> {
        let inner: Arc<dyn IDeviceGateway> = Arc::new(ModbusTcpGateway::new(plc.clone())?);
        Ok(Arc::new(RetryingGateway::new(
            plc.name.clone(),
            inner,
            GatewayRetryPolicy::from_config(plc),
        )))
    }

    /// 并发连接两个网关
    pub async fn connect_gateways(&self) -> AppResult<()> {
        let (test, target) = futures::future::join(self.test_gateway.connect(), self.target_gateway.connect()).await;
        test.into_app_result("连接测试PLC")?;
        target.into_app_result("连接被测PLC")?;
        log::info!("测试PLC与被测PLC均已连接");
        Ok(())
    }

    pub async fn disconnect_gateways(&self) {
        let (test, target) =
            futures::future::join(self.test_gateway.disconnect(), self.target_gateway.disconnect()).await;
        for result in [test, target] {
            if result.is_err() {
                crate::log_communication_failure!("断开连接失败: {}", result.describe_error());
            }
        }
    }

    /// 校验导入的定义并分配测试通道，创建新批次
    pub async fn create_batch(
        &self,
        tag: &str,
        definitions: Vec<ChannelPointDefinition>,
        test_channels: &[TestPlcChannelConfig],
    ) -> AppResult<BatchSession> {
        Self::validate_definitions(tag, &definitions)?;

        let lease = self.store.lease_registry().acquire(tag)?;

        let mut session = BatchSession {
            tag: tag.to_string(),
            phase: BatchPhase::Created,
            mappings: Vec::new(),
            cancel: CancellationToken::new(),
            _lease: lease,
        };

        self.set_phase(&mut session, BatchPhase::Allocating)?;
        let allocation = self.allocator.allocate(&definitions, test_channels);
        session.mappings = allocation.into_instances(&definitions);
        self.persist_new_batch(&session).await?;

        log::info!(
            "批次 {} 已创建: {} 个通道，{} 个分配失败",
            tag,
            session.mappings.len(),
            session.mappings.iter().filter(|m| !m.is_allocated()).count()
        );
        Ok(session)
    }

    /// 从存储恢复批次，测试中断的通道通过显式重测路径复位
    pub async fn resume_batch(&self, tag: &str) -> AppResult<BatchSession> {
        let lease = self.store.lease_registry().acquire(tag)?;
        let mut mappings = self.store.restore_test_records(tag).await?;
        if mappings.is_empty() {
            return Err(AppError::not_found_error("TestBatch", format!("批次 {} 不存在", tag)));
        }

        let mut interrupted = 0;
        for mapping in mappings
            .iter_mut()
            .filter(|m| m.overall_status == ChannelTestStatus::Testing && m.is_allocated())
        {
            mapping.reset_for_retest()?;
            interrupted += 1;
        }

        let session = BatchSession {
            tag: tag.to_string(),
            phase: BatchPhase::Allocating,
            mappings,
            cancel: CancellationToken::new(),
            _lease: lease,
        };
        if interrupted > 0 {
            self.persist_all(&session).await?;
        }

        let summary = session.summary();
        log::info!(
            "批次 {} 已恢复: 共 {} 个通道，通过 {}，失败 {}，{} 个中断通道已复位",
            tag,
            summary.total_points,
            summary.passed_points,
            summary.failed_points,
            interrupted
        );
        Ok(session)
    }

    /// 自动硬点测试阶段
    pub async fn run_automated_tests(&self, session: &mut BatchSession) -> AppResult<()> {
        if session.is_cancelled() {
            return self.cancel_remaining(session, "批次已取消").await;
        }
        self.set_phase(session, BatchPhase::AutomatedTesting)?;

        for mapping in session.mappings.iter_mut() {
            if mapping.overall_status == ChannelTestStatus::NotTested && mapping.is_eligible_for_hard_point() {
                mapping.transition_to(ChannelTestStatus::Waiting)?;
            }
        }
        self.persist_all(session).await?;

        let io = ChannelIo::new(self.test_gateway.as_ref(), self.target_gateway.as_ref());
        for index in 0..session.mappings.len() {
            if session.is_cancelled() {
                return self.cancel_remaining(session, "批次已取消").await;
            }
            if session.mappings[index].overall_status != ChannelTestStatus::Waiting {
                continue;
            }

            self.transition_channel(session, index, ChannelTestStatus::Testing)?;
            self.persist_one(session, index).await?;

            let outcome = {
                let mapping = &mut session.mappings[index];
                self.hard_point.execute(mapping, &io).await
            };

            let requires_manual = self.workflow.requires_manual_test(&session.mappings[index]);
            match outcome {
                Ok(outcome) if outcome.passed => {
                    if !requires_manual {
                        self.transition_channel(session, index, ChannelTestStatus::Passed)?;
                    }
                }
                Ok(outcome) => {
                    let message = outcome.message.unwrap_or_else(|| "硬点测试失败".to_string());
                    self.fail_channel(session, index, message)?;
                }
                Err(e) => {
                    session.mappings[index].hard_point_status = SubTestStatus::Failed;
                    self.fail_channel(session, index, e.to_string())?;
                }
            }
            self.persist_one(session, index).await?;
        }

        Ok(())
    }

    /// 人工测试阶段，阻塞等待操作员确认
    pub async fn run_manual_tests(
        &self,
        session: &mut BatchSession,
        confirmations: &mut mpsc::Receiver<OperatorConfirmation>,
    ) -> AppResult<()> {
        if session.is_cancelled() {
            return self.cancel_remaining(session, "批次已取消").await;
        }
        self.set_phase(session, BatchPhase::ManualTesting)?;

        let io = ChannelIo::new(self.test_gateway.as_ref(), self.target_gateway.as_ref());
        let mut inbox = ConfirmationInbox::new(confirmations);
        let cancel = session.cancellation_token();

        for index in 0..session.mappings.len() {
            {
                let mapping = &session.mappings[index];
                let awaiting_manual = mapping.overall_status == ChannelTestStatus::Testing
                    && mapping.hard_point_status == SubTestStatus::Passed
                    && !mapping.manual_test_status.is_final();
                if !awaiting_manual {
                    continue;
                }
            }
            if cancel.is_cancelled() {
                return self.cancel_remaining(session, "批次已取消").await;
            }

            {
                let mapping = &mut session.mappings[index];
                if mapping.manual_test_status == ManualTestState::NotTested {
                    self.workflow.enter(mapping)?;
                }
                if mapping.manual_test_status == ManualTestState::Waiting {
                    self.workflow.start(mapping)?;
                }
            }
            self.persist_one(session, index).await?;

            while let Some(item) = self.workflow.next_pending_item(&session.mappings[index]) {
                let drive = self.workflow.drive_item(&session.mappings[index], item, &io).await;
                let result = match drive {
                    Ok(ItemDrive::Decided(result)) => result,
                    Ok(ItemDrive::AwaitOperator(pending)) => {
                        let mapping = &session.mappings[index];
                        self.emit(BatchEvent::ManualConfirmationRequested {
                            tag: session.tag.clone(),
                            instance_id: mapping.instance_id.clone(),
                            channel_tag: mapping.definition.tag.clone(),
                            sub_item: item,
                            driven_value: pending.driven_value,
                            observed_value: pending.observed_value,
                        });
                        let instance_id = mapping.instance_id.clone();
                        match inbox.wait_for(&instance_id, item, &cancel).await {
                            Some(confirmation) => self.workflow.apply_confirmation(pending, &confirmation),
                            None => {
                                if !cancel.is_cancelled() {
                                    log::warn!("批次 {} 的确认通道已关闭，取消剩余测试", session.tag);
                                    cancel.cancel();
                                }
                                self.workflow.restore_signal(&session.mappings[index], &io).await?;
                                return self.cancel_remaining(session, "等待确认时批次被取消").await;
                            }
                        }
                    }
                    Err(e) => {
                        let mut failed = ManualTestSubItemResult::new(item);
                        failed.status = SubTestStatus::Failed;
                        failed.operator_notes = Some(e.to_string());
                        failed.test_time = Some(Utc::now());
                        failed
                    }
                };

                self.workflow.record_result(&mut session.mappings[index], result)?;
                self.workflow.restore_signal(&session.mappings[index], &io).await?;
                self.persist_one(session, index).await?;
            }

            let manual = self.workflow.conclude(&mut session.mappings[index])?;
            if manual == ManualTestState::Passed {
                self.transition_channel(session, index, ChannelTestStatus::Passed)?;
            } else {
                let failed_items: Vec<String> = session.mappings[index]
                    .manual_results
                    .iter()
                    .filter(|r| r.status == SubTestStatus::Failed)
                    .map(|r| r.sub_item.to_string())
                    .collect();
                self.fail_channel(session, index, format!("人工测试未通过: {}", failed_items.join(", ")))?;
            }
            self.persist_one(session, index).await?;
            inbox.close_instance(&session.mappings[index].instance_id);
        }

        Ok(())
    }

    /// 汇总批次统计
    pub async fn aggregate(&self, session: &mut BatchSession) -> AppResult<TestBatchInfo> {
        self.set_phase(session, BatchPhase::Aggregating)?;
        let summary = session.summary();
        log::info!(
            "批次 {} 汇总: 共 {}，通过 {}，失败 {}，跳过 {}，通过率 {:.1}%",
            session.tag,
            summary.total_points,
            summary.passed_points,
            summary.failed_points,
            summary.skipped_points,
            summary.pass_rate() * 100.0
        );
        Ok(summary)
    }

    /// 结束批次并生成导出数据
    pub async fn finalize(&self, session: &mut BatchSession) -> AppResult<BatchReport> {
        self.set_phase(session, BatchPhase::Finalized)?;
        self.persist_all(session).await?;
        let summary = session.summary();
        self.emit(BatchEvent::BatchFinished {
            summary: summary.clone(),
            cancelled: false,
            finished_at: Utc::now(),
        });
        Ok(BatchReport::new(summary, session.mappings.clone()))
    }

    /// 依次执行全部阶段；被取消时返回取消时刻的批次数据
    pub async fn run_batch(
        &self,
        session: &mut BatchSession,
        confirmations: &mut mpsc::Receiver<OperatorConfirmation>,
    ) -> AppResult<BatchReport> {
        self.run_automated_tests(session).await?;
        if session.phase() != BatchPhase::Cancelled {
            self.run_manual_tests(session, confirmations).await?;
        }
        if session.phase() == BatchPhase::Cancelled {
            return Ok(BatchReport::new(session.summary(), session.mappings.clone()));
        }
        self.aggregate(session).await?;
        self.finalize(session).await
    }

    /// 取消：已完成通道保持原状态，其余通道标记为 Skipped
    async fn cancel_remaining(&self, session: &mut BatchSession, reason: &str) -> AppResult<()> {
        if session.phase.is_terminal() {
            return Ok(());
        }
        for index in 0..session.mappings.len() {
            if session.mappings[index].overall_status.is_terminal() {
                continue;
            }
            {
                let mapping = &mut session.mappings[index];
                match mapping.manual_test_status {
                    ManualTestState::Testing => self.workflow.abort(mapping, reason)?,
                    ManualTestState::NotTested | ManualTestState::Waiting => self.workflow.skip(mapping, reason)?,
                    _ => {}
                }
                if mapping.hard_point_status == SubTestStatus::NotTested {
                    mapping.hard_point_status = SubTestStatus::Skipped;
                    mapping.skip_remaining_samples();
                }
                mapping.error_message = Some(reason.to_string());
            }
            self.transition_channel(session, index, ChannelTestStatus::Skipped)?;
        }

        self.set_phase(session, BatchPhase::Cancelled)?;
        self.persist_all(session).await?;
        self.emit(BatchEvent::BatchFinished {
            summary: session.summary(),
            cancelled: true,
            finished_at: Utc::now(),
        });
        Ok(())
    }

    fn validate_definitions(tag: &str, definitions: &[ChannelPointDefinition]) -> AppResult<()> {
        if tag.trim().is_empty() {
            return Err(AppError::validation_error("批次标签不能为空"));
        }
        if definitions.is_empty() {
            return Err(AppError::validation_error(format!("批次 {} 没有任何通道定义", tag)));
        }

        let mut addresses = HashSet::new();
        for definition in definitions {
            definition.validate()?;
            if definition.batch_tag != tag {
                return Err(AppError::validation_error(format!(
                    "通道 {} 属于批次 {}，与当前批次 {} 不一致",
                    definition.tag, definition.batch_tag, tag
                )));
            }
            if definition.module_type.is_analog() && definition.range().is_none() {
                return Err(AppError::validation_error(format!(
                    "模拟量通道 {} 必须配置量程",
                    definition.tag
                )));
            }
            if !addresses.insert(definition.plc_communication_address.as_str()) {
                return Err(AppError::validation_error(format!(
                    "被测通道地址 {} 重复（通道 {}）",
                    definition.plc_communication_address, definition.tag
                )));
            }
        }
        Ok(())
    }

    fn set_phase(&self, session: &mut BatchSession, next: BatchPhase) -> AppResult<()> {
        let current = session.phase;
        if !current.can_transition_to(next) {
            return Err(AppError::state_transition_error(
                current.to_string(),
                next.to_string(),
                format!("批次 {} 不允许该阶段转换", session.tag),
            ));
        }
        crate::log_state_transition!("批次 {}: {} → {}", session.tag, current, next);
        session.phase = next;
        self.emit(BatchEvent::PhaseChanged {
            tag: session.tag.clone(),
            from: current,
            to: next,
        });
        Ok(())
    }

    fn transition_channel(&self, session: &mut BatchSession, index: usize, next: ChannelTestStatus) -> AppResult<()> {
        let mapping = &mut session.mappings[index];
        let previous = mapping.overall_status;
        mapping.transition_to(next)?;
        log::debug!("通道 {}: {} → {}", mapping.definition.tag, previous, next);
        self.emit(BatchEvent::ChannelStatusChanged {
            tag: session.tag.clone(),
            instance_id: mapping.instance_id.clone(),
            channel_tag: mapping.definition.tag.clone(),
            status: next,
            message: mapping.error_message.clone(),
        });
        Ok(())
    }

    fn fail_channel(&self, session: &mut BatchSession, index: usize, message: String) -> AppResult<()> {
        {
            let mapping = &mut session.mappings[index];
            if mapping.manual_test_status == ManualTestState::NotTested && self.workflow.requires_manual_test(mapping) {
                self.workflow.skip(mapping, "硬点测试未通过")?;
            }
            mapping.error_message = Some(message);
        }
        self.transition_channel(session, index, ChannelTestStatus::Failed)
    }

    async fn persist_one(&self, session: &BatchSession, index: usize) -> AppResult<()> {
        self.persist(&session.tag, std::slice::from_ref(&session.mappings[index])).await
    }

    async fn persist_all(&self, session: &BatchSession) -> AppResult<()> {
        self.persist(&session.tag, &session.mappings).await
    }

    /// 保存；失败时等待后重试一次
    async fn persist(&self, tag: &str, mappings: &[ChannelTestInstance]) -> AppResult<()> {
        let first = match self.store.save_test_records(tag, mappings).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        log::warn!(
            "批次 {} 保存失败，{}ms 后重试: {}",
            tag,
            self.config.persistence_retry_delay_ms,
            first
        );
        tokio::time::sleep(Duration::from_millis(self.config.persistence_retry_delay_ms)).await;

        self.store.save_test_records(tag, mappings).await.map_err(|second| {
            log::error!("批次 {} 保存重试失败: {}", tag, second);
            AppError::persistence_error(format!("批次 {} 保存失败（已重试一次）: {}", tag, second))
        })
    }

    /// 新建批次的首次保存；同名冲突直接返回，其余失败按保存策略重试一次
    async fn persist_new_batch(&self, session: &BatchSession) -> AppResult<()> {
        let tag = session.tag.as_str();
        let first = match self.store.create_batch_records(tag, &session.mappings).await {
            Ok(()) => return Ok(()),
            Err(e @ AppError::BatchConflict { .. }) => return Err(e),
            Err(e) => e,
        };
        log::warn!(
            "批次 {} 创建失败，{}ms 后重试: {}",
            tag,
            self.config.persistence_retry_delay_ms,
            first
        );
        tokio::time::sleep(Duration::from_millis(self.config.persistence_retry_delay_ms)).await;

        match self.store.create_batch_records(tag, &session.mappings).await {
            Ok(()) => Ok(()),
            Err(e @ AppError::BatchConflict { .. }) => Err(e),
            Err(second) => {
                log::error!("批次 {} 创建重试失败: {}", tag, second);
                Err(AppError::persistence_error(format!(
                    "批次 {} 创建失败（已重试一次）: {}",
                    tag, second
                )))
            }
        }
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.event_tx {
            // 接收端关闭不影响测试执行
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModuleType;
    use crate::services::infrastructure::persistence::test_record_store::MockITestRecordStore;
    use crate::services::infrastructure::persistence::BatchLeaseRegistry;
    use crate::services::infrastructure::plc::MockTestBench;
    use mockall::Sequence;

    fn fast_config() -> TestConfig {
        TestConfig {
            analog_stabilization_time_ms: 0,
            digital_stabilization_time_ms: 0,
            alarm_test_wait_time_ms: 0,
            persistence_retry_delay_ms: 1,
            require_show_value_check: false,
            ..Default::default()
        }
    }

    fn orchestrator(store: MockITestRecordStore) -> BatchOrchestrator {
        let bench = MockTestBench::new();
        BatchOrchestrator::new(
            bench.test_gateway(),
            bench.target_gateway(),
            Arc::new(store),
            RangeConverter::new(),
            fast_config(),
        )
    }

    fn definitions(tag: &str) -> Vec<ChannelPointDefinition> {
        vec![ChannelPointDefinition::new("TT_1", ModuleType::AI, "40001", tag).with_range(0.0, 100.0)]
    }

    fn channels() -> Vec<TestPlcChannelConfig> {
        vec![TestPlcChannelConfig::new("AO1_1", ModuleType::AO, "40101")]
    }

    fn store_with_registry() -> MockITestRecordStore {
        let mut store = MockITestRecordStore::new();
        store.expect_lease_registry().return_const(BatchLeaseRegistry::new());
        store
    }

    #[tokio::test]
    async fn test_save_failure_is_retried_once() {
        let mut store = store_with_registry();
        let mut seq = Sequence::new();
        store
            .expect_create_batch_records()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(AppError::persistence_error("database is locked")));
        store
            .expect_create_batch_records()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let orchestrator = orchestrator(store);
        let session = orchestrator.create_batch("B1", definitions("B1"), &channels()).await;

        tokio_test::assert_ok!(session);
    }

    #[tokio::test]
    async fn test_second_save_failure_is_fatal() {
        let mut store = store_with_registry();
        store
            .expect_create_batch_records()
            .times(2)
            .returning(|_, _| Err(AppError::persistence_error("disk I/O error")));

        let orchestrator = orchestrator(store);
        let result = orchestrator.create_batch("B1", definitions("B1"), &channels()).await;

        match result {
            Err(e) => assert!(e.is_fatal_for_batch(), "重试后仍失败应该是致命错误: {}", e),
            Ok(_) => panic!("保存失败时不应该创建批次"),
        }
    }

    #[tokio::test]
    async fn test_existing_tag_in_store_is_not_retried() {
        let mut store = store_with_registry();
        store
            .expect_create_batch_records()
            .times(1)
            .returning(|tag, _| Err(AppError::batch_conflict(tag, "已存在")));

        let orchestrator = orchestrator(store);
        let result = orchestrator.create_batch("B1", definitions("B1"), &channels()).await;
        assert!(matches!(result, Err(AppError::BatchConflict { .. })), "同名冲突不应该重试或升级为持久化错误");
    }

    #[tokio::test]
    async fn test_tag_lease_prevents_concurrent_sessions() {
        let mut store = store_with_registry();
        store.expect_create_batch_records().returning(|_, _| Ok(()));
        let orchestrator = orchestrator(store);

        let first = orchestrator.create_batch("B1", definitions("B1"), &channels()).await.unwrap();
        let second = orchestrator.create_batch("B1", definitions("B1"), &channels()).await;
        assert!(matches!(second, Err(AppError::BatchConflict { .. })), "同一标签不能同时存在两个会话");

        drop(first);
        tokio_test::assert_ok!(orchestrator.create_batch("B1", definitions("B1"), &channels()).await);
    }

    #[tokio::test]
    async fn test_invalid_definitions_are_rejected_before_lease() {
        let store = MockITestRecordStore::new();
        let orchestrator = orchestrator(store);

        let wrong_tag = definitions("OTHER");
        tokio_test::assert_err!(orchestrator.create_batch("B1", wrong_tag, &channels()).await);

        let mut duplicated = definitions("B1");
        duplicated.push(ChannelPointDefinition::new("TT_2", ModuleType::AI, "40001", "B1").with_range(0.0, 10.0));
        tokio_test::assert_err!(orchestrator.create_batch("B1", duplicated, &channels()).await);

        let no_range = vec![ChannelPointDefinition::new("TT_3", ModuleType::AI, "40005", "B1")];
        tokio_test::assert_err!(orchestrator.create_batch("B1", no_range, &channels()).await);
    }

    #[tokio::test]
    async fn test_phase_order_is_enforced() {
        let mut store = store_with_registry();
        store.expect_create_batch_records().returning(|_, _| Ok(()));
        let orchestrator = orchestrator(store);

        let mut session = orchestrator.create_batch("B1", definitions("B1"), &channels()).await.unwrap();
        assert_eq!(session.phase(), BatchPhase::Allocating);
        tokio_test::assert_err!(orchestrator.aggregate(&mut session).await, "不能跳过测试阶段直接汇总");
    }

    #[test]
    fn test_from_config_builds_modbus_gateways() {
        let config = AppConfig::default();
        let orchestrator = BatchOrchestrator::from_config(&config, Arc::new(MockITestRecordStore::new()));
        assert!(orchestrator.is_ok(), "默认配置应该可以组装引擎");

        let mut bad = AppConfig::default();
        bad.target_plc.byte_order = "XYZW".to_string();
        assert!(BatchOrchestrator::from_config(&bad, Arc::new(MockITestRecordStore::new())).is_err());
    }
}
