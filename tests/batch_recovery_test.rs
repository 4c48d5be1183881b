//! 批次恢复与旧数据迁移集成测试

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fat_test_engine::models::entities::channel_mapping::{self, LEGACY_ABSENT_SENTINEL};
use fat_test_engine::utils::TestConfig;
use fat_test_engine::{
    AppError, AppResult, BatchLeaseRegistry, BatchOrchestrator, BenchSide, ChannelPointDefinition,
    ChannelTestInstance, ChannelTestStatus, ITestRecordStore, MockTestBench, ModuleType, RangeConverter,
    SqliteTestRecordStore, SubTestStatus, TestBatchInfo, TestPlcChannelConfig,
};
use sea_orm::ActiveModelTrait;
use sea_orm::ActiveValue::Set;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_config() -> TestConfig {
    TestConfig {
        analog_stabilization_time_ms: 0,
        digital_stabilization_time_ms: 0,
        alarm_test_wait_time_ms: 0,
        persistence_retry_delay_ms: 10,
        require_show_value_check: false,
        ..Default::default()
    }
}

fn target_address(index: usize) -> String {
    format!("4{:04}", 1 + index * 2)
}

fn test_address(index: usize) -> String {
    format!("4{:04}", 101 + index * 2)
}

fn instance(batch: &str, index: usize) -> ChannelTestInstance {
    let definition = ChannelPointDefinition::new(format!("TT_{}", index + 1), ModuleType::AI, target_address(index), batch)
        .with_range(0.0, 100.0);
    let channel = TestPlcChannelConfig::new(format!("AO1_{}", index + 1), ModuleType::AO, test_address(index));
    ChannelTestInstance::new(definition, index as u32, &channel)
}

fn definition(batch: &str, index: usize) -> ChannelPointDefinition {
    ChannelPointDefinition::new(format!("TT_{}", index + 1), ModuleType::AI, target_address(index), batch)
        .with_range(0.0, 100.0)
}

fn test_channels(count: usize) -> Vec<TestPlcChannelConfig> {
    (0..count)
        .map(|index| TestPlcChannelConfig::new(format!("AO1_{}", index + 1), ModuleType::AO, test_address(index)))
        .collect()
}

fn orchestrator(bench: &MockTestBench, store: Arc<dyn ITestRecordStore>) -> BatchOrchestrator {
    BatchOrchestrator::new(
        bench.test_gateway(),
        bench.target_gateway(),
        store,
        RangeConverter::new(),
        fast_config(),
    )
}

/// 第 N 次通道结论落盘之后进程"掉电"：后续保存永远不返回
struct PowerLossStore {
    inner: SqliteTestRecordStore,
    conclusions_before_loss: usize,
    concluded: AtomicUsize,
    lost: Notify,
}

impl PowerLossStore {
    async fn open(path: &Path, conclusions_before_loss: usize) -> Self {
        Self {
            inner: SqliteTestRecordStore::open(path).await.unwrap(),
            conclusions_before_loss,
            concluded: AtomicUsize::new(0),
            lost: Notify::new(),
        }
    }
}

#[async_trait]
impl ITestRecordStore for PowerLossStore {
    fn lease_registry(&self) -> BatchLeaseRegistry {
        self.inner.lease_registry()
    }

    async fn create_batch_records(&self, tag: &str, mappings: &[ChannelTestInstance]) -> AppResult<()> {
        self.inner.create_batch_records(tag, mappings).await
    }

    async fn save_test_records(&self, tag: &str, mappings: &[ChannelTestInstance]) -> AppResult<()> {
        if self.concluded.load(Ordering::SeqCst) >= self.conclusions_before_loss {
            self.lost.notify_one();
            return std::future::pending::<AppResult<()>>().await;
        }
        self.inner.save_test_records(tag, mappings).await?;
        if mappings.len() == 1 && mappings[0].overall_status.is_terminal() {
            self.concluded.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn restore_test_records(&self, tag: &str) -> AppResult<Vec<ChannelTestInstance>> {
        self.inner.restore_test_records(tag).await
    }

    async fn get_all_batches(&self) -> AppResult<Vec<TestBatchInfo>> {
        self.inner.get_all_batches().await
    }

    async fn delete_batch(&self, tag: &str) -> AppResult<u64> {
        self.inner.delete_batch(tag).await
    }

    async fn migrate_legacy_sentinels(&self) -> AppResult<u64> {
        self.inner.migrate_legacy_sentinels().await
    }
}

/// 通道 3 和 6 接错线
const MISWIRED: [usize; 2] = [2, 5];

#[tokio::test]
async fn test_resume_after_power_loss_mid_batch() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("records.db");

    {
        let store = Arc::new(PowerLossStore::open(&db_path, 8).await);
        let bench = MockTestBench::new();
        for index in 0..10 {
            if MISWIRED.contains(&index) {
                bench.wire(test_address(index), format!("4{:04}", 901 + index * 2));
            } else {
                bench.wire(test_address(index), target_address(index));
            }
        }
        let orchestrator = orchestrator(&bench, store.clone());
        orchestrator.connect_gateways().await.unwrap();
        let definitions = (0..10).map(|index| definition("PWR", index)).collect();
        let mut session = orchestrator.create_batch("PWR", definitions, &test_channels(10)).await.unwrap();

        let (_confirm_tx, mut confirm_rx) = mpsc::channel(1);
        tokio::select! {
            _ = orchestrator.run_batch(&mut session, &mut confirm_rx) => panic!("掉电后批次不应该完成"),
            _ = store.lost.notified() => {}
        }
    }

    // 重新打开，相当于进程重启；这次台架接线全部正确
    let store = Arc::new(SqliteTestRecordStore::open(&db_path).await.unwrap());
    let persisted: Vec<ChannelTestStatus> = store
        .restore_test_records("PWR")
        .await
        .unwrap()
        .iter()
        .map(|m| m.overall_status)
        .collect();
    let count = |status: ChannelTestStatus| persisted.iter().filter(|s| **s == status).count();
    assert_eq!(count(ChannelTestStatus::Passed), 6);
    assert_eq!(count(ChannelTestStatus::Failed), 2);
    assert_eq!(count(ChannelTestStatus::Waiting), 2, "掉电时未开始的通道保持等待: {:?}", persisted);

    let bench = MockTestBench::new();
    for index in 0..10 {
        bench.wire(test_address(index), target_address(index));
    }
    let orchestrator = orchestrator(&bench, store.clone());
    orchestrator.connect_gateways().await.unwrap();

    let mut session = orchestrator.resume_batch("PWR").await.expect("恢复批次应该成功");
    for index in MISWIRED {
        let failed = &session.mappings()[index];
        assert_eq!(failed.overall_status, ChannelTestStatus::Failed, "失败结论必须保留");
        assert_eq!(failed.analog_samples[1].status, SubTestStatus::Failed);
        assert_eq!(failed.analog_samples[1].actual, Some(0.0), "失败点的实际值必须保留");
    }

    let (_confirm_tx, mut confirm_rx) = mpsc::channel(1);
    let report = orchestrator.run_batch(&mut session, &mut confirm_rx).await.unwrap();
    assert!(!report.all_passed);
    assert_eq!(report.batch.passed_points, 8);
    assert_eq!(report.batch.failed_points, 2);

    let tested: Vec<String> = bench
        .operation_log()
        .into_iter()
        .filter(|op| op.side == BenchSide::Test)
        .map(|op| op.address)
        .collect();
    for index in 0..8 {
        assert!(!tested.contains(&test_address(index)), "通道 {} 已有结论，不应该被重测", index + 1);
    }
    for index in 8..10 {
        assert!(tested.contains(&test_address(index)), "通道 {} 应该被测试", index + 1);
    }

    let restored = store.restore_test_records("PWR").await.unwrap();
    for index in MISWIRED {
        assert_eq!(restored[index].overall_status, ChannelTestStatus::Failed);
    }
}

/// 测试中途中断时的存储状态：6 通过，2 等待，2 测试中
async fn seed_interrupted_batch(store: &SqliteTestRecordStore, batch: &str) {
    let mut mappings = Vec::new();
    for index in 0..10 {
        let mut mapping = instance(batch, index);
        match index {
            0..=5 => {
                mapping.transition_to(ChannelTestStatus::Testing).unwrap();
                for (i, pct) in [0.0, 25.0, 50.0, 75.0, 100.0].into_iter().enumerate() {
                    mapping.record_sample(i, pct, Some(pct), SubTestStatus::Passed).unwrap();
                }
                mapping.hard_point_status = SubTestStatus::Passed;
                mapping.transition_to(ChannelTestStatus::Passed).unwrap();
            }
            6..=7 => mapping.transition_to(ChannelTestStatus::Waiting).unwrap(),
            _ => {
                mapping.transition_to(ChannelTestStatus::Testing).unwrap();
                mapping.hard_point_status = SubTestStatus::Testing;
                mapping.record_sample(0, 0.0, Some(0.02), SubTestStatus::Passed).unwrap();
            }
        }
        mappings.push(mapping);
    }
    store.save_test_records(batch, &mappings).await.unwrap();
}

#[tokio::test]
async fn test_resume_resets_channels_interrupted_mid_test() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("records.db");
    {
        let store = SqliteTestRecordStore::open(&db_path).await.unwrap();
        seed_interrupted_batch(&store, "REC").await;
    }

    // 重新打开，相当于进程重启
    let store = Arc::new(SqliteTestRecordStore::open(&db_path).await.unwrap());
    let bench = MockTestBench::new();
    for index in 0..10 {
        bench.wire(test_address(index), target_address(index));
    }
    let orchestrator = BatchOrchestrator::new(
        bench.test_gateway(),
        bench.target_gateway(),
        store.clone(),
        RangeConverter::new(),
        fast_config(),
    );
    orchestrator.connect_gateways().await.unwrap();

    let mut session = orchestrator.resume_batch("REC").await.expect("恢复批次应该成功");
    let statuses: Vec<ChannelTestStatus> = session.mappings().iter().map(|m| m.overall_status).collect();
    assert_eq!(statuses.iter().filter(|s| **s == ChannelTestStatus::Passed).count(), 6);
    assert_eq!(statuses.iter().filter(|s| **s == ChannelTestStatus::Waiting).count(), 2);
    assert_eq!(statuses.iter().filter(|s| **s == ChannelTestStatus::NotTested).count(), 2, "中断的通道应该被复位");

    for interrupted in &session.mappings()[8..] {
        assert_eq!(interrupted.retries_count, 1);
        assert!(interrupted.analog_samples.iter().all(|s| !s.is_written()), "复位后采样应该清空");
    }
    assert!(
        matches!(orchestrator.resume_batch("REC").await, Err(AppError::BatchConflict { .. })),
        "同一批次不能被恢复两次"
    );

    let (_confirm_tx, mut confirm_rx) = mpsc::channel(1);
    let report = orchestrator.run_batch(&mut session, &mut confirm_rx).await.unwrap();
    assert!(report.all_passed, "恢复后剩余通道应该全部通过");
    assert_eq!(report.batch.passed_points, 10);

    // 已通过的通道不应该被重新测试
    let retested: Vec<String> = bench
        .operation_log()
        .into_iter()
        .filter(|op| op.side == BenchSide::Test)
        .map(|op| op.address)
        .collect();
    for index in 0..6 {
        assert!(!retested.contains(&test_address(index)), "通道 {} 不应该被重测", index + 1);
    }
    for index in 6..10 {
        assert!(retested.contains(&test_address(index)), "通道 {} 应该被测试", index + 1);
    }

    let restored = store.restore_test_records("REC").await.unwrap();
    assert!(restored.iter().all(|m| m.overall_status == ChannelTestStatus::Passed));
}

#[tokio::test]
async fn test_resume_unknown_batch_is_not_found() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteTestRecordStore::open(dir.path().join("records.db")).await.unwrap());
    let bench = MockTestBench::new();
    let orchestrator = BatchOrchestrator::new(
        bench.test_gateway(),
        bench.target_gateway(),
        store,
        RangeConverter::new(),
        fast_config(),
    );

    let result = orchestrator.resume_batch("MISSING").await;
    assert!(matches!(result, Err(AppError::NotFoundError { .. })));
}

#[tokio::test]
async fn test_legacy_sentinel_rows_read_as_absent_and_migrate() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteTestRecordStore::open(dir.path().join("records.db")).await.unwrap());

    // 旧版本写入的数据：未测的百分比点用哨兵值占位
    for index in 0..3 {
        let mapping = instance("LEGACY", index);
        let mut row = channel_mapping::ActiveModel::from(&mapping);
        row.expected_75_percent = Set(Some(LEGACY_ABSENT_SENTINEL));
        row.actual_75_percent = Set(Some(LEGACY_ABSENT_SENTINEL + 0.25));
        row.actual_100_percent = Set(Some(LEGACY_ABSENT_SENTINEL));
        row.insert(store.connection()).await.unwrap();
    }

    let bench = MockTestBench::new();
    let orchestrator = BatchOrchestrator::new(
        bench.test_gateway(),
        bench.target_gateway(),
        store.clone(),
        RangeConverter::new(),
        fast_config(),
    );
    {
        let session = orchestrator.resume_batch("LEGACY").await.unwrap();
        for mapping in session.mappings() {
            assert_eq!(mapping.analog_samples[3].expected, None, "哨兵值必须表现为缺失");
            assert_eq!(mapping.analog_samples[3].actual, None);
            assert_eq!(mapping.analog_samples[4].actual, None);
        }
    }

    assert_eq!(store.migrate_legacy_sentinels().await.unwrap(), 3);
    assert_eq!(store.migrate_legacy_sentinels().await.unwrap(), 0);

    let restored = store.restore_test_records("LEGACY").await.unwrap();
    assert_eq!(restored.len(), 3);
    assert!(restored.iter().all(|m| m.last_actual_value().is_none()));
}
