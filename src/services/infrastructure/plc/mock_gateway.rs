//! Mock 测试台架
//!
//! 在内存中模拟"测试PLC ↔ 被测PLC"硬接线台架，用于开发联调和自动化测试：
//! - 通过接线表把测试侧地址与被测侧地址连接起来，一侧写入另一侧即可读到
//! - 可以给被测侧配置报警规则，报警反馈地址的读值由模拟量实时计算
//! - 支持故障注入（指定错误类型、次数与延后生效的操作数）和读数噪声
//! - 记录全部操作日志，便于验证调用顺序；可以挂接操作钩子，在第 N 次操作后触发动作

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::device_gateway::{ConnectionStats, DeviceInfo, IDeviceGateway};
use super::plc_result::{GatewayErrorKind, PlcResult};

/// 台架的哪一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BenchSide {
    Test,
    Target,
}

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchOperationKind {
    ReadAnalog,
    WriteAnalog,
    ReadDigital,
    WriteDigital,
}

/// 操作日志条目
#[derive(Debug, Clone, PartialEq)]
pub struct BenchOperation {
    pub side: BenchSide,
    pub kind: BenchOperationKind,
    pub address: String,
    pub value: Option<f64>,
}

/// 故障注入：跳过 `skip` 次操作后，接下来 `remaining` 次操作返回 `kind` 错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInjection {
    pub kind: GatewayErrorKind,
    pub remaining: u32,
    pub skip: u32,
}

impl FaultInjection {
    pub fn new(kind: GatewayErrorKind, count: u32) -> Self {
        Self {
            kind,
            remaining: count,
            skip: 0,
        }
    }

    /// 先放行 `operations` 次操作再生效
    pub fn after(mut self, operations: u32) -> Self {
        self.skip = operations;
        self
    }
}

/// 操作钩子，参数为台架累计的成功操作数
type OperationHook = Arc<dyn Fn(usize) + Send + Sync>;

/// 被测侧报警规则：模拟量越过设定值时反馈地址读为 true
#[derive(Debug, Clone, PartialEq)]
struct AlarmRule {
    analog_address: String,
    set_value: f64,
    low_side: bool,
}

#[derive(Default)]
struct BenchState {
    analog: HashMap<(BenchSide, String), f64>,
    digital: HashMap<(BenchSide, String), bool>,
    /// 测试侧地址 → 被测侧地址
    test_to_target: HashMap<String, String>,
    /// 被测侧地址 → 测试侧地址
    target_to_test: HashMap<String, String>,
    alarm_rules: HashMap<String, AlarmRule>,
    faults: HashMap<BenchSide, VecDeque<FaultInjection>>,
    analog_noise: f64,
    log: Vec<BenchOperation>,
    operation_hook: Option<OperationHook>,
}

impl BenchState {
    fn peer_address(&self, side: BenchSide, address: &str) -> Option<(BenchSide, String)> {
        match side {
            BenchSide::Test => self
                .test_to_target
                .get(address)
                .map(|a| (BenchSide::Target, a.clone())),
            BenchSide::Target => self
                .target_to_test
                .get(address)
                .map(|a| (BenchSide::Test, a.clone())),
        }
    }

    fn take_fault(&mut self, side: BenchSide) -> Option<GatewayErrorKind> {
        let queue = self.faults.get_mut(&side)?;
        let front = queue.front_mut()?;
        if front.skip > 0 {
            front.skip -= 1;
            return None;
        }
        front.remaining = front.remaining.saturating_sub(1);
        let kind = front.kind;
        if front.remaining == 0 {
            queue.pop_front();
        }
        Some(kind)
    }

    fn alarm_state(&self, address: &str) -> Option<bool> {
        let rule = self.alarm_rules.get(address)?;
        let value = self
            .analog
            .get(&(BenchSide::Target, rule.analog_address.clone()))
            .copied()
            .unwrap_or(0.0);
        Some(if rule.low_side {
            value <= rule.set_value
        } else {
            value >= rule.set_value
        })
    }
}

/// Mock 测试台架，持有测试侧与被测侧两个网关
pub struct MockTestBench {
    state: Arc<Mutex<BenchState>>,
    test: Arc<MockDeviceGateway>,
    target: Arc<MockDeviceGateway>,
}

impl Default for MockTestBench {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTestBench {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// 每次操作模拟的链路往返时间
    pub fn with_latency(latency: Duration) -> Self {
        let state = Arc::new(Mutex::new(BenchState::default()));
        let test = Arc::new(MockDeviceGateway::new("MockTestPLC", BenchSide::Test, state.clone(), latency));
        let target = Arc::new(MockDeviceGateway::new("MockTargetPLC", BenchSide::Target, state.clone(), latency));
        Self { state, test, target }
    }

    pub fn test_gateway(&self) -> Arc<MockDeviceGateway> {
        self.test.clone()
    }

    pub fn target_gateway(&self) -> Arc<MockDeviceGateway> {
        self.target.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 硬接线：测试侧地址 ↔ 被测侧地址
    pub fn wire(&self, test_address: impl Into<String>, target_address: impl Into<String>) {
        let test_address = test_address.into();
        let target_address = target_address.into();
        let mut state = self.lock();
        state.test_to_target.insert(test_address.clone(), target_address.clone());
        state.target_to_test.insert(target_address, test_address);
    }

    /// 在被测侧配置报警反馈
    pub fn add_alarm_rule(
        &self,
        feedback_address: impl Into<String>,
        analog_address: impl Into<String>,
        set_value: f64,
        low_side: bool,
    ) {
        self.lock().alarm_rules.insert(
            feedback_address.into(),
            AlarmRule {
                analog_address: analog_address.into(),
                set_value,
                low_side,
            },
        );
    }

    /// 模拟量读数的均匀噪声幅值（工程量）
    pub fn set_analog_noise(&self, amplitude: f64) {
        self.lock().analog_noise = amplitude.abs();
    }

    pub fn set_target_analog(&self, address: impl Into<String>, value: f64) {
        self.lock().analog.insert((BenchSide::Target, address.into()), value);
    }

    pub fn set_test_analog(&self, address: impl Into<String>, value: f64) {
        self.lock().analog.insert((BenchSide::Test, address.into()), value);
    }

    pub fn set_target_digital(&self, address: impl Into<String>, value: bool) {
        self.lock().digital.insert((BenchSide::Target, address.into()), value);
    }

    pub fn set_test_digital(&self, address: impl Into<String>, value: bool) {
        self.lock().digital.insert((BenchSide::Test, address.into()), value);
    }

    pub fn target_digital(&self, address: &str) -> Option<bool> {
        self.lock().digital.get(&(BenchSide::Target, address.to_string())).copied()
    }

    pub fn test_digital(&self, address: &str) -> Option<bool> {
        self.lock().digital.get(&(BenchSide::Test, address.to_string())).copied()
    }

    pub fn target_analog(&self, address: &str) -> Option<f64> {
        self.lock().analog.get(&(BenchSide::Target, address.to_string())).copied()
    }

    pub fn test_analog(&self, address: &str) -> Option<f64> {
        self.lock().analog.get(&(BenchSide::Test, address.to_string())).copied()
    }

    pub fn inject_test_fault(&self, fault: FaultInjection) {
        self.lock().faults.entry(BenchSide::Test).or_default().push_back(fault);
    }

    pub fn inject_target_fault(&self, fault: FaultInjection) {
        self.lock().faults.entry(BenchSide::Target).or_default().push_back(fault);
    }

    pub fn remaining_target_faults(&self) -> u32 {
        self.lock()
            .faults
            .get(&BenchSide::Target)
            .map(|q| q.iter().map(|f| f.remaining).sum())
            .unwrap_or(0)
    }

    pub fn operation_log(&self) -> Vec<BenchOperation> {
        self.lock().log.clone()
    }

    pub fn clear_operation_log(&self) {
        self.lock().log.clear();
    }

    /// 每次操作成功后以累计操作数调用 `hook`
    ///
    /// 钩子在释放台架状态锁之后同步调用，可以用来在第 N 次操作后
    /// 取消批次或调整台架，让依赖时序的测试变成确定性的
    pub fn set_operation_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        self.lock().operation_hook = Some(Arc::new(hook));
    }

    pub fn clear_operation_hook(&self) {
        self.lock().operation_hook = None;
    }
}

/// 链路上正在执行的请求计数，离开作用域时减一
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(in_flight: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(in_flight)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 台架上某一侧的网关
pub struct MockDeviceGateway {
    name: String,
    side: BenchSide,
    state: Arc<Mutex<BenchState>>,
    /// 模拟单条物理链路，保证同一网关上的请求串行
    link: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    connected: AtomicBool,
    latency: Duration,
    stats: Mutex<ConnectionStats>,
}

impl MockDeviceGateway {
    fn new(name: &str, side: BenchSide, state: Arc<Mutex<BenchState>>, latency: Duration) -> Self {
        Self {
            name: name.to_string(),
            side,
            state,
            link: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            latency,
            stats: Mutex::new(ConnectionStats::default()),
        }
    }

    /// 链路上同时执行的请求数峰值
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record<T>(&self, result: PlcResult<T>) -> PlcResult<T> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(&result);
        result
    }

    /// 在链路上执行一次请求：串行化、模拟延迟、检查连接与故障注入
    async fn transact<T>(
        &self,
        kind: BenchOperationKind,
        address: &str,
        value: Option<f64>,
        apply: impl FnOnce(&mut BenchState) -> T,
    ) -> PlcResult<T> {
        let _link = self.link.lock().await;
        let _in_flight = InFlightGuard::enter(&self.in_flight, &self.peak_in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return self.record(PlcResult::err(
                GatewayErrorKind::NotConnected,
                format!("{} 未连接", self.name),
            ));
        }

        let mut state = self.lock_state();
        if let Some(kind) = state.take_fault(self.side) {
            drop(state);
            return self.record(
                PlcResult::err(kind, format!("{} 注入故障: {}", self.name, kind)).with_cause("mock fault injection"),
            );
        }

        state.log.push(BenchOperation {
            side: self.side,
            kind,
            address: address.to_string(),
            value,
        });
        let count = state.log.len();
        let hook = state.operation_hook.clone();
        let data = apply(&mut state);
        drop(state);
        if let Some(hook) = hook {
            hook(count);
        }
        self.record(PlcResult::ok(data))
    }
}

#[async_trait]
impl IDeviceGateway for MockDeviceGateway {
    async fn connect(&self) -> PlcResult<()> {
        let _link = self.link.lock().await;
        self.connected.store(true, Ordering::SeqCst);
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .connection_count += 1;
        log::debug!("[{}] 已连接", self.name);
        PlcResult::ok(())
    }

    async fn disconnect(&self) -> PlcResult<()> {
        let _link = self.link.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        PlcResult::ok(())
    }

    async fn read_analog(&self, address: &str) -> PlcResult<f64> {
        let side = self.side;
        let key = (side, address.to_string());
        self.transact(BenchOperationKind::ReadAnalog, address, None, move |state| {
            let value = state.analog.get(&key).copied().unwrap_or(0.0);
            if state.analog_noise > 0.0 {
                let noise = state.analog_noise;
                value + rand::thread_rng().gen_range(-noise..=noise)
            } else {
                value
            }
        })
        .await
    }

    async fn write_analog(&self, address: &str, value: f64) -> PlcResult<()> {
        let side = self.side;
        let address_owned = address.to_string();
        self.transact(BenchOperationKind::WriteAnalog, address, Some(value), move |state| {
            if let Some(peer) = state.peer_address(side, &address_owned) {
                state.analog.insert(peer, value);
            }
            state.analog.insert((side, address_owned), value);
        })
        .await
    }

    async fn read_digital(&self, address: &str) -> PlcResult<bool> {
        let side = self.side;
        let address_owned = address.to_string();
        self.transact(BenchOperationKind::ReadDigital, address, None, move |state| {
            if side == BenchSide::Target {
                if let Some(alarm) = state.alarm_state(&address_owned) {
                    return alarm;
                }
            }
            state.digital.get(&(side, address_owned)).copied().unwrap_or(false)
        })
        .await
    }

    async fn write_digital(&self, address: &str, value: bool) -> PlcResult<()> {
        let side = self.side;
        let address_owned = address.to_string();
        let logged = if value { 1.0 } else { 0.0 };
        self.transact(BenchOperationKind::WriteDigital, address, Some(logged), move |state| {
            if let Some(peer) = state.peer_address(side, &address_owned) {
                state.digital.insert(peer, value);
            }
            state.digital.insert((side, address_owned), value);
        })
        .await
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
            name: self.name.clone(),
            endpoint: format!("mock://{:?}", self.side).to_lowercase(),
            protocol: "Mock".to_string(),
            connected: self.connected.load(Ordering::SeqCst),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wired_addresses_propagate_both_ways() {
        let bench = MockTestBench::new();
        bench.wire("40101", "40001");
        let test = bench.test_gateway();
        let target = bench.target_gateway();
        test.connect().await;
        target.connect().await;

        assert!(test.write_analog("40101", 12.5).await.is_ok());
        assert_eq!(target.read_analog("40001").await.data, Some(12.5));

        assert!(target.write_digital("40001", true).await.is_ok());
        assert_eq!(test.read_digital("40101").await.data, Some(true));
    }

    #[tokio::test]
    async fn test_operations_fail_when_not_connected() {
        let bench = MockTestBench::new();
        let result = bench.target_gateway().read_analog("40001").await;
        assert_eq!(result.error_kind(), Some(GatewayErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn test_alarm_rule_follows_analog_value() {
        let bench = MockTestBench::new();
        bench.wire("40101", "40001");
        bench.add_alarm_rule("00011", "40001", 80.0, false);
        let test = bench.test_gateway();
        let target = bench.target_gateway();
        test.connect().await;
        target.connect().await;

        test.write_analog("40101", 50.0).await;
        assert_eq!(target.read_digital("00011").await.data, Some(false));
        test.write_analog("40101", 85.0).await;
        assert_eq!(target.read_digital("00011").await.data, Some(true));
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_gateway_are_serialized() {
        let bench = MockTestBench::with_latency(Duration::from_millis(5));
        let target = bench.target_gateway();
        target.connect().await;

        let writes = (0..5).map(|i| {
            let target = target.clone();
            tokio::spawn(async move { target.write_analog(&format!("4000{}", i), i as f64).await })
        });
        for handle in writes {
            assert!(handle.await.unwrap().is_ok());
        }

        let log = bench.operation_log();
        assert_eq!(log.len(), 5, "每个请求都应该完整执行");
        let info = target.get_device_info().await.data.unwrap();
        assert_eq!(info.stats.successful_operations, 5);
        assert_eq!(target.peak_in_flight(), 1, "同一网关上的请求不能重叠执行");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requests_never_overlap_across_worker_threads() {
        let bench = MockTestBench::with_latency(Duration::from_millis(2));
        let test = bench.test_gateway();
        test.connect().await;

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let test = test.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        test.write_digital("00101", i % 4 == 0).await.is_ok()
                    } else {
                        test.read_analog("40101").await.is_ok()
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(test.peak_in_flight(), 1);
        assert_eq!(bench.operation_log().len(), 16);
    }

    #[tokio::test]
    async fn test_delayed_fault_lets_earlier_operations_through() {
        let bench = MockTestBench::new();
        let test = bench.test_gateway();
        test.connect().await;
        bench.inject_test_fault(FaultInjection::new(GatewayErrorKind::Timeout, 1).after(2));

        assert!(test.write_analog("40101", 1.0).await.is_ok());
        assert!(test.write_analog("40101", 2.0).await.is_ok());
        assert_eq!(test.write_analog("40101", 3.0).await.error_kind(), Some(GatewayErrorKind::Timeout));
        assert!(test.write_analog("40101", 4.0).await.is_ok());
        assert_eq!(bench.test_analog("40101"), Some(4.0));
    }

    #[tokio::test]
    async fn test_operation_hook_sees_running_count() {
        let bench = MockTestBench::new();
        let test = bench.test_gateway();
        test.connect().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        bench.set_operation_hook({
            let seen = seen.clone();
            move |count| seen.lock().unwrap().push(count)
        });

        for _ in 0..3 {
            test.read_digital("00101").await;
        }
        bench.clear_operation_hook();
        test.read_digital("00101").await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
