//! 设备网关接口
//!
//! 测试PLC与被测PLC各持有一个网关实例，二者接口完全对称。
//! 每个实例只拥有一条物理连接，同一实例上的并发调用在实现内部串行化，
//! 两个实例之间互不影响，可以并发驱动。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::plc_result::PlcResult;
use crate::utils::config::PlcConnectionConfig;

/// 通信统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// 连接建立次数
    pub connection_count: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// 因瞬时故障而重试的次数
    pub retried_operations: u64,
    pub last_error: Option<String>,
    pub last_communication_time: Option<DateTime<Utc>>,
}

impl ConnectionStats {
    pub fn record<T>(&mut self, result: &PlcResult<T>) {
        self.last_communication_time = Some(Utc::now());
        if result.is_ok() {
            self.successful_operations += 1;
        } else {
            self.failed_operations += 1;
            self.last_error = Some(result.describe_error());
        }
    }
}

/// 设备信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    /// 连接端点（如 192.168.1.10:502）
    pub endpoint: String,
    pub protocol: String,
    pub connected: bool,
    pub stats: ConnectionStats,
}

/// 设备网关接口
///
/// 所有操作返回 [`PlcResult`]，通讯失败作为值返回
#[async_trait]
pub trait IDeviceGateway: Send + Sync {
    async fn connect(&self) -> PlcResult<()>;

    async fn disconnect(&self) -> PlcResult<()>;

    /// 读取模拟量（工程量）
    async fn read_analog(&self, address: &str) -> PlcResult<f64>;

    /// 写入模拟量（工程量）
    async fn write_analog(&self, address: &str, value: f64) -> PlcResult<()>;

    async fn read_digital(&self, address: &str) -> PlcResult<bool>;

    async fn write_digital(&self, address: &str, value: bool) -> PlcResult<()>;

    async fn is_connected(&self) -> bool;

    async fn get_device_info(&self) -> PlcResult<DeviceInfo>;
}

/// 瞬时故障重试策略：有限次数、固定间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayRetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for GatewayRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

impl GatewayRetryPolicy {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &PlcConnectionConfig) -> Self {
        Self::new(config.retry_count, Duration::from_millis(config.retry_interval_ms))
    }
}

/// 带重试的网关装饰器
///
/// 只对超时、链路复位这类瞬时故障重试，协议错误和连接被拒绝直接返回
pub struct RetryingGateway {
    inner: Arc<dyn IDeviceGateway>,
    policy: GatewayRetryPolicy,
    name: String,
    retried: std::sync::atomic::AtomicU64,
}

impl RetryingGateway {
    pub fn new(name: impl Into<String>, inner: Arc<dyn IDeviceGateway>, policy: GatewayRetryPolicy) -> Self {
        Self {
            inner,
            policy,
            name: name.into(),
            retried: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> GatewayRetryPolicy {
        self.policy
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> PlcResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PlcResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = op().await;
            if result.is_ok() {
                return result;
            }
            if !result.is_transient_failure() || attempt >= self.policy.max_attempts {
                crate::log_communication_failure!(
                    "[{}] {} 失败（第 {} 次尝试）: {}",
                    self.name,
                    operation,
                    attempt,
                    result.describe_error()
                );
                return result;
            }
            log::warn!(
                "[{}] {} 瞬时故障，{}ms 后重试 ({}/{}): {}",
                self.name,
                operation,
                self.policy.retry_delay.as_millis(),
                attempt,
                self.policy.max_attempts,
                result.describe_error()
            );
            self.retried.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tokio::time::sleep(self.policy.retry_delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl IDeviceGateway for RetryingGateway {
    async fn connect(&self) -> PlcResult<()> {
        self.with_retry("连接", || self.inner.connect()).await
    }

    async fn disconnect(&self) -> PlcResult<()> {
        self.inner.disconnect().await
    }

    async fn read_analog(&self, address: &str) -> PlcResult<f64> {
        let operation = format!("读取模拟量 {}", address);
        self.with_retry(&operation, || self.inner.read_analog(address)).await
    }

    async fn write_analog(&self, address: &str, value: f64) -> PlcResult<()> {
        let operation = format!("写入模拟量 {} = {}", address, value);
        self.with_retry(&operation, || self.inner.write_analog(address, value)).await
    }

    async fn read_digital(&self, address: &str) -> PlcResult<bool> {
        let operation = format!("读取数字量 {}", address);
        self.with_retry(&operation, || self.inner.read_digital(address)).await
    }

    async fn write_digital(&self, address: &str, value: bool) -> PlcResult<()> {
        let operation = format!("写入数字量 {} = {}", address, value);
        self.with_retry(&operation, || self.inner.write_digital(address, value)).await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    async fn get_device_info(&self) -> PlcResult<DeviceInfo> {
        let retried = self.retried.load(std::sync::atomic::Ordering::Relaxed);
        self.inner.get_device_info().await.map(|mut info| {
            info.stats.retried_operations += retried;
            info
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::infrastructure::plc::mock_gateway::{FaultInjection, MockTestBench};
    use crate::services::infrastructure::plc::plc_result::GatewayErrorKind;

    fn fast_policy(max_attempts: u32) -> GatewayRetryPolicy {
        GatewayRetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let bench = MockTestBench::new();
        let target = bench.target_gateway();
        target.connect().await;
        bench.set_target_analog("40001", 42.0);
        bench.inject_target_fault(FaultInjection::new(GatewayErrorKind::Timeout, 2));

        let gateway = RetryingGateway::new("被测PLC", target, fast_policy(3));
        let result = gateway.read_analog("40001").await;

        assert!(result.is_ok(), "两次超时后第三次应该成功");
        assert_eq!(result.data, Some(42.0));
        let info = gateway.get_device_info().await;
        assert_eq!(info.data.map(|i| i.stats.retried_operations), Some(2));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let bench = MockTestBench::new();
        let target = bench.target_gateway();
        target.connect().await;
        bench.inject_target_fault(FaultInjection::new(GatewayErrorKind::LinkReset, 5));

        let gateway = RetryingGateway::new("被测PLC", target, fast_policy(3));
        let result = gateway.read_analog("40001").await;

        assert!(result.is_err(), "超过重试预算后应该返回最终失败");
        assert_eq!(result.error_kind(), Some(GatewayErrorKind::LinkReset));
        assert_eq!(bench.remaining_target_faults(), 2, "只应该消耗3次尝试");
    }

    #[tokio::test]
    async fn test_protocol_errors_are_not_retried() {
        let bench = MockTestBench::new();
        let target = bench.target_gateway();
        target.connect().await;
        bench.inject_target_fault(FaultInjection::new(GatewayErrorKind::Protocol, 3));

        let gateway = RetryingGateway::new("被测PLC", target, fast_policy(3));
        let result = gateway.write_analog("40001", 1.0).await;

        assert_eq!(result.error_kind(), Some(GatewayErrorKind::Protocol));
        assert_eq!(bench.remaining_target_faults(), 2);
    }
}
