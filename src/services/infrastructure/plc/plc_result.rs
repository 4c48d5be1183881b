use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::utils::error::AppError;

/// 网关错误分类
///
/// 错误码约定：0 表示无错误，-1 表示未分类失败，其余为负数细分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayErrorKind {
    /// 未分类失败
    Unspecified,
    /// 无法建立连接
    Connection,
    /// 未连接时调用读写
    NotConnected,
    /// 超时
    Timeout,
    /// 链路被复位（连接被对端关闭、管道破裂等）
    LinkReset,
    /// 地址格式错误、类型不匹配或设备异常码
    Protocol,
}

impl GatewayErrorKind {
    pub fn code(&self) -> i32 {
        match self {
            GatewayErrorKind::Unspecified => -1,
            GatewayErrorKind::Connection => -2,
            GatewayErrorKind::NotConnected => -3,
            GatewayErrorKind::Timeout => -4,
            GatewayErrorKind::LinkReset => -5,
            GatewayErrorKind::Protocol => -6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(GatewayErrorKind::Unspecified),
            -2 => Some(GatewayErrorKind::Connection),
            -3 => Some(GatewayErrorKind::NotConnected),
            -4 => Some(GatewayErrorKind::Timeout),
            -5 => Some(GatewayErrorKind::LinkReset),
            -6 => Some(GatewayErrorKind::Protocol),
            _ => None,
        }
    }

    /// 瞬时故障，按重试策略重试
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayErrorKind::Timeout | GatewayErrorKind::LinkReset)
    }
}

impl Display for GatewayErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatewayErrorKind::Unspecified => "未分类失败",
            GatewayErrorKind::Connection => "连接失败",
            GatewayErrorKind::NotConnected => "未连接",
            GatewayErrorKind::Timeout => "超时",
            GatewayErrorKind::LinkReset => "链路复位",
            GatewayErrorKind::Protocol => "协议错误",
        };
        write!(f, "{}", s)
    }
}

/// PLC通信结果
///
/// 网关的所有操作都返回该值，通讯失败不会以 panic 或 `Err` 形式抛出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcResult<T> {
    /// 操作是否成功
    pub success: bool,
    /// 返回的数据
    pub data: Option<T>,
    /// 错误码（0 = 无错误，-1 = 未分类失败）
    pub error_code: i32,
    /// 错误信息（如果操作失败）
    pub error_message: Option<String>,
    /// 底层原因（如IO错误文本）
    pub cause: Option<String>,
}

impl<T> PlcResult<T> {
    /// 创建一个成功的结果
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_code: 0,
            error_message: None,
            cause: None,
        }
    }

    /// 创建一个失败的结果
    pub fn err(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_code: kind.code(),
            error_message: Some(message.into()),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.success
    }

    pub fn is_err(&self) -> bool {
        !self.success
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// 失败时的错误分类
    pub fn error_kind(&self) -> Option<GatewayErrorKind> {
        if self.success {
            None
        } else {
            Some(GatewayErrorKind::from_code(self.error_code).unwrap_or(GatewayErrorKind::Unspecified))
        }
    }

    pub fn is_transient_failure(&self) -> bool {
        self.error_kind().map_or(false, |kind| kind.is_transient())
    }

    /// 将结果映射到新类型
    pub fn map<U, F: FnOnce(T) -> U>(self, op: F) -> PlcResult<U> {
        PlcResult {
            success: self.success,
            data: self.data.map(op),
            error_code: self.error_code,
            error_message: self.error_message,
            cause: self.cause,
        }
    }

    /// 人类可读的错误描述
    pub fn describe_error(&self) -> String {
        let message = self.error_message.as_deref().unwrap_or("未知错误");
        match &self.cause {
            Some(cause) => format!("{} (原因: {})", message, cause),
            None => message.to_string(),
        }
    }

    /// 在需要 `?` 传播的边界上转换为应用错误
    pub fn into_app_result(self, operation: &str) -> Result<T, AppError> {
        if self.success {
            if let Some(data) = self.data {
                return Ok(data);
            }
        }
        let description = self.describe_error();
        Err(match self.error_kind() {
            Some(GatewayErrorKind::Timeout) => AppError::timeout_error(operation, description),
            Some(GatewayErrorKind::Protocol) => AppError::protocol_error(format!("{}: {}", operation, description)),
            _ => AppError::connection_error(format!("{}: {}", operation, description)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_contract() {
        let ok = PlcResult::ok(1.5_f64);
        assert_eq!(ok.error_code, 0);
        assert_eq!(ok.error_kind(), None);

        let failed: PlcResult<f64> = PlcResult::err(GatewayErrorKind::Unspecified, "boom");
        assert_eq!(failed.error_code, -1);
        assert!(!failed.is_transient_failure());

        let timeout: PlcResult<f64> = PlcResult::err(GatewayErrorKind::Timeout, "slow").with_cause("deadline");
        assert!(timeout.is_transient_failure());
        assert_eq!(timeout.describe_error(), "slow (原因: deadline)");
    }

    #[test]
    fn test_unknown_code_is_unspecified() {
        let mut result: PlcResult<bool> = PlcResult::err(GatewayErrorKind::Protocol, "bad");
        result.error_code = -99;
        assert_eq!(result.error_kind(), Some(GatewayErrorKind::Unspecified));
    }

    #[test]
    fn test_into_app_result_maps_timeout() {
        let result: PlcResult<f64> = PlcResult::err(GatewayErrorKind::Timeout, "no reply");
        match result.into_app_result("读取 40001") {
            Err(AppError::TimeoutError { operation, .. }) => assert_eq!(operation, "读取 40001"),
            other => panic!("意外的结果: {:?}", other),
        }
    }
}
