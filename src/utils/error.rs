use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 应用程序统一错误类型
/// 覆盖通道测试编排引擎中设备通讯、分配、校验和持久化各层的错误
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum AppError {
    /// 输入/输出错误
    #[error("IO错误: {message} (Kind: {kind})")]
    IoError { message: String, kind: String },

    /// 无法建立或维持设备链路
    ///
    /// **业务含义**: 测试PLC或被测PLC离线、网络不通、端口拒绝连接
    /// **处理策略**: 记录到受影响的通道上，不中断整个批次
    #[error("连接错误: {message}")]
    ConnectionError { message: String },

    /// 在预算时间内设备无响应（按网关重试策略重试后仍失败）
    #[error("超时错误: {operation} - {message}")]
    TimeoutError { operation: String, message: String },

    /// 地址格式错误、类型不匹配或设备返回异常码
    #[error("协议错误: {message}")]
    ProtocolError { message: String },

    /// 没有兼容且空闲的测试通道
    #[error("分配错误: {message}")]
    AllocationError { message: String },

    /// 导入的通道定义违反约束（例如量程上下限颠倒）
    #[error("验证错误: {message}")]
    ValidationError { message: String },

    /// 数据持久化相关错误
    ///
    /// 保存边界上重试一次，仍失败则对当前批次是致命的
    #[error("持久化错误: {message}")]
    PersistenceError { message: String },

    /// 量程上下限相等，无法进行百分比换算
    #[error("量程退化: 下限 {lower} 与上限 {upper} 相等")]
    DegenerateRange { lower: f64, upper: f64 },

    /// 状态转换错误
    #[error("状态转换错误: 从 {from_state} 到 {to_state} - {message}")]
    StateTransitionError {
        from_state: String,
        to_state: String,
        message: String,
    },

    /// 同一批次标签已存在活动批次
    #[error("批次冲突: {tag} - {message}")]
    BatchConflict { tag: String, message: String },

    /// 资源未找到错误
    #[error("资源未找到: {resource_type} - {message}")]
    NotFoundError { resource_type: String, message: String },

    /// 配置相关错误
    #[error("配置错误: {message}")]
    ConfigurationError { message: String },

    /// 数据序列化/反序列化错误
    #[error("序列化错误: {message}")]
    SerializationError { message: String },
}

impl AppError {
    pub fn io_error(message: impl Into<String>, kind_str: impl Into<String>) -> Self {
        AppError::IoError {
            message: message.into(),
            kind: kind_str.into(),
        }
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        AppError::ConnectionError {
            message: message.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::TimeoutError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        AppError::ProtocolError {
            message: message.into(),
        }
    }

    pub fn allocation_error(message: impl Into<String>) -> Self {
        AppError::AllocationError {
            message: message.into(),
        }
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        AppError::ValidationError {
            message: message.into(),
        }
    }

    pub fn persistence_error(message: impl Into<String>) -> Self {
        AppError::PersistenceError {
            message: message.into(),
        }
    }

    pub fn degenerate_range(lower: f64, upper: f64) -> Self {
        AppError::DegenerateRange { lower, upper }
    }

    pub fn state_transition_error(
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AppError::StateTransitionError {
            from_state: from_state.into(),
            to_state: to_state.into(),
            message: message.into(),
        }
    }

    pub fn batch_conflict(tag: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::BatchConflict {
            tag: tag.into(),
            message: message.into(),
        }
    }

    pub fn not_found_error(resource_type: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::NotFoundError {
            resource_type: resource_type.into(),
            message: message.into(),
        }
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        AppError::ConfigurationError {
            message: message.into(),
        }
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        AppError::SerializationError {
            message: message.into(),
        }
    }

    /// 获取错误代码，用于前端错误分类处理
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::IoError { .. } => "IO_ERROR",
            AppError::ConnectionError { .. } => "CONNECTION_ERROR",
            AppError::TimeoutError { .. } => "TIMEOUT_ERROR",
            AppError::ProtocolError { .. } => "PROTOCOL_ERROR",
            AppError::AllocationError { .. } => "ALLOCATION_ERROR",
            AppError::ValidationError { .. } => "VALIDATION_ERROR",
            AppError::PersistenceError { .. } => "PERSISTENCE_ERROR",
            AppError::DegenerateRange { .. } => "DEGENERATE_RANGE",
            AppError::StateTransitionError { .. } => "STATE_TRANSITION_ERROR",
            AppError::BatchConflict { .. } => "BATCH_CONFLICT",
            AppError::NotFoundError { .. } => "NOT_FOUND_ERROR",
            AppError::ConfigurationError { .. } => "CONFIGURATION_ERROR",
            AppError::SerializationError { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// 是否为致命错误（需要终止当前批次）
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(self, AppError::PersistenceError { .. })
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError {
            message: err.to_string(),
            kind: format!("{:?}", err.kind()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::PersistenceError {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigurationError {
            message: err.to_string(),
        }
    }
}

impl From<tokio_modbus::Error> for AppError {
    fn from(err: tokio_modbus::Error) -> Self {
        AppError::ProtocolError {
            message: format!("Modbus错误: {}", err),
        }
    }
}

/// 应用程序统一Result类型
pub type AppResult<T> = Result<T, AppError>;
