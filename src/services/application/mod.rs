/// 应用层服务模块
///
/// 应用层负责协调领域服务和基础设施服务，实现完整的批次测试流程

/// 批次编排引擎
pub mod batch_orchestrator;

pub use batch_orchestrator::{BatchEvent, BatchOrchestrator, BatchSession};
