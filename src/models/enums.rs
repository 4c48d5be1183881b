//! # 模型枚举类型模块
//!
//! ## 业务作用
//! 本模块定义了通道测试编排引擎中使用的枚举类型：
//! - **模块类型**: 8 种通道类型（AI/AO/DI/DO 及其无源变体）与互补关系
//! - **测试状态**: 通道整体状态、子测试项状态、批次阶段
//! - **报警等级**: 低低/低/高/高高四级报警
//! - **字节序**: 处理不同PLC厂商的浮点数字节序差异
//!
//! ## 设计原则
//! - **类型安全**: 使用强类型枚举避免魔法数字和字符串
//! - **序列化支持**: 所有枚举都支持JSON序列化
//! - **字符串转换**: 持久化层通过 Display / FromStr 双向转换

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// 模块类型枚举
///
/// **业务含义**: `*None` 为无源变体，分配时有源/无源必须严格一致
/// **排序**: 派生的 `Ord` 按声明顺序比较，分配器据此对候选通道排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModuleType {
    /// 模拟量输入
    AI,
    /// 模拟量输出
    AO,
    /// 数字量输入
    DI,
    /// 数字量输出
    DO,
    /// 模拟量输入（无源）
    AINone,
    /// 模拟量输出（无源）
    AONone,
    /// 数字量输入（无源）
    DINone,
    /// 数字量输出（无源）
    DONone,
}

impl ModuleType {
    pub const ALL: [ModuleType; 8] = [
        ModuleType::AI,
        ModuleType::AO,
        ModuleType::DI,
        ModuleType::DO,
        ModuleType::AINone,
        ModuleType::AONone,
        ModuleType::DINone,
        ModuleType::DONone,
    ];

    pub fn is_analog(&self) -> bool {
        matches!(
            self,
            ModuleType::AI | ModuleType::AO | ModuleType::AINone | ModuleType::AONone
        )
    }

    pub fn is_digital(&self) -> bool {
        !self.is_analog()
    }

    /// 是否为有源通道
    pub fn is_powered(&self) -> bool {
        matches!(
            self,
            ModuleType::AI | ModuleType::AO | ModuleType::DI | ModuleType::DO
        )
    }

    /// 是否为输入类通道（被测侧读取信号）
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            ModuleType::AI | ModuleType::DI | ModuleType::AINone | ModuleType::DINone
        )
    }

    /// 互补的测试侧通道类型
    ///
    /// **匹配规则**:
    /// - AI ↔ AO：被测AI需要测试侧AO提供信号
    /// - AO ↔ AI：被测AO输出的信号由测试侧AI采集
    /// - DI ↔ DO、DO ↔ DI 同理
    /// - 有源/无源变体保持不变
    pub fn complementary(&self) -> ModuleType {
        match self {
            ModuleType::AI => ModuleType::AO,
            ModuleType::AO => ModuleType::AI,
            ModuleType::DI => ModuleType::DO,
            ModuleType::DO => ModuleType::DI,
            ModuleType::AINone => ModuleType::AONone,
            ModuleType::AONone => ModuleType::AINone,
            ModuleType::DINone => ModuleType::DONone,
            ModuleType::DONone => ModuleType::DINone,
        }
    }
}

impl Default for ModuleType {
    fn default() -> Self {
        Self::AI
    }
}

impl Display for ModuleType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleType::AI => "AI",
            ModuleType::AO => "AO",
            ModuleType::DI => "DI",
            ModuleType::DO => "DO",
            ModuleType::AINone => "AINone",
            ModuleType::AONone => "AONone",
            ModuleType::DINone => "DINone",
            ModuleType::DONone => "DONone",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ModuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AI" => Ok(ModuleType::AI),
            "AO" => Ok(ModuleType::AO),
            "DI" => Ok(ModuleType::DI),
            "DO" => Ok(ModuleType::DO),
            "AINone" => Ok(ModuleType::AINone),
            "AONone" => Ok(ModuleType::AONone),
            "DINone" => Ok(ModuleType::DINone),
            "DONone" => Ok(ModuleType::DONone),
            _ => Err(format!("Invalid ModuleType: {}", s)),
        }
    }
}

/// 通道测试状态枚举
///
/// **状态流转**: NotTested → Waiting → Testing → {Passed, Failed, Skipped}
/// 同一测试轮次内只能向前推进，回到 NotTested 必须经过显式重测
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelTestStatus {
    /// 未测试
    NotTested,
    /// 已排队等待测试
    Waiting,
    /// 测试中
    Testing,
    /// 测试通过
    Passed,
    /// 测试失败
    Failed,
    /// 跳过（取消或操作员跳过）
    Skipped,
    /// 不适用
    NotApplicable,
}

impl ChannelTestStatus {
    /// 终态：测试轮次内不会再变化
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelTestStatus::Passed
                | ChannelTestStatus::Failed
                | ChannelTestStatus::Skipped
                | ChannelTestStatus::NotApplicable
        )
    }

    /// 是否计入"已测试"
    pub fn is_tested(&self) -> bool {
        matches!(self, ChannelTestStatus::Passed | ChannelTestStatus::Failed)
    }

    /// 单调状态转换检查（不含显式重测）
    pub fn can_transition_to(&self, next: ChannelTestStatus) -> bool {
        use ChannelTestStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (NotTested, Waiting | Testing | Failed | Skipped | NotApplicable) => true,
            (Waiting, Testing | Failed | Skipped) => true,
            (Testing, Passed | Failed | Skipped) => true,
            _ => false,
        }
    }

    /// 持久化使用的整型结果码
    pub fn code(&self) -> i32 {
        match self {
            ChannelTestStatus::NotTested => 0,
            ChannelTestStatus::Waiting => 1,
            ChannelTestStatus::Testing => 2,
            ChannelTestStatus::Passed => 3,
            ChannelTestStatus::Failed => 4,
            ChannelTestStatus::Skipped => 5,
            ChannelTestStatus::NotApplicable => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ChannelTestStatus::NotTested),
            1 => Some(ChannelTestStatus::Waiting),
            2 => Some(ChannelTestStatus::Testing),
            3 => Some(ChannelTestStatus::Passed),
            4 => Some(ChannelTestStatus::Failed),
            5 => Some(ChannelTestStatus::Skipped),
            6 => Some(ChannelTestStatus::NotApplicable),
            _ => None,
        }
    }
}

impl Default for ChannelTestStatus {
    fn default() -> Self {
        Self::NotTested
    }
}

impl Display for ChannelTestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelTestStatus::NotTested => "NotTested",
            ChannelTestStatus::Waiting => "Waiting",
            ChannelTestStatus::Testing => "Testing",
            ChannelTestStatus::Passed => "Passed",
            ChannelTestStatus::Failed => "Failed",
            ChannelTestStatus::Skipped => "Skipped",
            ChannelTestStatus::NotApplicable => "NotApplicable",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ChannelTestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotTested" => Ok(ChannelTestStatus::NotTested),
            "Waiting" => Ok(ChannelTestStatus::Waiting),
            "Testing" => Ok(ChannelTestStatus::Testing),
            "Passed" => Ok(ChannelTestStatus::Passed),
            "Failed" => Ok(ChannelTestStatus::Failed),
            "Skipped" => Ok(ChannelTestStatus::Skipped),
            "NotApplicable" => Ok(ChannelTestStatus::NotApplicable),
            _ => Err(format!("Invalid ChannelTestStatus: {}", s)),
        }
    }
}

/// 子测试状态枚举
/// 表示单个子测试项（硬点、报警、显示值核对）的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubTestStatus {
    NotTested,
    Testing,
    Passed,
    Failed,
    Skipped,
    NotApplicable,
}

impl SubTestStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SubTestStatus::Passed
                | SubTestStatus::Failed
                | SubTestStatus::Skipped
                | SubTestStatus::NotApplicable
        )
    }
}

impl Default for SubTestStatus {
    fn default() -> Self {
        Self::NotTested
    }
}

impl Display for SubTestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubTestStatus::NotTested => "NotTested",
            SubTestStatus::Testing => "Testing",
            SubTestStatus::Passed => "Passed",
            SubTestStatus::Failed => "Failed",
            SubTestStatus::Skipped => "Skipped",
            SubTestStatus::NotApplicable => "NotApplicable",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SubTestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotTested" => Ok(SubTestStatus::NotTested),
            "Testing" => Ok(SubTestStatus::Testing),
            "Passed" => Ok(SubTestStatus::Passed),
            "Failed" => Ok(SubTestStatus::Failed),
            "Skipped" => Ok(SubTestStatus::Skipped),
            "NotApplicable" => Ok(SubTestStatus::NotApplicable),
            _ => Err(format!("Invalid SubTestStatus: {}", s)),
        }
    }
}

/// 批次阶段
///
/// `Created → Allocating → AutomatedTesting → ManualTesting → Aggregating → Finalized`，
/// 任意非终态都可以进入 `Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPhase {
    Created,
    Allocating,
    AutomatedTesting,
    ManualTesting,
    Aggregating,
    Finalized,
    Cancelled,
}

impl BatchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchPhase::Finalized | BatchPhase::Cancelled)
    }

    pub fn can_transition_to(&self, next: BatchPhase) -> bool {
        use BatchPhase::*;
        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Created, Allocating)
                | (Allocating, AutomatedTesting)
                | (AutomatedTesting, ManualTesting)
                | (ManualTesting, Aggregating)
                | (Aggregating, Finalized)
        )
    }
}

impl Default for BatchPhase {
    fn default() -> Self {
        Self::Created
    }
}

impl Display for BatchPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchPhase::Created => "Created",
            BatchPhase::Allocating => "Allocating",
            BatchPhase::AutomatedTesting => "AutomatedTesting",
            BatchPhase::ManualTesting => "ManualTesting",
            BatchPhase::Aggregating => "Aggregating",
            BatchPhase::Finalized => "Finalized",
            BatchPhase::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// 报警等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlarmLevel {
    /// 低低报
    LowLow,
    /// 低报
    Low,
    /// 高报
    High,
    /// 高高报
    HighHigh,
}

impl AlarmLevel {
    pub const ALL: [AlarmLevel; 4] = [
        AlarmLevel::LowLow,
        AlarmLevel::Low,
        AlarmLevel::High,
        AlarmLevel::HighHigh,
    ];

    /// 低报类需要把信号压到设定值以下触发
    pub fn is_low_side(&self) -> bool {
        matches!(self, AlarmLevel::LowLow | AlarmLevel::Low)
    }
}

impl Display for AlarmLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlarmLevel::LowLow => "LL",
            AlarmLevel::Low => "L",
            AlarmLevel::High => "H",
            AlarmLevel::HighHigh => "HH",
        };
        write!(f, "{}", s)
    }
}

/// 字节序枚举
///
/// 用于32位浮点数在两个16位寄存器中的排列方式
///
/// **厂商差异**:
/// - 西门子PLC通常使用ABCD或BADC
/// - 施耐德PLC通常使用CDAB
/// - 三菱PLC通常使用DCBA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// 大端序 (AB CD)，浮点数1.0存储为 [3F, 80, 00, 00]
    ABCD,
    /// 低字在前 (CD AB)，浮点数1.0存储为 [00, 00, 3F, 80]
    CDAB,
    /// 高字在前、字内字节交换 (BA DC)，浮点数1.0存储为 [80, 3F, 00, 00]
    BADC,
    /// 小端序 (DC BA)，浮点数1.0存储为 [00, 00, 80, 3F]
    DCBA,
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::CDAB
    }
}

impl Display for ByteOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ByteOrder::ABCD => "ABCD",
            ByteOrder::CDAB => "CDAB",
            ByteOrder::BADC => "BADC",
            ByteOrder::DCBA => "DCBA",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ABCD" => Ok(ByteOrder::ABCD),
            "CDAB" => Ok(ByteOrder::CDAB),
            "BADC" => Ok(ByteOrder::BADC),
            "DCBA" => Ok(ByteOrder::DCBA),
            _ => Err(format!("不支持的字节序格式: {}，支持的格式: ABCD, CDAB, BADC, DCBA", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complementary_keeps_power_variant() {
        for module_type in ModuleType::ALL {
            let pair = module_type.complementary();
            assert_eq!(pair.is_powered(), module_type.is_powered());
            assert_eq!(pair.is_analog(), module_type.is_analog());
            assert_ne!(pair.is_input(), module_type.is_input());
            assert_eq!(pair.complementary(), module_type);
        }
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        use ChannelTestStatus::*;
        assert!(NotTested.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Testing));
        assert!(Testing.can_transition_to(Passed));
        assert!(!Passed.can_transition_to(Waiting));
        assert!(!Failed.can_transition_to(Testing));
        assert!(!Testing.can_transition_to(NotTested));
    }

    #[test]
    fn test_status_code_roundtrip() {
        for status in [
            ChannelTestStatus::NotTested,
            ChannelTestStatus::Waiting,
            ChannelTestStatus::Testing,
            ChannelTestStatus::Passed,
            ChannelTestStatus::Failed,
            ChannelTestStatus::Skipped,
            ChannelTestStatus::NotApplicable,
        ] {
            assert_eq!(ChannelTestStatus::from_code(status.code()), Some(status));
            assert_eq!(status.to_string().parse::<ChannelTestStatus>(), Ok(status));
        }
        assert_eq!(ChannelTestStatus::from_code(42), None);
    }

    #[test]
    fn test_batch_phase_cancel_only_from_non_terminal() {
        assert!(BatchPhase::ManualTesting.can_transition_to(BatchPhase::Cancelled));
        assert!(!BatchPhase::Finalized.can_transition_to(BatchPhase::Cancelled));
        assert!(!BatchPhase::Created.can_transition_to(BatchPhase::ManualTesting));
    }

    #[test]
    fn test_byte_order_parse_is_case_insensitive() {
        assert_eq!("cdab".parse::<ByteOrder>(), Ok(ByteOrder::CDAB));
        assert!("ABDC".parse::<ByteOrder>().is_err());
    }
}
