//! Modbus 地址解析与 32 位浮点编解码

use crate::models::ByteOrder;
use crate::utils::error::{AppError, AppResult};

/// Modbus 数据区
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterArea {
    /// 0x 线圈
    Coil,
    /// 1x 离散输入
    DiscreteInput,
    /// 3x 输入寄存器
    InputRegister,
    /// 4x 保持寄存器
    HoldingRegister,
}

impl RegisterArea {
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterArea::Coil | RegisterArea::DiscreteInput)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterArea::Coil | RegisterArea::HoldingRegister)
    }
}

/// 已解析的 Modbus 地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusAddress {
    pub area: RegisterArea,
    /// 协议偏移量（0 基）
    pub offset: u16,
}

impl ModbusAddress {
    /// 解析五位（或更长）Modbus 地址
    ///
    /// 首位数字决定数据区：0 线圈、1 离散输入、3 输入寄存器、4 保持寄存器。
    /// 不足五位的地址视为省略了首位 0，按线圈处理。
    /// `zero_based` 为 false 时，地址中的序号从 1 开始计数。
    pub fn parse(address: &str, zero_based: bool) -> AppResult<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AppError::validation_error("地址不能为空"));
        }
        if !address.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::validation_error(format!("地址格式无效: {}", address)));
        }

        let (area, number) = if address.len() < 5 {
            (RegisterArea::Coil, address)
        } else {
            let area = match &address[..1] {
                "0" => RegisterArea::Coil,
                "1" => RegisterArea::DiscreteInput,
                "3" => RegisterArea::InputRegister,
                "4" => RegisterArea::HoldingRegister,
                other => {
                    return Err(AppError::validation_error(format!(
                        "不支持的地址类型前缀: '{}' in '{}'",
                        other, address
                    )))
                }
            };
            (area, &address[1..])
        };

        let number = number
            .parse::<u16>()
            .map_err(|_| AppError::validation_error(format!("无效的地址偏移量: {}", address)))?;
        let offset = if zero_based {
            number
        } else {
            number
                .checked_sub(1)
                .ok_or_else(|| AppError::validation_error(format!("1 基地址的序号不能为 0: {}", address)))?
        };

        Ok(Self { area, offset })
    }

    /// 检查数据区能否承载该访问：模拟量需要寄存器，数字量需要位
    pub fn check_access(&self, analog: bool, write: bool) -> AppResult<()> {
        if analog == self.area.is_bit() {
            let kind = if analog { "模拟量" } else { "数字量" };
            return Err(AppError::protocol_error(format!("{}访问不能使用 {:?} 数据区", kind, self.area)));
        }
        if write && !self.area.is_writable() {
            return Err(AppError::protocol_error(format!("{:?} 数据区只读", self.area)));
        }
        Ok(())
    }
}

/// 两个寄存器 → f32
pub fn decode_f32(registers: [u16; 2], order: ByteOrder) -> f32 {
    let [r1hi, r1lo] = registers[0].to_be_bytes();
    let [r2hi, r2lo] = registers[1].to_be_bytes();
    let bytes = match order {
        ByteOrder::ABCD => [r1hi, r1lo, r2hi, r2lo],
        ByteOrder::CDAB => [r2hi, r2lo, r1hi, r1lo],
        ByteOrder::BADC => [r1lo, r1hi, r2lo, r2hi],
        ByteOrder::DCBA => [r2lo, r2hi, r1lo, r1hi],
    };
    f32::from_be_bytes(bytes)
}

/// f32 → 两个寄存器
pub fn encode_f32(value: f32, order: ByteOrder) -> [u16; 2] {
    let [a, b, c, d] = value.to_be_bytes();
    let (r1, r2) = match order {
        ByteOrder::ABCD => ([a, b], [c, d]),
        ByteOrder::CDAB => ([c, d], [a, b]),
        ByteOrder::BADC => ([b, a], [d, c]),
        ByteOrder::DCBA => ([d, c], [b, a]),
    };
    [u16::from_be_bytes(r1), u16::from_be_bytes(r2)]
}
