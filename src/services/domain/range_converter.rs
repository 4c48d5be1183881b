//! 量程换算
//! 工程量与百分比之间的线性换算

use crate::models::EngineeringRange;
use crate::utils::error::{AppError, AppResult};

/// 量程换算器（无状态）
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeConverter;

impl RangeConverter {
    pub fn new() -> Self {
        Self
    }

    /// 百分比 → 工程量：`lower + (upper - lower) * pct / 100`
    pub fn percentage_to_real(&self, range: &EngineeringRange, percentage: f64) -> AppResult<f64> {
        Self::check(range)?;
        Ok(range.lower + range.span() * percentage / 100.0)
    }

    /// 工程量 → 百分比：`(real - lower) / (upper - lower) * 100`
    pub fn real_to_percentage(&self, range: &EngineeringRange, real: f64) -> AppResult<f64> {
        Self::check(range)?;
        Ok((real - range.lower) / range.span() * 100.0)
    }

    fn check(range: &EngineeringRange) -> AppResult<()> {
        if range.span() == 0.0 || !range.span().is_finite() {
            return Err(AppError::degenerate_range(range.lower, range.upper));
        }
        Ok(())
    }
}
