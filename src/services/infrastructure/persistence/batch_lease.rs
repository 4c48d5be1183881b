//! 批次标签租约
//!
//! 同一批次标签同一时刻只允许一个活动会话。租约登记表由存储持有，
//! 共享同一存储的所有编排引擎看到的是同一张表；租约释放时自动归还

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::utils::error::{AppError, AppResult};

/// 活动批次标签登记表，克隆后共享同一份数据
#[derive(Debug, Clone, Default)]
pub struct BatchLeaseRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl BatchLeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记标签；已被占用时返回 `BatchConflict`
    pub fn acquire(&self, tag: &str) -> AppResult<BatchLease> {
        let mut active = self.lock();
        if !active.insert(tag.to_string()) {
            return Err(AppError::batch_conflict(tag, "该批次已有活动会话"));
        }
        log::debug!("批次 {} 租约已登记", tag);
        Ok(BatchLease {
            tag: tag.to_string(),
            registry: self.clone(),
        })
    }

    pub fn is_leased(&self, tag: &str) -> bool {
        self.lock().contains(tag)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 批次标签租约，释放时自动归还
#[derive(Debug)]
pub struct BatchLease {
    tag: String,
    registry: BatchLeaseRegistry,
}

impl BatchLease {
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.tag);
        log::debug!("批次 {} 租约已归还", self.tag);
    }
}
