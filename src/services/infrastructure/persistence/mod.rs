/// 数据持久化相关模块

/// 批次标签租约
pub mod batch_lease;

/// 通道测试记录存储
pub mod test_record_store;

pub use batch_lease::{BatchLease, BatchLeaseRegistry};
pub use test_record_store::{ITestRecordStore, SqliteTestRecordStore};
