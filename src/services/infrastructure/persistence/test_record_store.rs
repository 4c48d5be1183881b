//! 测试记录存储
//!
//! 以 (批次标签, 被测通道地址) 为主键保存通道测试实例，
//! 每次保存在一个事务内完成，重复保存同一批次是幂等的。
//! 新建批次走单独的事务：检查标签不存在并插入全部记录，已存在时返回 `BatchConflict`。

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Schema, SqlErr, TransactionTrait,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::batch_lease::BatchLeaseRegistry;
use crate::models::entities::channel_mapping::{self, Entity as ChannelMapping};
use crate::models::{ChannelTestInstance, TestBatchInfo};
use crate::utils::error::{AppError, AppResult};

/// 测试记录存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ITestRecordStore: Send + Sync {
    /// 本存储上活动批次的租约登记表
    fn lease_registry(&self) -> BatchLeaseRegistry;

    /// 新建批次：在一个事务内确认标签不存在并插入全部记录，已存在时返回 `BatchConflict`
    async fn create_batch_records(&self, tag: &str, mappings: &[ChannelTestInstance]) -> AppResult<()>;

    /// 幂等地保存批次内全部通道记录（单事务）
    async fn save_test_records(&self, tag: &str, mappings: &[ChannelTestInstance]) -> AppResult<()>;

    /// 按顺序号恢复批次内的通道记录
    async fn restore_test_records(&self, tag: &str) -> AppResult<Vec<ChannelTestInstance>>;

    /// 由存储的记录聚合出全部批次摘要
    async fn get_all_batches(&self) -> AppResult<Vec<TestBatchInfo>>;

    /// 删除批次，返回删除的行数
    async fn delete_batch(&self, tag: &str) -> AppResult<u64>;

    /// 将残留的旧哨兵值改写为 NULL，返回受影响的行数
    async fn migrate_legacy_sentinels(&self) -> AppResult<u64>;
}

/// 基于 SeaORM + SQLite 的测试记录存储
pub struct SqliteTestRecordStore {
    db: DatabaseConnection,
    db_file_path: PathBuf,
    leases: BatchLeaseRegistry,
}

impl SqliteTestRecordStore {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn open(db_file_path: impl AsRef<Path>) -> AppResult<Self> {
        let db_file_path = db_file_path.as_ref().to_path_buf();

        if let Some(parent) = db_file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    AppError::io_error(format!("创建数据库目录失败: {:?}", parent), format!("{:?}", e.kind()))
                })?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_file_path.to_string_lossy());
        let db = Database::connect(&db_url)
            .await
            .map_err(|e| AppError::persistence_error(format!("连接数据库 {} 失败: {}", db_url, e)))?;

        Self::setup_schema(&db).await?;
        log::info!("测试记录存储已打开: {:?}", db_file_path);

        Ok(Self {
            db,
            db_file_path,
            leases: BatchLeaseRegistry::new(),
        })
    }

    async fn setup_schema(db: &DatabaseConnection) -> AppResult<()> {
        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        let stmt = schema
            .create_table_from_entity(ChannelMapping)
            .if_not_exists()
            .to_owned();
        db.execute(backend.build(&stmt))
            .await
            .map_err(|e| AppError::persistence_error(format!("创建 channel_mappings 表失败: {}", e)))?;
        Ok(())
    }

    pub fn db_file_path(&self) -> &Path {
        &self.db_file_path
    }

    /// 底层连接（供迁移工具与测试直接访问表）
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// 唯一约束冲突说明另一个会话抢先创建了同名批次
    fn create_error(tag: &str, err: DbErr) -> AppError {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(detail)) => {
                AppError::batch_conflict(tag, format!("批次记录已被其他会话创建: {}", detail))
            }
            _ => err.into(),
        }
    }
}

#[async_trait]
impl ITestRecordStore for SqliteTestRecordStore {
    fn lease_registry(&self) -> BatchLeaseRegistry {
        self.leases.clone()
    }

    async fn create_batch_records(&self, tag: &str, mappings: &[ChannelTestInstance]) -> AppResult<()> {
        let txn = self.db.begin().await?;

        let existing = ChannelMapping::find()
            .filter(channel_mapping::Column::TestTag.eq(tag))
            .count(&txn)
            .await?;
        if existing > 0 {
            txn.rollback().await?;
            return Err(AppError::batch_conflict(
                tag,
                format!("存储中已存在同名批次（{} 条记录），请使用恢复或先删除", existing),
            ));
        }

        for mapping in mappings {
            let mut active = channel_mapping::ActiveModel::from(mapping);
            active.test_tag = sea_orm::ActiveValue::Set(tag.to_string());
            active.insert(&txn).await.map_err(|e| Self::create_error(tag, e))?;
        }

        txn.commit().await.map_err(|e| Self::create_error(tag, e))?;
        log::debug!("批次 {} 已创建 {} 条通道记录", tag, mappings.len());
        Ok(())
    }

    async fn save_test_records(&self, tag: &str, mappings: &[ChannelTestInstance]) -> AppResult<()> {
        let txn = self.db.begin().await?;

        for mapping in mappings {
            let mut active = channel_mapping::ActiveModel::from(mapping);
            active.test_tag = sea_orm::ActiveValue::Set(tag.to_string());

            let key = (tag.to_string(), mapping.channel_address().to_string());
            let exists = ChannelMapping::find_by_id(key).one(&txn).await?.is_some();
            if exists {
                active.update(&txn).await?;
            } else {
                active.insert(&txn).await?;
            }
        }

        txn.commit().await?;
        log::debug!("批次 {} 已保存 {} 条通道记录", tag, mappings.len());
        Ok(())
    }

    async fn restore_test_records(&self, tag: &str) -> AppResult<Vec<ChannelTestInstance>> {
        let rows = ChannelMapping::find()
            .filter(channel_mapping::Column::TestTag.eq(tag))
            .order_by_asc(channel_mapping::Column::SequenceNo)
            .all(&self.db)
            .await?;

        rows.iter().map(ChannelTestInstance::try_from).collect()
    }

    async fn get_all_batches(&self) -> AppResult<Vec<TestBatchInfo>> {
        let rows = ChannelMapping::find()
            .order_by_asc(channel_mapping::Column::TestTag)
            .order_by_asc(channel_mapping::Column::SequenceNo)
            .all(&self.db)
            .await?;

        let mut grouped: BTreeMap<String, Vec<ChannelTestInstance>> = BTreeMap::new();
        for row in &rows {
            grouped
                .entry(row.test_tag.clone())
                .or_default()
                .push(ChannelTestInstance::try_from(row)?);
        }

        Ok(grouped
            .into_iter()
            .map(|(tag, instances)| TestBatchInfo::from_instances(tag, &instances))
            .collect())
    }

    async fn delete_batch(&self, tag: &str) -> AppResult<u64> {
        let txn = self.db.begin().await?;
        let result = ChannelMapping::delete_many()
            .filter(channel_mapping::Column::TestTag.eq(tag))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        log::info!("批次 {} 已删除，共 {} 条通道记录", tag, result.rows_affected);
        Ok(result.rows_affected)
    }

    async fn migrate_legacy_sentinels(&self) -> AppResult<u64> {
        let txn = self.db.begin().await?;
        let rows = ChannelMapping::find().all(&txn).await?;

        let mut migrated = 0u64;
        for row in rows.iter().filter(|row| row.contains_legacy_sentinel()) {
            let cleaned: channel_mapping::ActiveModel = row.without_legacy_sentinels().into();
            cleaned.reset_all().update(&txn).await?;
            migrated += 1;
        }

        txn.commit().await?;
        if migrated > 0 {
            log::info!("旧哨兵值迁移完成，共改写 {} 行", migrated);
        }
        Ok(migrated)
    }
}
