//! # Rollback 模块
//!
//! 从备份恢复远端集合，支持多种粒度。
//!
//! ## 设计原则
//!
//! 1. **先校验后写入**：请求涉及的所有备份表在第一次写操作之前全部加载并校验，
//!    任何一个损坏都以 `Integrity` 中止，远端零修改
//! 2. **无备份不动数据**：备份中缺席的集合跳过并记告警，绝不清空无法恢复的在线数据
//! 3. **逆依赖顺序**：全量回滚从正向管线最后写入的集合开始
//! 4. **可重入**：同一备份重复回滚得到相同的最终状态
//! 5. **现场快照**：破坏性恢复前把当前状态另存到 `pre_rollback_*`
//!
//! ## 粒度
//!
//! | 类型 | 范围 |
//! |------|------|
//! | full | 所有被追踪集合（逆依赖顺序），媒体表附带对象清理 |
//! | content | 内容类集合 |
//! | media | 媒体迁移记录 + 对象清理 |
//! | url | URL 映射 |
//! | selective | 调用方显式给出的表 / 记录 / 文件，不做隐式扩展 |

pub mod media;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use media::{collect_object_keys, collect_object_urls, object_key_from_url};

use crate::backup::{Backup, BackupError, BackupManager, BackupValidation};
use crate::collections::{self, CollectionKind};
use crate::config::MigrationConfig;
use crate::migration::{run_in_batches, AbortFlag, MigrationError};
use crate::store::{BlobStore, Record, RemoteStore, StoreError};

/// 默认单次插入的记录数
pub const DEFAULT_INSERT_CHUNK_SIZE: usize = 100;

/// 默认对象删除并发数
pub const DEFAULT_DELETE_CONCURRENCY: usize = 5;

/// 回滚粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackType {
    Full,
    Content,
    Media,
    Url,
    Selective,
}

impl RollbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackType::Full => "full",
            RollbackType::Content => "content",
            RollbackType::Media => "media",
            RollbackType::Url => "url",
            RollbackType::Selective => "selective",
        }
    }
}

impl std::fmt::Display for RollbackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条记录引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub table: String,
    pub id: String,
}

/// 回滚请求（每次调用构造，不持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    #[serde(rename = "type")]
    pub kind: RollbackType,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub records: Vec<RecordRef>,
    /// 对象 URL 或存储键
    #[serde(default)]
    pub files: Vec<String>,
}

impl RollbackRequest {
    fn of(kind: RollbackType) -> Self {
        Self {
            kind,
            tables: Vec::new(),
            records: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn full() -> Self {
        Self::of(RollbackType::Full)
    }

    pub fn content() -> Self {
        Self::of(RollbackType::Content)
    }

    pub fn media() -> Self {
        Self::of(RollbackType::Media)
    }

    pub fn url() -> Self {
        Self::of(RollbackType::Url)
    }

    pub fn selective() -> Self {
        Self::of(RollbackType::Selective)
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    pub fn with_record(mut self, table: impl Into<String>, id: impl Into<String>) -> Self {
        self.records.push(RecordRef {
            table: table.into(),
            id: id.into(),
        });
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.files.push(file.into());
        self
    }
}

/// 回滚选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOptions {
    /// 恢复前对将被修改的集合做现场快照
    pub pre_rollback_snapshot: bool,
    /// 只校验与规划，不修改远端
    pub dry_run: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            pre_rollback_snapshot: true,
            dry_run: false,
        }
    }
}

/// 回滚统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackStats {
    #[serde(rename = "type")]
    pub kind: RollbackType,
    pub backup_id: String,
    pub tables_rolled_back: Vec<String>,
    pub records_restored: usize,
    pub files_deleted: usize,
    /// 备份中缺席而跳过的集合
    pub skipped_tables: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    #[serde(default)]
    pub pre_rollback_backup: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub dry_run: bool,
}

impl RollbackStats {
    fn new(kind: RollbackType, backup_id: &str, dry_run: bool) -> Self {
        Self {
            kind,
            backup_id: backup_id.to_string(),
            tables_rolled_back: Vec::new(),
            records_restored: 0,
            files_deleted: 0,
            skipped_tables: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            pre_rollback_backup: None,
            duration_ms: 0,
            dry_run,
        }
    }

    /// 没有任何表/记录级错误
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// 回滚能力检查结果
#[derive(Debug, Clone)]
pub struct RollbackCapability {
    pub backup: Backup,
    pub validation: BackupValidation,
}

/// 规划中的一张表
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableStep {
    name: String,
    /// 恢复后清理不在备份中的媒体对象
    with_objects: bool,
}

#[derive(Debug, Default)]
struct RollbackPlan {
    tables: Vec<TableStep>,
    records: Vec<RecordRef>,
    files: Vec<String>,
}

impl RollbackPlan {
    fn from_request(request: &RollbackRequest) -> Self {
        let step = |name: &str, kind: CollectionKind| TableStep {
            name: name.to_string(),
            with_objects: kind == CollectionKind::Media,
        };

        match request.kind {
            RollbackType::Full => Self {
                tables: collections::reverse_dependency_order()
                    .into_iter()
                    .map(|c| step(c.name, c.kind))
                    .collect(),
                ..Self::default()
            },
            RollbackType::Content => Self {
                tables: collections::content_collections()
                    .into_iter()
                    .map(|c| step(c.name, c.kind))
                    .collect(),
                ..Self::default()
            },
            RollbackType::Media => {
                let media = collections::media_collection();
                Self {
                    tables: vec![step(media.name, media.kind)],
                    ..Self::default()
                }
            }
            RollbackType::Url => {
                let urls = collections::url_mapping_collection();
                Self {
                    tables: vec![step(urls.name, urls.kind)],
                    ..Self::default()
                }
            }
            RollbackType::Selective => Self {
                tables: selective_table_order(&request.tables)
                    .into_iter()
                    .map(|name| TableStep {
                        name,
                        with_objects: false,
                    })
                    .collect(),
                records: request.records.clone(),
                files: request.files.clone(),
            },
        }
    }

    /// 需要从备份加载的表（去重）
    fn needed_tables(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.tables
            .iter()
            .map(|t| t.name.clone())
            .chain(self.records.iter().map(|r| r.table.clone()))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }
}

/// 选择性回滚的表顺序：被追踪集合按逆依赖顺序，其余保持调用方顺序排在最后
fn selective_table_order(tables: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for table in tables {
        if !unique.contains(table) {
            unique.push(table.clone());
        }
    }

    let rank = |name: &str| {
        collections::reverse_dependency_order()
            .iter()
            .position(|c| c.name == name)
            .unwrap_or(usize::MAX)
    };
    unique.sort_by_key(|name| rank(name));
    unique
}

/// 回滚引擎
pub struct RollbackEngine {
    store: Arc<dyn RemoteStore>,
    blobs: Arc<dyn BlobStore>,
    backups: BackupManager,
    chunk_size: usize,
    bucket: String,
    concurrency: usize,
}

impl RollbackEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        blobs: Arc<dyn BlobStore>,
        backups: BackupManager,
    ) -> Self {
        Self {
            store,
            blobs,
            backups,
            chunk_size: DEFAULT_INSERT_CHUNK_SIZE,
            bucket: "media".to_string(),
            concurrency: DEFAULT_DELETE_CONCURRENCY,
        }
    }

    pub fn from_config(
        config: &MigrationConfig,
        store: Arc<dyn RemoteStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self::new(store, blobs, BackupManager::new(&config.backup_dir))
            .with_chunk_size(config.insert_chunk_size)
            .with_bucket(config.media_bucket.clone())
            .with_concurrency(config.upload_concurrency)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// 确认存在可用于回滚的备份
    ///
    /// 没有任何运行备份时返回 `NoBackupsFound`，不触碰远端。
    pub async fn validate_rollback_capability(&self) -> Result<RollbackCapability, MigrationError> {
        let backup = self.backups.latest_backup()?;
        let validation = self
            .backups
            .inspect(&backup, &collections::tracked_names())
            .await;

        if validation.valid {
            info!("[RollbackEngine] 回滚能力就绪，最新备份: {}", backup.id);
        } else {
            warn!(
                "[RollbackEngine] 最新备份 {} 存在 {} 个问题，相关集合无法恢复",
                backup.id,
                validation.problems.len()
            );
        }

        Ok(RollbackCapability { backup, validation })
    }

    /// 使用最新备份执行回滚
    pub async fn rollback_latest(
        &self,
        request: &RollbackRequest,
        options: RollbackOptions,
    ) -> Result<RollbackStats, MigrationError> {
        let capability = self.validate_rollback_capability().await?;
        self.perform_rollback(request, &capability.backup, options)
            .await
    }

    /// 执行回滚
    ///
    /// 返回 `Err` 只发生在第一次写操作之前（备份损坏、现场快照失败）；
    /// 之后的表级/记录级失败记录在 `RollbackStats::errors` 中，其余部分继续执行。
    pub async fn perform_rollback(
        &self,
        request: &RollbackRequest,
        backup: &Backup,
        options: RollbackOptions,
    ) -> Result<RollbackStats, MigrationError> {
        let start = Instant::now();
        let plan = RollbackPlan::from_request(request);
        let mut stats = RollbackStats::new(request.kind, &backup.id, options.dry_run);

        info!(
            "[RollbackEngine] 开始 {} 回滚: backup={}, tables={}, records={}, files={}",
            request.kind,
            backup.id,
            plan.tables.len(),
            plan.records.len(),
            plan.files.len()
        );

        // 1. 预加载并校验
        let loaded = self.preload(&plan, backup, &mut stats).await?;

        if options.dry_run {
            info!(
                "[RollbackEngine] dry-run：{} 张表可恢复，{} 张表将跳过",
                loaded.len(),
                stats.skipped_tables.len()
            );
            stats.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(stats);
        }

        // 2. 现场快照
        if options.pre_rollback_snapshot {
            let touched: Vec<&str> = loaded.keys().map(String::as_str).collect();
            if !touched.is_empty() {
                let outcome = self
                    .backups
                    .snapshot_pre_rollback(self.store.as_ref(), &touched)
                    .await?;
                stats.warnings.extend(outcome.warnings);
                stats.pre_rollback_backup = Some(outcome.backup.id);
            }
        }

        // 3. 表级恢复
        for step in &plan.tables {
            let Some(records) = loaded.get(&step.name) else {
                continue;
            };
            let result = if step.with_objects {
                self.restore_media_table(&step.name, records, &mut stats)
                    .await
            } else {
                self.restore_table(&step.name, records).await
            };
            match result {
                Ok(count) => {
                    stats.records_restored += count;
                    stats.tables_rolled_back.push(step.name.clone());
                }
                Err(e) => {
                    error!("[RollbackEngine] 表 {} 回滚失败: {}", step.name, e);
                    stats.errors.push(format!("{}: {}", step.name, e));
                }
            }
        }

        // 4. 记录级恢复
        for record in &plan.records {
            let result = match loaded.get(&record.table) {
                Some(records) => self.restore_record(&record.table, &record.id, records).await,
                None => Err(MigrationError::NotFoundInBackup {
                    table: record.table.clone(),
                    id: record.id.clone(),
                }),
            };
            match result {
                Ok(()) => stats.records_restored += 1,
                Err(e) => {
                    warn!("[RollbackEngine] 记录 {}/{} 回滚失败: {}", record.table, record.id, e);
                    stats.errors.push(e.to_string());
                }
            }
        }

        // 5. 文件级删除
        if !plan.files.is_empty() {
            self.delete_objects(plan.files.clone(), &mut stats).await;
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "[RollbackEngine] {} 回滚完成: {} 张表, {} 条记录, {} 个对象, {} 个错误, 耗时 {}ms",
            request.kind,
            stats.tables_rolled_back.len(),
            stats.records_restored,
            stats.files_deleted,
            stats.errors.len(),
            stats.duration_ms
        );
        Ok(stats)
    }

    /// 加载计划需要的全部备份表
    ///
    /// 缺席的表记入 `skipped_tables` 并告警；任何损坏的表都在写操作之前返回 `Integrity`。
    async fn preload(
        &self,
        plan: &RollbackPlan,
        backup: &Backup,
        stats: &mut RollbackStats,
    ) -> Result<BTreeMap<String, Vec<Record>>, MigrationError> {
        let mut loaded = BTreeMap::new();
        let mut problems = Vec::new();

        for name in plan.needed_tables() {
            match self.backups.read_collection(backup, &name).await {
                Ok(Some(records)) => {
                    debug!("[RollbackEngine] 已加载 {} ({} 条)", name, records.len());
                    loaded.insert(name, records);
                }
                Ok(None) => {
                    warn!("[RollbackEngine] 备份 {} 中没有 {}，跳过", backup.id, name);
                    stats
                        .warnings
                        .push(format!("No backup found for {}; collection left untouched", name));
                    stats.skipped_tables.push(name);
                }
                Err(BackupError::Integrity { problems: p, .. }) => problems.extend(p),
                Err(e) => return Err(e.into()),
            }
        }

        if problems.is_empty() {
            Ok(loaded)
        } else {
            Err(MigrationError::Integrity {
                backup_id: backup.id.clone(),
                problems,
            })
        }
    }

    /// 单表回滚
    ///
    /// 返回恢复的记录数；备份中没有该表时返回 `Ok(None)`，在线数据不受影响。
    pub async fn rollback_table(
        &self,
        table: &str,
        backup: &Backup,
    ) -> Result<Option<usize>, MigrationError> {
        match self.backups.read_collection(backup, table).await? {
            Some(records) => Ok(Some(self.restore_table(table, &records).await?)),
            None => {
                warn!("[RollbackEngine] 备份 {} 中没有 {}，跳过", backup.id, table);
                Ok(None)
            }
        }
    }

    /// 单条记录回滚：只删除并重新插入该 id，表中其他记录不受影响
    pub async fn rollback_record(
        &self,
        table: &str,
        id: &str,
        backup: &Backup,
    ) -> Result<(), MigrationError> {
        let records = self
            .backups
            .read_collection(backup, table)
            .await?
            .ok_or_else(|| MigrationError::NotFoundInBackup {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        self.restore_record(table, id, &records).await
    }

    /// 清空后按固定块大小顺序插入
    async fn restore_table(&self, table: &str, records: &[Record]) -> Result<usize, MigrationError> {
        self.store.delete_all(table).await?;

        for (index, chunk) in records.chunks(self.chunk_size).enumerate() {
            self.store.insert_batch(table, chunk).await?;
            debug!(
                "[RollbackEngine] {} 第 {} 块已插入 ({} 条)",
                table,
                index + 1,
                chunk.len()
            );
        }

        info!("[RollbackEngine] {} 已恢复 {} 条记录", table, records.len());
        Ok(records.len())
    }

    async fn restore_record(
        &self,
        table: &str,
        id: &str,
        records: &[Record],
    ) -> Result<(), MigrationError> {
        let record = records
            .iter()
            .find(|r| r.id().as_deref() == Some(id))
            .ok_or_else(|| MigrationError::NotFoundInBackup {
                table: table.to_string(),
                id: id.to_string(),
            })?;

        self.store.delete_by_id(table, id).await?;
        self.store.insert_one(table, record).await?;
        info!("[RollbackEngine] 记录 {}/{} 已恢复", table, id);
        Ok(())
    }

    /// 媒体表回滚：恢复迁移记录，再删除备份之后上传的对象
    async fn restore_media_table(
        &self,
        table: &str,
        records: &[Record],
        stats: &mut RollbackStats,
    ) -> Result<usize, MigrationError> {
        let live = match self.store.list(table).await {
            Ok(live) => live,
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(e) => {
                stats.warnings.push(format!(
                    "Could not list {} before rollback; uploaded objects were not removed: {}",
                    table, e
                ));
                Vec::new()
            }
        };

        // 按存储键比较：备份记录仍引用的对象不能删除
        let kept = collect_object_keys(&self.bucket, records);
        let stale: Vec<String> = collect_object_keys(&self.bucket, &live)
            .into_iter()
            .filter(|key| !kept.contains(key))
            .collect();

        let count = self.restore_table(table, records).await?;

        if !stale.is_empty() {
            info!("[RollbackEngine] 删除 {} 个备份之后上传的对象", stale.len());
            self.delete_keys(stale, stats).await;
        }
        Ok(count)
    }

    /// 按调用方给出的 URL 或存储键删除对象
    async fn delete_objects(&self, files: Vec<String>, stats: &mut RollbackStats) {
        let mut keys = Vec::with_capacity(files.len());
        for file in files {
            match object_key_from_url(&self.bucket, &file) {
                Some(key) => keys.push(key),
                None => stats
                    .warnings
                    .push(format!("Cannot derive storage key from {}", file)),
            }
        }
        self.delete_keys(keys, stats).await;
    }

    /// 分批删除对象，单个失败只记告警
    async fn delete_keys(&self, keys: Vec<String>, stats: &mut RollbackStats) {
        let total = keys.len();

        let outcome = run_in_batches(keys, self.concurrency, &AbortFlag::new(), |key: String| {
            let blobs = self.blobs.clone();
            let bucket = self.bucket.clone();
            async move {
                let result = blobs.remove_object(&bucket, &key).await;
                (key, result)
            }
        })
        .await;

        let mut failed = 0usize;
        for (key, result) in outcome.results {
            match result {
                Ok(()) => stats.files_deleted += 1,
                Err(e) => {
                    failed += 1;
                    warn!("[RollbackEngine] 删除对象 {} 失败: {}", key, e);
                    stats
                        .warnings
                        .push(format!("Failed to delete object {}: {}", key, e));
                }
            }
        }

        if failed > 0 {
            stats
                .warnings
                .push(MigrationError::PartialFailure { failed, total }.to_string());
        }
    }
}
