//! # Backup 模块
//!
//! 远端集合的时间点快照。
//!
//! ## 设计原则
//!
//! 1. **不可变**：备份写入后只读，回滚引擎从不修改它
//! 2. **可验证**：每个集合文件在清单中都有 SHA256 校验和
//! 3. **部分可用**：单个集合拉取失败只记告警，该集合在备份中缺席（而不是写占位文件）
//! 4. **可追溯**：回滚前的现场快照使用独立前缀，永远不会被选为"最新备份"
//!
//! ## 目录布局
//!
//! ```text
//! <backup_root>/
//!   migration_1718000000000/
//!     manifest.json
//!     hugo_posts_backup.json      # Record 的 JSON 数组
//!     hugo_tags_backup.json
//!     ...
//!   pre_rollback_1718000100000/
//!     ...
//! ```

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::migration::MigrationError;
use crate::store::{Record, RemoteStore};

/// 运行备份目录前缀
pub const BACKUP_DIR_PREFIX: &str = "migration_";

/// 回滚前现场快照目录前缀
pub const PRE_ROLLBACK_DIR_PREFIX: &str = "pre_rollback_";

/// 清单文件名
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// 备份清单版本
const MANIFEST_VERSION: &str = "1.0.0";

const BACKUP_FILE_SUFFIX: &str = "_backup.json";

/// 集合在备份目录中的文件名
pub fn backup_file_name(collection: &str) -> String {
    format!("{}{}", collection, BACKUP_FILE_SUFFIX)
}

/// 备份错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Backup directory error: {0}")]
    BackupDirectory(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("No backups found in {0}")]
    NoBackups(String),

    #[error("Backup {backup_id} failed integrity check: {}", .problems.join("; "))]
    Integrity {
        backup_id: String,
        problems: Vec<String>,
    },
}

impl From<BackupError> for MigrationError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Io(e) => MigrationError::Io(e),
            BackupError::Serialization(e) => MigrationError::Serialization(e),
            BackupError::NoBackups(root) => MigrationError::NoBackupsFound(root),
            BackupError::Integrity {
                backup_id,
                problems,
            } => MigrationError::Integrity {
                backup_id,
                problems,
            },
            BackupError::NotFound(id) => {
                MigrationError::Configuration(format!("backup not found: {}", id))
            }
            BackupError::Manifest(msg) | BackupError::BackupDirectory(msg) => {
                MigrationError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
            }
        }
    }
}

/// 备份类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// 迁移运行前的快照
    Run,
    /// 回滚前的现场快照
    PreRollback,
}

impl BackupKind {
    fn dir_prefix(&self) -> &'static str {
        match self {
            BackupKind::Run => BACKUP_DIR_PREFIX,
            BackupKind::PreRollback => PRE_ROLLBACK_DIR_PREFIX,
        }
    }
}

/// 清单中的集合条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCollectionEntry {
    pub name: String,
    /// 相对于备份目录的文件名
    pub file: String,
    pub record_count: usize,
    pub sha256: String,
}

/// 备份清单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: String,
    pub backup_id: String,
    /// RFC 3339
    pub created_at: String,
    pub kind: BackupKind,
    pub collections: Vec<BackupCollectionEntry>,
    /// 拉取失败、未受保护的集合
    #[serde(default)]
    pub skipped: Vec<String>,
}

impl BackupManifest {
    fn new(backup_id: &str, kind: BackupKind) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            backup_id: backup_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            kind,
            collections: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn entry(&self, collection: &str) -> Option<&BackupCollectionEntry> {
        self.collections.iter().find(|c| c.name == collection)
    }

    /// 保存清单（原子写入）
    pub async fn save_to_file(&self, path: &Path) -> Result<(), BackupError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| BackupError::Manifest(format!("序列化清单失败: {}", e)))?;
        write_atomic(path, &json).await
    }

    pub fn load_from_file(path: &Path) -> Result<Self, BackupError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| BackupError::Manifest(format!("解析清单失败: {}", e)))
    }
}

/// 磁盘上的一个备份
#[derive(Debug, Clone)]
pub struct Backup {
    /// 目录名（时间戳派生）
    pub id: String,
    pub location: PathBuf,
    /// 旧版本备份可能没有清单
    pub manifest: Option<BackupManifest>,
}

impl Backup {
    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.location.join(backup_file_name(collection))
    }

    /// 备份中是否存在该集合的文件
    pub fn contains(&self, collection: &str) -> bool {
        self.collection_path(collection).is_file()
    }

    /// 清单中登记的集合（无清单时返回空）
    pub fn collections(&self) -> Vec<&str> {
        self.manifest
            .as_ref()
            .map(|m| m.collections.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default()
    }
}

/// 快照结果
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub backup: Backup,
    /// 每个拉取失败的集合一条
    pub warnings: Vec<String>,
    /// 未受保护（备份中缺席）的集合
    pub unprotected: Vec<String>,
}

/// 备份问题类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupProblemKind {
    Missing,
    Corrupt,
    ChecksumMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupProblem {
    pub collection: String,
    pub kind: BackupProblemKind,
    pub detail: String,
}

impl std::fmt::Display for BackupProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.collection, self.detail)
    }
}

/// 备份校验结果（一次性列出所有问题）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupValidation {
    pub backup_id: String,
    pub valid: bool,
    pub problems: Vec<BackupProblem>,
}

impl BackupValidation {
    pub fn problem_for(&self, collection: &str) -> Option<&BackupProblem> {
        self.problems.iter().find(|p| p.collection == collection)
    }

    /// 缺失的集合
    pub fn missing(&self) -> Vec<&str> {
        self.problems
            .iter()
            .filter(|p| p.kind == BackupProblemKind::Missing)
            .map(|p| p.collection.as_str())
            .collect()
    }

    pub fn into_result(self) -> Result<(), BackupError> {
        if self.valid {
            Ok(())
        } else {
            Err(BackupError::Integrity {
                backup_id: self.backup_id,
                problems: self.problems.iter().map(|p| p.to_string()).collect(),
            })
        }
    }
}

/// 备份管理器
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_root: PathBuf,
}

impl BackupManager {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.backup_root
    }

    /// 运行前快照
    ///
    /// 逐个集合 `list()` 并原样写入（空集合写 `[]`）。单个集合拉取失败只记告警，
    /// 目录创建或本地写入失败才返回错误。
    pub async fn snapshot(
        &self,
        store: &dyn RemoteStore,
        collections: &[&str],
    ) -> Result<SnapshotOutcome, BackupError> {
        self.snapshot_into(BackupKind::Run, store, collections).await
    }

    /// 回滚前的现场快照，写入独立的 `pre_rollback_*` 目录
    pub async fn snapshot_pre_rollback(
        &self,
        store: &dyn RemoteStore,
        collections: &[&str],
    ) -> Result<SnapshotOutcome, BackupError> {
        self.snapshot_into(BackupKind::PreRollback, store, collections)
            .await
    }

    async fn snapshot_into(
        &self,
        kind: BackupKind,
        store: &dyn RemoteStore,
        collections: &[&str],
    ) -> Result<SnapshotOutcome, BackupError> {
        let start = std::time::Instant::now();
        let (backup_id, location) = self.create_unique_backup_subdir(kind).await?;
        info!(
            "[BackupManager] 开始快照 {} ({} 个集合, kind={:?})",
            backup_id,
            collections.len(),
            kind
        );

        let (manifest, warnings) =
            match Self::write_snapshot(&backup_id, kind, &location, store, collections).await {
                Ok(written) => written,
                Err(e) => {
                    // 半成品目录没有清单，不能留下来被当作最新备份
                    error!("[BackupManager] 快照 {} 写入失败，清理目录: {}", backup_id, e);
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&location).await {
                        warn!("[BackupManager] 清理失败的快照目录出错 {}: {}", backup_id, cleanup);
                    }
                    return Err(e);
                }
            };

        info!(
            "[BackupManager] 快照完成 {}: {} 个集合, {} 个未受保护, 耗时 {}ms",
            backup_id,
            manifest.collections.len(),
            manifest.skipped.len(),
            start.elapsed().as_millis()
        );

        let unprotected = manifest.skipped.clone();
        Ok(SnapshotOutcome {
            backup: Backup {
                id: backup_id,
                location,
                manifest: Some(manifest),
            },
            warnings,
            unprotected,
        })
    }

    /// 写入各集合文件与清单
    async fn write_snapshot(
        backup_id: &str,
        kind: BackupKind,
        location: &Path,
        store: &dyn RemoteStore,
        collections: &[&str],
    ) -> Result<(BackupManifest, Vec<String>), BackupError> {
        let mut manifest = BackupManifest::new(backup_id, kind);
        let mut warnings = Vec::new();

        for &name in collections {
            let records = match store.list(name).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("[BackupManager] 集合 {} 拉取失败，不在备份中: {}", name, e);
                    warnings.push(format!("Failed to back up collection {}: {}", name, e));
                    manifest.skipped.push(name.to_string());
                    continue;
                }
            };

            let bytes = serde_json::to_vec_pretty(&records)?;
            let file = backup_file_name(name);
            write_atomic(&location.join(&file), &bytes).await?;

            debug!("[BackupManager] {} -> {} 条记录", name, records.len());
            manifest.collections.push(BackupCollectionEntry {
                name: name.to_string(),
                file,
                record_count: records.len(),
                sha256: sha256_hex(&bytes),
            });
        }

        manifest
            .save_to_file(&location.join(MANIFEST_FILENAME))
            .await?;

        Ok((manifest, warnings))
    }

    /// 创建一个新的、不会与现有备份冲突的备份子目录
    ///
    /// 目录名即备份 ID；使用 `create_dir` 而不是 `create_dir_all`，冲突时时间戳递增重试，
    /// 保证同一根目录下的 ID 单调递增。
    async fn create_unique_backup_subdir(
        &self,
        kind: BackupKind,
    ) -> Result<(String, PathBuf), BackupError> {
        tokio::fs::create_dir_all(&self.backup_root).await?;

        let base = chrono::Utc::now().timestamp_millis();
        for offset in 0..10 {
            let backup_id = format!("{}{}", kind.dir_prefix(), base + offset);
            let backup_subdir = self.backup_root.join(&backup_id);

            match tokio::fs::create_dir(&backup_subdir).await {
                Ok(()) => return Ok((backup_id, backup_subdir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(BackupError::Io(e)),
            }
        }

        Err(BackupError::BackupDirectory(
            "无法生成唯一备份目录（多次尝试均冲突）".to_string(),
        ))
    }

    /// 读取备份中的一个集合
    ///
    /// 文件不存在返回 `Ok(None)`；解析失败或校验和不匹配返回 `Integrity`。
    pub async fn read_collection(
        &self,
        backup: &Backup,
        collection: &str,
    ) -> Result<Option<Vec<Record>>, BackupError> {
        match load_collection(backup, collection).await {
            Ok(records) => Ok(Some(records)),
            Err(problem) if problem.kind == BackupProblemKind::Missing => Ok(None),
            Err(problem) => Err(BackupError::Integrity {
                backup_id: backup.id.clone(),
                problems: vec![problem.to_string()],
            }),
        }
    }

    /// 检查备份中的每个期望集合，收集全部问题
    pub async fn inspect(&self, backup: &Backup, expected: &[&str]) -> BackupValidation {
        let mut problems = Vec::new();
        for &name in expected {
            if let Err(problem) = load_collection(backup, name).await {
                problems.push(problem);
            }
        }

        if !problems.is_empty() {
            warn!(
                "[BackupManager] 备份 {} 校验发现 {} 个问题",
                backup.id,
                problems.len()
            );
        }

        BackupValidation {
            backup_id: backup.id.clone(),
            valid: problems.is_empty(),
            problems,
        }
    }

    /// 校验备份，任何缺失/损坏都以单个 `Integrity` 错误列出
    pub async fn validate(&self, backup: &Backup, expected: &[&str]) -> Result<(), BackupError> {
        self.inspect(backup, expected).await.into_result()
    }

    /// 列出所有运行备份（最新的在前）
    ///
    /// 回滚前快照不在其中。
    pub fn list_backups(&self) -> Result<Vec<Backup>, BackupError> {
        self.list_with_prefix(BACKUP_DIR_PREFIX)
    }

    /// 列出所有回滚前快照（最新的在前）
    pub fn list_pre_rollback_snapshots(&self) -> Result<Vec<Backup>, BackupError> {
        self.list_with_prefix(PRE_ROLLBACK_DIR_PREFIX)
    }

    fn list_with_prefix(&self, prefix: &str) -> Result<Vec<Backup>, BackupError> {
        let mut backups = Vec::new();

        if !self.backup_root.exists() {
            return Ok(backups);
        }

        for entry in fs::read_dir(&self.backup_root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if !dir_name.starts_with(prefix) {
                continue;
            }
            backups.push(load_backup(dir_name, path));
        }

        backups.sort_by(|a, b| compare_backup_ids(&b.id, &a.id));
        Ok(backups)
    }

    /// 最新的运行备份
    pub fn latest_backup(&self) -> Result<Backup, BackupError> {
        self.list_backups()?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::NoBackups(self.backup_root.display().to_string()))
    }

    /// 按 ID 打开备份
    pub fn open(&self, backup_id: &str) -> Result<Backup, BackupError> {
        validate_backup_id(backup_id)?;
        let location = self.backup_root.join(backup_id);
        if !location.is_dir() {
            return Err(BackupError::NotFound(backup_id.to_string()));
        }
        Ok(load_backup(backup_id.to_string(), location))
    }

    /// 删除指定的备份
    pub fn delete_backup(&self, backup_id: &str) -> Result<(), BackupError> {
        validate_backup_id(backup_id)?;
        let location = self.backup_root.join(backup_id);
        if !location.exists() {
            return Err(BackupError::NotFound(backup_id.to_string()));
        }
        fs::remove_dir_all(&location)?;
        info!("[BackupManager] 已删除备份: {}", backup_id);
        Ok(())
    }

    /// 清理旧的运行备份，保留最新的 `keep_count` 个
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<Vec<String>, BackupError> {
        let backups = self.list_backups()?;
        let mut deleted = Vec::new();

        if backups.len() <= keep_count {
            return Ok(deleted);
        }

        for backup in backups.iter().skip(keep_count) {
            match self.delete_backup(&backup.id) {
                Ok(()) => deleted.push(backup.id.clone()),
                Err(e) => {
                    warn!("[BackupManager] 删除旧备份失败 {}: {}", backup.id, e);
                }
            }
        }

        info!("[BackupManager] 清理旧备份完成，删除 {} 个", deleted.len());
        Ok(deleted)
    }
}

/// 备份 ID 排序：两者的时间戳后缀都能解析为数字时按数值比较，否则按字典序
pub fn compare_backup_ids(a: &str, b: &str) -> Ordering {
    match (id_timestamp(a), id_timestamp(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn id_timestamp(id: &str) -> Option<u128> {
    id.rsplit('_').next()?.parse().ok()
}

fn validate_backup_id(backup_id: &str) -> Result<(), BackupError> {
    let allowed = !backup_id.is_empty()
        && backup_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if allowed {
        Ok(())
    } else {
        Err(BackupError::NotFound(format!("非法备份 ID: {}", backup_id)))
    }
}

fn load_backup(id: String, location: PathBuf) -> Backup {
    let manifest_path = location.join(MANIFEST_FILENAME);
    let manifest = if manifest_path.exists() {
        match BackupManifest::load_from_file(&manifest_path) {
            Ok(manifest) => {
                if manifest.backup_id != id {
                    warn!(
                        "[BackupManager] 清单 backup_id 与目录名不一致，以目录名为准: manifest={}, dir={}",
                        manifest.backup_id, id
                    );
                }
                Some(manifest)
            }
            Err(e) => {
                warn!("[BackupManager] 无法加载备份清单 {:?}: {}", manifest_path, e);
                None
            }
        }
    } else {
        None
    };

    Backup {
        id,
        location,
        manifest,
    }
}

/// 读取并校验一个集合文件
async fn load_collection(backup: &Backup, collection: &str) -> Result<Vec<Record>, BackupProblem> {
    let problem = |kind, detail: String| BackupProblem {
        collection: collection.to_string(),
        kind,
        detail,
    };

    let path = backup.collection_path(collection);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(problem(
                BackupProblemKind::Missing,
                "backup file is missing".to_string(),
            ))
        }
        Err(e) => return Err(problem(BackupProblemKind::Corrupt, format!("unreadable: {}", e))),
    };

    if let Some(entry) = backup.manifest.as_ref().and_then(|m| m.entry(collection)) {
        let actual = sha256_hex(&bytes);
        if actual != entry.sha256 {
            return Err(problem(
                BackupProblemKind::ChecksumMismatch,
                format!("checksum mismatch (expected {}, got {})", entry.sha256, actual),
            ));
        }
    }

    serde_json::from_slice::<Vec<Record>>(&bytes).map_err(|e| {
        problem(
            BackupProblemKind::Corrupt,
            format!("not a JSON array of records: {}", e),
        )
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 原子写入：临时文件 → 同步到磁盘 → 重命名
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackupError> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(BackupError::Io(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(id: &str) -> Record {
        Record::from_value(json!({"id": id, "title": format!("post {}", id)})).unwrap()
    }

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_collection("hugo_posts", vec![record("a"), record("b")])
            .with_collection("hugo_tags", Vec::new())
    }

    #[tokio::test]
    async fn test_failed_snapshot_leaves_no_partial_directory() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path());
        let complete = manager
            .snapshot(&store(), &["hugo_posts"])
            .await
            .unwrap()
            .backup;

        // 集合名含路径分隔符：备份文件的父目录不存在，本地写入失败
        let store = store().with_collection("nested/posts", vec![record("x")]);
        let result = manager.snapshot(&store, &["hugo_posts", "nested/posts"]).await;

        assert_matches!(result, Err(BackupError::Io(_)));
        let backups = manager.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(manager.latest_backup().unwrap().id, complete.id);
    }

    #[tokio::test]
    async fn test_snapshot_writes_every_collection() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path());

        let outcome = manager
            .snapshot(&store(), &["hugo_posts", "hugo_tags"])
            .await
            .unwrap();

        assert!(outcome.backup.id.starts_with(BACKUP_DIR_PREFIX));
        assert!(outcome.warnings.is_empty());

        let posts = manager
            .read_collection(&outcome.backup, "hugo_posts")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(posts, vec![record("a"), record("b")]);

        // 空集合写成 []
        let raw = std::fs::read_to_string(outcome.backup.collection_path("hugo_tags")).unwrap();
        assert_eq!(raw.trim(), "[]");

        let manifest = outcome.backup.manifest.unwrap();
        assert_eq!(manifest.entry("hugo_posts").unwrap().record_count, 2);
    }

    #[tokio::test]
    async fn test_failed_collection_is_absent_not_placeholder() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path());
        let store = store();
        store.fail_on(StoreOp::List, "hugo_tags");

        let outcome = manager
            .snapshot(&store, &["hugo_posts", "hugo_tags"])
            .await
            .unwrap();

        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.unprotected, vec!["hugo_tags".to_string()]);
        assert!(!outcome.backup.contains("hugo_tags"));
        assert!(manager
            .read_collection(&outcome.backup, "hugo_tags")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_validation_lists_all_problems() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path());
        let outcome = manager
            .snapshot(&store(), &["hugo_posts", "hugo_tags"])
            .await
            .unwrap();

        std::fs::write(outcome.backup.collection_path("hugo_posts"), "{not json").unwrap();

        let validation = manager
            .inspect(&outcome.backup, &["hugo_posts", "hugo_tags", "hugo_categories"])
            .await;
        assert!(!validation.valid);
        assert_eq!(validation.problems.len(), 2);
        assert_eq!(validation.missing(), vec!["hugo_categories"]);
        assert_eq!(
            validation.problem_for("hugo_posts").unwrap().kind,
            BackupProblemKind::ChecksumMismatch
        );

        let err = manager
            .validate(&outcome.backup, &["hugo_posts", "hugo_categories"])
            .await
            .unwrap_err();
        assert_matches!(err, BackupError::Integrity { problems, .. } if problems.len() == 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_without_manifest_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().join("migration_1000");
        std::fs::create_dir_all(&location).unwrap();
        std::fs::write(location.join(backup_file_name("hugo_posts")), "[1, 2]").unwrap();

        let manager = BackupManager::new(dir.path());
        let backup = manager.open("migration_1000").unwrap();
        assert!(backup.manifest.is_none());

        let err = manager.read_collection(&backup, "hugo_posts").await.unwrap_err();
        assert_matches!(err, BackupError::Integrity { .. });
    }

    #[test]
    fn test_latest_backup_uses_timestamp_order() {
        let dir = TempDir::new().unwrap();
        for name in ["migration_1000", "migration_2000", "migration_999", "pre_rollback_5000"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }

        let manager = BackupManager::new(dir.path());
        assert_eq!(manager.latest_backup().unwrap().id, "migration_2000");

        let ids: Vec<String> = manager.list_backups().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["migration_2000", "migration_1000", "migration_999"]);
        assert_eq!(manager.list_pre_rollback_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn test_no_backups_is_distinct_error() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path().join("does-not-exist"));
        assert_matches!(manager.latest_backup(), Err(BackupError::NoBackups(_)));
    }

    #[test]
    fn test_compare_backup_ids_falls_back_to_lexicographic() {
        assert_eq!(compare_backup_ids("migration_999", "migration_1000"), Ordering::Less);
        assert_eq!(compare_backup_ids("migration_abc", "migration_abd"), Ordering::Less);
    }

    #[test]
    fn test_cleanup_keeps_newest() {
        let dir = TempDir::new().unwrap();
        for ts in [1000, 2000, 3000, 4000] {
            std::fs::create_dir_all(dir.path().join(format!("migration_{}", ts))).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("pre_rollback_500")).unwrap();

        let manager = BackupManager::new(dir.path());
        let deleted = manager.cleanup_old_backups(2).unwrap();

        assert_eq!(deleted, vec!["migration_2000", "migration_1000"]);
        assert_eq!(manager.list_backups().unwrap().len(), 2);
        assert!(dir.path().join("pre_rollback_500").exists());
    }

    #[test]
    fn test_open_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path());
        assert_matches!(manager.open("../etc"), Err(BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pre_rollback_snapshot_is_never_latest() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path());
        let run = manager.snapshot(&store(), &["hugo_posts"]).await.unwrap();
        let pre = manager
            .snapshot_pre_rollback(&store(), &["hugo_posts"])
            .await
            .unwrap();

        assert!(pre.backup.id.starts_with(PRE_ROLLBACK_DIR_PREFIX));
        assert_eq!(manager.latest_backup().unwrap().id, run.backup.id);
    }
}
