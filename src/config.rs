//! 迁移配置
//!
//! 加载顺序：`.env` → 环境变量（`MIGRATION_` 前缀，`__` 表示嵌套）→
//! 可选的 `config/migration.toml` → 直接环境变量兜底。

use std::path::PathBuf;
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

use crate::migration::MigrationError;

const CONFIG_FILE: &str = "config/migration";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// 远端存储地址
    pub store_url: Option<String>,
    /// 远端存储凭据
    pub store_key: Option<String>,
    /// 源内容目录（markdown）
    pub content_dir: PathBuf,
    /// 源媒体目录，不存在时跳过媒体计数
    pub media_dir: Option<PathBuf>,
    /// 备份根目录
    pub backup_dir: PathBuf,
    /// 报告目录
    pub reports_dir: PathBuf,
    /// 媒体对象所在的存储桶
    pub media_bucket: String,
    pub backup_enabled: bool,
    /// 保留的运行备份数量（0 表示不清理）
    pub backup_retention: usize,
    /// 必需阶段的最大尝试次数（含首次）
    pub max_phase_attempts: usize,
    pub retry_min_delay_ms: u64,
    /// 单次 insert_batch 的记录数上限
    pub insert_chunk_size: usize,
    /// 对象存储批量操作的并发数
    pub upload_concurrency: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            store_key: None,
            content_dir: PathBuf::from("content"),
            media_dir: Some(PathBuf::from("static")),
            backup_dir: PathBuf::from("backups"),
            reports_dir: PathBuf::from("reports"),
            media_bucket: "media".to_string(),
            backup_enabled: true,
            backup_retention: 5,
            max_phase_attempts: 3,
            retry_min_delay_ms: 500,
            insert_chunk_size: 100,
            upload_concurrency: 5,
        }
    }
}

impl MigrationConfig {
    pub fn from_env_and_file() -> Result<Self, MigrationError> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder().add_source(
            config::Environment::with_prefix("MIGRATION")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        if std::path::Path::new(&format!("{}.toml", CONFIG_FILE)).exists() {
            builder = builder.add_source(config::File::with_name(CONFIG_FILE));
        }
        let loaded = builder
            .build()
            .map_err(|e| MigrationError::Configuration(format!("加载配置失败: {}", e)))?;

        let mut cfg = Self::from_config(loaded)?;
        // direct env fallbacks
        if cfg.store_url.is_none() {
            cfg.store_url = std::env::var("STORE_URL").ok();
        }
        if cfg.store_key.is_none() {
            cfg.store_key = std::env::var("STORE_KEY").ok();
        }
        Ok(cfg)
    }

    fn from_config(loaded: config::Config) -> Result<Self, MigrationError> {
        loaded
            .try_deserialize::<MigrationConfig>()
            .map_err(|e| MigrationError::Configuration(format!("配置格式错误: {}", e)))
    }

    /// 在任何写操作之前校验配置
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut problems = Vec::new();

        if self.store_url.as_deref().map_or(true, |s| s.trim().is_empty()) {
            problems.push("store_url is not set");
        }
        if self.store_key.as_deref().map_or(true, |s| s.trim().is_empty()) {
            problems.push("store_key is not set");
        }
        if self.content_dir.as_os_str().is_empty() {
            problems.push("content_dir is empty");
        }
        if self.backup_enabled && self.backup_dir.as_os_str().is_empty() {
            problems.push("backup_dir is empty");
        }
        if self.reports_dir.as_os_str().is_empty() {
            problems.push("reports_dir is empty");
        }
        if self.insert_chunk_size == 0 {
            problems.push("insert_chunk_size must be positive");
        }
        if self.upload_concurrency == 0 {
            problems.push("upload_concurrency must be positive");
        }
        if self.max_phase_attempts == 0 {
            problems.push("max_phase_attempts must be positive");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::Configuration(problems.join("; ")))
        }
    }

    /// 必需阶段的重试退避策略
    pub fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry_min_delay_ms))
            .with_max_times(self.max_phase_attempts.saturating_sub(1))
    }
}
