//! # Migration 模块
//!
//! 迁移编排：预检 → 备份 → 按注册顺序串行执行阶段 → 失败时回滚 → 写报告。
//!
//! ## 设计原则
//!
//! 1. **串行阶段**：任意时刻只有一个阶段在修改远端存储，后一阶段依赖前一阶段的集合状态
//! 2. **静态注册表**：阶段与处理器在启动时解析，而不是调用时动态查找
//! 3. **显式上下文**：统计与告警通过 `RunContext` 传递，不使用全局可变累加器
//! 4. **类型化错误**：调用方据错误类型区分"记录并继续"与"中止并回滚"
//!
//! ## 组件
//!
//! - `phases`: 阶段定义与注册表
//! - `context`: 运行上下文、运行记录、阶段结果
//! - `batch`: 有界并发的分批执行器
//! - `executor`: 单阶段执行（计时 + 统一错误捕获）
//! - `preflight`: 预检（连通性 + 源语料计数）
//! - `coordinator`: 迁移协调器
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let registry = PhaseRegistry::builder()
//!     .handler(PhaseName::SchemaSetup, schema_handler)
//!     .handler(PhaseName::ContentMigration, content_handler)
//!     .build()?;
//! let coordinator = MigrationCoordinator::new(config, store, blobs, registry);
//! let report = coordinator.run(MigrationOptions::default()).await?;
//! ```

pub mod batch;
pub mod context;
pub mod coordinator;
pub mod executor;
pub mod phases;
pub mod preflight;

pub use batch::{run_in_batches, BatchOutcome};
pub use context::{
    AbortFlag, MigrationOptions, MigrationRun, PhaseResult, PhaseStatus, ProgressEvent,
    RunContext, RunStats, RunStatus,
};
pub use coordinator::MigrationCoordinator;
pub use executor::{PhaseExecution, PhaseExecutor};
pub use phases::{
    handler_fn, Phase, PhaseHandler, PhaseName, PhaseRegistry, PhaseRegistryBuilder,
    RegisteredPhase,
};
pub use preflight::{run_preflight, PreflightReport};

use crate::store::StoreError;

/// 迁移错误
///
/// 分类与处理策略：
/// - `Configuration` / `Connectivity`（备份前）：致命，发生在任何写操作之前，无需回滚
/// - `Integrity`：仅当回滚确实需要该集合时致命，否则作为告警记录
/// - `NotFoundInBackup`：对单条记录/单表回滚致命，不中止更大的选择性回滚
/// - `PartialFailure`：始终是告警，批次内其余项继续执行
/// - `PhaseFailed` / `NoBackupsFound`：升级为中止整次运行的致命错误
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Backup {backup_id} failed integrity check: {}", .problems.join("; "))]
    Integrity {
        backup_id: String,
        problems: Vec<String>,
    },

    #[error("Record {id} not found in backup for table {table}")]
    NotFoundInBackup { table: String, id: String },

    #[error("Partial failure: {failed} of {total} items failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("No backups found in {0}")]
    NoBackupsFound(String),

    #[error("Required phase {phase} failed after {attempts} attempt(s): {reason}")]
    PhaseFailed {
        phase: String,
        attempts: usize,
        reason: String,
    },

    #[error("Remote store error: {0}")]
    Store(StoreError),

    #[error("Phase handler error: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for MigrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unreachable(msg) => MigrationError::Connectivity(msg),
            other => MigrationError::Store(other),
        }
    }
}

impl MigrationError {
    /// 是否应中止整次运行
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MigrationError::NotFoundInBackup { .. } | MigrationError::PartialFailure { .. }
        )
    }

    /// 必需阶段失败时是否值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::Connectivity(_)
                | MigrationError::Store(_)
                | MigrationError::Handler(_)
                | MigrationError::Io(_)
                | MigrationError::PartialFailure { .. }
        )
    }

    /// 供 CLI 层使用的退出码（成功为 0）
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::Configuration(_) => 2,
            _ => 1,
        }
    }
}
