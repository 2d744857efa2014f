// Content Migrator library entry
// 迁移编排与回滚引擎：宿主（CLI / 服务）注册阶段处理器后调用 `MigrationCoordinator::run`。

pub mod audit;
pub mod backup;
pub mod collections;
pub mod config;
pub mod logging;
pub mod migration;
pub mod report;
pub mod rollback;
pub mod store;

pub use backup::{Backup, BackupError, BackupManager, BackupValidation};
pub use config::MigrationConfig;
pub use logging::{init_tracing, LogFormat};
pub use migration::{
    handler_fn, MigrationCoordinator, MigrationError, MigrationOptions, MigrationRun, PhaseHandler,
    PhaseName, PhaseRegistry, ProgressEvent, RunContext,
};
pub use report::{FailureReport, MigrationReport, ReportGenerator};
pub use rollback::{
    RollbackEngine, RollbackOptions, RollbackRequest, RollbackStats, RollbackType,
};
pub use store::{BlobStore, MemoryBlobStore, MemoryStore, Record, RemoteStore, StoreError};
