//! # Migration Coordinator (迁移协调器)
//!
//! 驱动一次完整的迁移运行。
//!
//! ## 职责
//!
//! 1. 预检：连通性、源语料、待处理项计数
//! 2. 破坏性阶段之前创建备份
//! 3. 按注册顺序串行执行阶段（必需阶段带重试）
//! 4. 必需阶段失败时中止并协调一次全量回滚
//! 5. 写报告与审计行（失败时写失败报告）

use std::sync::Arc;

use backon::BackoffBuilder;
use uuid::Uuid;

use super::context::{MigrationOptions, MigrationRun, PhaseResult, ProgressEvent, RunContext, RunStatus};
use super::executor::{PhaseExecution, PhaseExecutor};
use super::phases::{PhaseRegistry, RegisteredPhase};
use super::preflight::run_preflight;
use super::MigrationError;
use crate::backup::{Backup, BackupManager};
use crate::collections;
use crate::config::MigrationConfig;
use crate::report::{MigrationReport, ReportGenerator};
use crate::rollback::{RollbackEngine, RollbackOptions, RollbackRequest};
use crate::store::{BlobStore, RemoteStore};

type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// 生成运行 ID：`run_<YYYYmmdd_HHMMSS>_<rand8>`
fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    let rand8 = &Uuid::new_v4().simple().to_string()[..8];
    format!("run_{}_{}", now.format("%Y%m%d_%H%M%S"), rand8)
}

/// 迁移协调器
pub struct MigrationCoordinator {
    config: MigrationConfig,
    store: Arc<dyn RemoteStore>,
    registry: PhaseRegistry,
    executor: PhaseExecutor,
    backups: BackupManager,
    rollback: RollbackEngine,
    reports: ReportGenerator,
    progress_callback: Option<ProgressCallback>,
}

impl MigrationCoordinator {
    /// 创建协调器
    ///
    /// 配置在 `run` 开始时校验，校验失败同样会留下失败报告。
    pub fn new(
        config: MigrationConfig,
        store: Arc<dyn RemoteStore>,
        blobs: Arc<dyn BlobStore>,
        registry: PhaseRegistry,
    ) -> Self {
        let backups = BackupManager::new(&config.backup_dir);
        let rollback = RollbackEngine::from_config(&config, store.clone(), blobs);
        let reports = ReportGenerator::new(&config.reports_dir, store.clone());

        Self {
            executor: PhaseExecutor::new(store.clone()),
            config,
            store,
            registry,
            backups,
            rollback,
            reports,
            progress_callback: None,
        }
    }

    /// 设置进度回调
    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn rollback_engine(&self) -> &RollbackEngine {
        &self.rollback
    }

    pub fn report_generator(&self) -> &ReportGenerator {
        &self.reports
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.progress_callback {
            callback(event);
        }
    }

    /// 执行一次迁移运行
    ///
    /// 只有配置/预检/备份失败或必需阶段在重试耗尽后失败才返回 `Err`，
    /// 且返回前总会先尝试写失败报告。
    pub async fn run(&self, options: MigrationOptions) -> Result<MigrationReport, MigrationError> {
        let run_id = generate_run_id();
        let mut ctx = RunContext::new(run_id.clone(), options);
        let mut run = MigrationRun::new(run_id.clone());

        tracing::info!(
            run_id = %run_id,
            dry_run = ctx.dry_run(),
            "🚀 [MigrationCoordinator] 开始迁移运行, 阶段数: {}",
            self.registry.len()
        );

        // 0. 配置校验：只写本地报告，不写审计行
        if let Err(e) = self.config.validate() {
            ctx.add_error(format!("Configuration invalid: {}", e));
            tracing::error!("❌ [MigrationCoordinator] 配置无效，运行中止: {}", e);
            run.finish(RunStatus::Failed, &ctx);
            match self.reports.write_failure_local(&run, &e.to_string()).await {
                Ok(_) => self.emit(ProgressEvent::ReportWritten {
                    path: self.reports.failure_report_path(&run.id).display().to_string(),
                }),
                Err(report_err) => {
                    tracing::error!("[MigrationCoordinator] 失败报告写入失败: {}", report_err)
                }
            }
            return Err(e);
        }

        // 1. 预检
        let preflight = match run_preflight(self.store.as_ref(), &self.config).await {
            Ok(preflight) => preflight,
            Err(e) => {
                ctx.add_error(format!("Preflight failed: {}", e));
                return Err(self.abort_before_mutation(run, &ctx, e).await);
            }
        };
        ctx.stats.total_files = preflight.content_files;
        ctx.stats.total_media = preflight.media_files;
        self.emit(ProgressEvent::PreflightCompleted {
            expected_files: preflight.content_files,
            expected_media: preflight.media_files,
        });

        // 2. 备份（在任何破坏性阶段之前完成）
        let backup = match self.take_backup(&mut ctx).await {
            Ok(backup) => backup,
            Err(e) => {
                ctx.add_error(format!("Backup failed: {}", e));
                return Err(self.abort_before_mutation(run, &ctx, e).await);
            }
        };
        run.backup_id = backup.as_ref().map(|b| b.id.clone());

        // 3. 串行执行阶段
        let total = self.registry.len();
        let mut optional_failed = false;

        for (index, registered) in self.registry.phases().iter().enumerate() {
            let name = registered.phase.name;

            if ctx.options().skip_phases.contains(&name) {
                tracing::info!("⏭️ [MigrationCoordinator] 阶段 {} 被显式跳过", name);
                run.push_result(PhaseResult::skipped(name));
                continue;
            }

            self.emit(ProgressEvent::PhaseStarted {
                phase: name,
                index,
                total,
            });

            let PhaseExecution { result, error } = if registered.phase.required {
                self.execute_with_retry(registered, &mut ctx).await
            } else {
                self.executor.execute(registered, &mut ctx).await
            };

            self.emit(ProgressEvent::PhaseFinished {
                phase: name,
                status: result.status,
                duration_ms: result.duration_ms,
            });
            let attempts = result.attempts;
            run.push_result(result);

            let Some(error) = error else {
                tracing::info!("✅ [MigrationCoordinator] 阶段 {} 完成", name);
                continue;
            };

            if !registered.phase.required {
                optional_failed = true;
                ctx.add_warning(format!("Optional phase {} failed: {}", name, error));
                continue;
            }

            // 必需阶段失败：停止前进，开始恢复
            ctx.abort_flag().raise();
            let failure = MigrationError::PhaseFailed {
                phase: name.to_string(),
                attempts,
                reason: error.to_string(),
            };
            tracing::error!(
                failed_phase = name.as_str(),
                error = %error,
                "❌ [MigrationCoordinator] 必需阶段 {} 失败，终止运行",
                name
            );
            ctx.add_error(failure.to_string());

            self.recover(&mut run, &mut ctx, backup.as_ref()).await;
            run.finish(RunStatus::Failed, &ctx);
            self.write_failure_report(&run, &failure.to_string()).await;
            return Err(failure);
        }

        // 4. 收尾
        let status = if optional_failed {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        run.finish(status, &ctx);

        let report = match self.reports.write(&run).await {
            Ok(report) => {
                self.emit(ProgressEvent::ReportWritten {
                    path: self.reports.report_path(&run.id).display().to_string(),
                });
                report
            }
            Err(e) => {
                tracing::error!("[MigrationCoordinator] 报告写入失败: {}", e);
                self.reports.build(&run)
            }
        };

        tracing::info!(
            "🏁 [MigrationCoordinator] 迁移运行结束: status={}, 耗时 {}ms, 告警 {} 条",
            run.status.as_str(),
            report.duration_ms,
            report.warnings.len()
        );
        Ok(report)
    }

    /// 运行前快照；备份关闭或 dry-run 时返回 `None`
    async fn take_backup(&self, ctx: &mut RunContext) -> Result<Option<Backup>, MigrationError> {
        if ctx.dry_run() || !ctx.options().backup_enabled || !self.config.backup_enabled {
            tracing::info!("[MigrationCoordinator] 跳过备份 (dry_run={})", ctx.dry_run());
            return Ok(None);
        }

        let outcome = self
            .backups
            .snapshot(self.store.as_ref(), &collections::tracked_names())
            .await?;
        for warning in outcome.warnings {
            ctx.add_warning(warning);
        }

        let collections = outcome
            .backup
            .manifest
            .as_ref()
            .map(|m| m.collections.len())
            .unwrap_or(0);
        self.emit(ProgressEvent::BackupCompleted {
            backup_id: outcome.backup.id.clone(),
            collections,
        });

        if self.config.backup_retention > 0 {
            if let Err(e) = self.backups.cleanup_old_backups(self.config.backup_retention) {
                ctx.add_warning(format!("Failed to prune old backups: {}", e));
            }
        }

        Ok(Some(outcome.backup))
    }

    /// 必需阶段重试
    ///
    /// 配置类等不可重试的错误立即返回；每次尝试前复位中止标志。
    async fn execute_with_retry(
        &self,
        registered: &RegisteredPhase,
        ctx: &mut RunContext,
    ) -> PhaseExecution {
        let mut delays = self.config.retry_policy().build();
        let mut attempt = 1;

        loop {
            ctx.abort_flag().reset();
            let mut execution = self.executor.execute(registered, ctx).await;
            execution.result.attempts = attempt;

            let retryable = execution
                .error
                .as_ref()
                .map_or(false, MigrationError::is_retryable);
            if !retryable {
                return execution;
            }

            match delays.next() {
                Some(delay) => {
                    tracing::warn!(
                        "[MigrationCoordinator] 阶段 {} 第 {} 次尝试失败，{:?} 后重试",
                        registered.phase.name,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return execution,
            }
        }
    }

    /// 必需阶段失败后的一次全量回滚
    async fn recover(&self, run: &mut MigrationRun, ctx: &mut RunContext, backup: Option<&Backup>) {
        let Some(backup) = backup else {
            ctx.add_warning("No backup available for this run; remote store left as-is");
            return;
        };

        self.emit(ProgressEvent::RollbackStarted {
            backup_id: backup.id.clone(),
        });
        tracing::warn!("🔄 [MigrationCoordinator] 使用备份 {} 执行全量回滚", backup.id);

        match self
            .rollback
            .perform_rollback(&RollbackRequest::full(), backup, RollbackOptions::default())
            .await
        {
            Ok(stats) => {
                for error in &stats.errors {
                    ctx.add_error(format!("Rollback: {}", error));
                }
                for warning in &stats.warnings {
                    ctx.add_warning(format!("Rollback: {}", warning));
                }
                run.rollback = Some(stats);
            }
            Err(e) => ctx.add_error(format!("Rollback failed: {}", e)),
        }
    }

    /// 写操作之前的致命错误：写失败报告，不回滚
    async fn abort_before_mutation(
        &self,
        mut run: MigrationRun,
        ctx: &RunContext,
        error: MigrationError,
    ) -> MigrationError {
        tracing::error!("❌ [MigrationCoordinator] 运行在写操作之前中止: {}", error);
        run.finish(RunStatus::Failed, ctx);
        self.write_failure_report(&run, &error.to_string()).await;
        error
    }

    async fn write_failure_report(&self, run: &MigrationRun, reason: &str) {
        match self.reports.write_failure(run, reason).await {
            Ok(_) => self.emit(ProgressEvent::ReportWritten {
                path: self
                    .reports
                    .failure_report_path(&run.id)
                    .display()
                    .to_string(),
            }),
            Err(e) => tracing::error!("[MigrationCoordinator] 失败报告写入失败: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_format() {
        let id = generate_run_id();
        assert!(id.starts_with("run_"));
        // run_YYYYmmdd_HHMMSS_xxxxxxxx
        assert_eq!(id.len(), 4 + 15 + 1 + 8);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
