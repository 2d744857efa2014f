//! # Report 模块
//!
//! 把一次 `MigrationRun` 汇总为报告文件，并在审计集合中镜像一行。
//!
//! ## 设计原则
//!
//! 1. **确定性**：报告只由运行记录推导，不读取当前时间或外部状态
//! 2. **本地为准**：JSON 文件是权威产物，审计行写入失败只记日志
//! 3. **失败也留痕**：致命错误在进程退出前总会先写失败报告
//!
//! ## 产物
//!
//! - `migration_report_<runId>.json`
//! - `migration_failure_<runId>.json`（附加 `partialCompletion` 与 `recoveryRecommendations`）

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditLog, AuditOperation, AuditRepository};
use crate::backup::write_atomic;
use crate::migration::{
    MigrationError, MigrationRun, PhaseName, PhaseResult, PhaseStatus, RunStats, RunStatus,
};
use crate::rollback::RollbackStats;
use crate::store::RemoteStore;

/// 失败报告中的固定恢复建议
pub const RECOVERY_RECOMMENDATIONS: &[&str] = &[
    "Check the failure reason and the error list in this report",
    "Verify connectivity and credentials for the destination store",
    "Validate the latest backup before retrying",
    "Inspect the pre-rollback snapshot if the rollback result looks wrong",
    "Re-run the migration after fixing the cause; schema setup is skipped when already present",
];

/// 单个阶段的摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSummary {
    pub phase: PhaseName,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    pub skipped: bool,
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&PhaseResult> for PhaseSummary {
    fn from(result: &PhaseResult) -> Self {
        Self {
            phase: result.phase,
            status: result.status,
            duration_ms: result.duration_ms,
            skipped: result.skipped,
            attempts: result.attempts,
            error: result.error.clone(),
        }
    }
}

/// 运行报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub backup_id: Option<String>,
    pub phases: Vec<PhaseSummary>,
    pub stats: RunStats,
    /// `migratedFiles / totalFiles`，两位小数的百分比
    pub success_rate: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStats>,
    #[serde(default)]
    pub dry_run: bool,
    pub success: bool,
}

/// 失败时的完成情况
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialCompletion {
    pub completed_phases: Vec<PhaseName>,
    pub failed_phase: Option<PhaseName>,
    pub not_run_phases: Vec<PhaseName>,
    pub rolled_back: bool,
}

/// 失败报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    #[serde(flatten)]
    pub report: MigrationReport,
    pub failure_reason: String,
    pub partial_completion: PartialCompletion,
    pub recovery_recommendations: Vec<String>,
}

/// 成功率：`"83.33%"`，总数为 0 时为 `"0.00%"`
pub fn success_rate(migrated: usize, total: usize) -> String {
    if total == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", migrated as f64 / total as f64 * 100.0)
}

/// 由计数推导的后续步骤
pub fn next_steps(run: &MigrationRun) -> Vec<String> {
    let mut steps = Vec::new();
    let stats = &run.stats;

    if !run.errors.is_empty() {
        steps.push(format!("Review {} error(s) listed in this report", run.errors.len()));
    }
    if !run.warnings.is_empty() {
        steps.push(format!("Review {} warning(s) listed in this report", run.warnings.len()));
    }
    if stats.failed_files > 0 {
        steps.push(format!("Re-run migration for {} failed content file(s)", stats.failed_files));
    }
    if stats.media_failed > 0 {
        steps.push(format!("Retry upload for {} failed media file(s)", stats.media_failed));
    }
    if run.rollback.is_some() {
        steps.push("Inspect rolled-back collections before re-running the migration".to_string());
    }
    if stats.url_mappings_created > 0 {
        steps.push(format!(
            "Configure redirects from the {} generated URL mapping(s)",
            stats.url_mappings_created
        ));
    }
    if run.status != RunStatus::Failed {
        steps.push("Verify migrated content in the destination store".to_string());
    }
    steps
}

/// 报告生成器
pub struct ReportGenerator {
    reports_dir: PathBuf,
    store: Arc<dyn RemoteStore>,
}

impl ReportGenerator {
    pub fn new(reports_dir: impl Into<PathBuf>, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
            store,
        }
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    pub fn report_path(&self, run_id: &str) -> PathBuf {
        self.reports_dir
            .join(format!("migration_report_{}.json", run_id))
    }

    pub fn failure_report_path(&self, run_id: &str) -> PathBuf {
        self.reports_dir
            .join(format!("migration_failure_{}.json", run_id))
    }

    /// 构建报告（纯函数）
    pub fn build(&self, run: &MigrationRun) -> MigrationReport {
        MigrationReport {
            run_id: run.id.clone(),
            status: run.status,
            started_at: run.start_time,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms(),
            backup_id: run.backup_id.clone(),
            phases: run.phases.iter().map(PhaseSummary::from).collect(),
            stats: run.stats.clone(),
            success_rate: success_rate(run.stats.migrated_files, run.stats.total_files),
            errors: run.errors.clone(),
            warnings: run.warnings.clone(),
            next_steps: next_steps(run),
            rollback: run.rollback.clone(),
            dry_run: run.dry_run,
            success: run.status != RunStatus::Failed,
        }
    }

    pub fn build_failure(&self, run: &MigrationRun, reason: &str) -> FailureReport {
        let executed: Vec<PhaseName> = run.phases.iter().map(|r| r.phase).collect();
        FailureReport {
            report: self.build(run),
            failure_reason: reason.to_string(),
            partial_completion: PartialCompletion {
                completed_phases: run.completed_phases(),
                failed_phase: run.failed_phases().into_iter().last(),
                not_run_phases: PhaseName::all_ordered()
                    .into_iter()
                    .filter(|p| !executed.contains(p))
                    .collect(),
                rolled_back: run.rollback.is_some(),
            },
            recovery_recommendations: RECOVERY_RECOMMENDATIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// 写入运行报告并镜像到审计集合
    pub async fn write(&self, run: &MigrationRun) -> Result<MigrationReport, MigrationError> {
        let report = self.build(run);
        let path = self.report_path(&run.id);
        self.persist(&path, &report).await?;
        self.mirror(run, serde_json::to_value(&report)?, None).await;
        Ok(report)
    }

    /// 写入失败报告并镜像到审计集合
    pub async fn write_failure(
        &self,
        run: &MigrationRun,
        reason: &str,
    ) -> Result<FailureReport, MigrationError> {
        let report = self.build_failure(run, reason);
        let path = self.failure_report_path(&run.id);
        self.persist(&path, &report).await?;
        self.mirror(run, serde_json::to_value(&report)?, Some(reason))
            .await;
        Ok(report)
    }

    /// 只写本地失败报告，不写审计行
    ///
    /// 用于配置校验失败：远端凭据本身可能就是问题所在。
    pub async fn write_failure_local(
        &self,
        run: &MigrationRun,
        reason: &str,
    ) -> Result<FailureReport, MigrationError> {
        let report = self.build_failure(run, reason);
        self.persist(&self.failure_report_path(&run.id), &report).await?;
        Ok(report)
    }

    async fn persist<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), MigrationError> {
        tokio::fs::create_dir_all(&self.reports_dir).await?;
        let json = serde_json::to_vec_pretty(value)?;
        write_atomic(path, &json).await?;
        info!("[ReportGenerator] 报告已写入: {}", path.display());
        Ok(())
    }

    /// 审计行写入失败不影响运行结果；dry-run 不写远端
    async fn mirror(&self, run: &MigrationRun, payload: serde_json::Value, reason: Option<&str>) {
        if run.dry_run {
            return;
        }
        let operation = AuditOperation::MigrationRun {
            phases_completed: run.completed_phases().len(),
            phases_total: PhaseName::all_ordered().len(),
            rolled_back: run.rollback.is_some(),
        };
        let log = AuditLog::new(operation, run.id.clone()).with_details(payload);
        let duration_ms = run.duration_ms();
        let log = match run.status {
            RunStatus::Completed => log.complete(duration_ms),
            RunStatus::Partial => log.partial(duration_ms),
            RunStatus::Failed | RunStatus::Running => log
                .fail(reason.unwrap_or("migration did not complete"))
                .with_duration(duration_ms),
        };

        if let Err(e) = AuditRepository::save(self.store.as_ref(), &log).await {
            warn!("[ReportGenerator] 审计记录写入失败（本地报告仍然有效）: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::MIGRATION_LOG_COLLECTION;
    use crate::migration::{MigrationOptions, RunContext};
    use crate::store::{MemoryStore, StoreOp};
    use tempfile::TempDir;

    fn finished_run(status: RunStatus) -> MigrationRun {
        let mut ctx = RunContext::new("run_1", MigrationOptions::default());
        ctx.stats.total_files = 6;
        ctx.stats.migrated_files = 5;
        let mut run = MigrationRun::new("run_1");
        run.push_result(PhaseResult::skipped(PhaseName::SchemaSetup));
        run.finish(status, &ctx);
        run
    }

    #[test]
    fn test_success_rate_formatting() {
        assert_eq!(success_rate(5, 6), "83.33%");
        assert_eq!(success_rate(0, 0), "0.00%");
        assert_eq!(success_rate(10, 10), "100.00%");
    }

    #[test]
    fn test_review_errors_iff_errors_present() {
        let mut run = finished_run(RunStatus::Completed);
        assert!(!next_steps(&run).iter().any(|s| s.contains("error(s)")));

        run.errors.push("boom".to_string());
        assert!(next_steps(&run).iter().any(|s| s.contains("error(s)")));
    }

    #[test]
    fn test_build_is_deterministic() {
        let generator = ReportGenerator::new("reports", Arc::new(MemoryStore::new()));
        let run = finished_run(RunStatus::Completed);
        assert_eq!(generator.build(&run), generator.build(&run));
        assert_eq!(generator.build(&run).success_rate, "83.33%");
    }

    #[test]
    fn test_failure_report_partial_completion() {
        let generator = ReportGenerator::new("reports", Arc::new(MemoryStore::new()));
        let mut run = MigrationRun::new("run_2");
        run.push_result(PhaseResult::skipped(PhaseName::SchemaSetup));
        run.push_result(PhaseResult {
            phase: PhaseName::ContentMigration,
            duration_ms: 3,
            status: PhaseStatus::Failed,
            error: Some("boom".into()),
            skipped: false,
            attempts: 3,
        });
        run.finish(RunStatus::Failed, &RunContext::new("run_2", MigrationOptions::default()));

        let failure = generator.build_failure(&run, "content-migration failed");
        assert!(!failure.report.success);
        assert_eq!(failure.partial_completion.failed_phase, Some(PhaseName::ContentMigration));
        assert_eq!(failure.partial_completion.not_run_phases.len(), 4);
        assert_eq!(failure.recovery_recommendations.len(), RECOVERY_RECOMMENDATIONS.len());

        let json = serde_json::to_value(&failure).unwrap();
        assert!(json.get("runId").is_some());
        assert!(json.get("partialCompletion").is_some());
        assert!(json.get("recoveryRecommendations").is_some());
    }

    #[tokio::test]
    async fn test_write_persists_file_and_audit_row() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let generator = ReportGenerator::new(dir.path().join("reports"), store.clone());

        let report = generator.write(&finished_run(RunStatus::Partial)).await.unwrap();
        assert!(report.success);

        let raw = std::fs::read_to_string(generator.report_path("run_1")).unwrap();
        let parsed: MigrationReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, report);

        let rows = store.contents(MIGRATION_LOG_COLLECTION).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("status"), Some("partial"));
        assert_eq!(rows[0].get_str("runId"), Some("run_1"));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_write() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.fail_on(StoreOp::InsertOne, MIGRATION_LOG_COLLECTION);
        let generator = ReportGenerator::new(dir.path(), store.clone());

        assert!(generator.write(&finished_run(RunStatus::Completed)).await.is_ok());
        assert!(generator.report_path("run_1").exists());
    }
}
