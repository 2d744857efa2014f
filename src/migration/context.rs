//! 运行上下文与运行记录
//!
//! `RunContext` 显式传入每个阶段，承载统计计数、错误和告警；
//! `MigrationRun` 由协调器独占，阶段结果只追加不修改。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phases::PhaseName;
use crate::rollback::RollbackStats;

/// 全局运行状态标志
///
/// 必需阶段发现致命错误时置位；长时间运行的批处理循环在批次之间检查它，
/// 以便尽快停止而不是跑完剩余队列。
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 单次运行选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOptions {
    /// 预演：不备份、不回滚，处理器通过 `ctx.dry_run()` 自行跳过写操作
    #[serde(default)]
    pub dry_run: bool,
    /// 是否在破坏性阶段前创建备份
    #[serde(default = "default_backup_enabled")]
    pub backup_enabled: bool,
    /// 显式跳过的阶段
    #[serde(default)]
    pub skip_phases: Vec<PhaseName>,
}

fn default_backup_enabled() -> bool {
    true
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            backup_enabled: default_backup_enabled(),
            skip_phases: Vec::new(),
        }
    }
}

impl MigrationOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn without_backup(mut self) -> Self {
        self.backup_enabled = false;
        self
    }

    pub fn skip(mut self, phase: PhaseName) -> Self {
        if !self.skip_phases.contains(&phase) {
            self.skip_phases.push(phase);
        }
        self
    }
}

/// 运行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    /// 源语料中的内容文件数（预检计数）
    pub total_files: usize,
    pub migrated_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    /// 源语料中的媒体文件数（预检计数）
    pub total_media: usize,
    pub media_uploaded: usize,
    pub media_failed: usize,
    pub url_mappings_created: usize,
    pub records_written: usize,
}

/// 运行上下文
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    options: MigrationOptions,
    current_phase: Option<PhaseName>,
    abort: AbortFlag,
    errors: Vec<String>,
    warnings: Vec<String>,
    pub stats: RunStats,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, options: MigrationOptions) -> Self {
        Self {
            run_id: run_id.into(),
            options,
            current_phase: None,
            abort: AbortFlag::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            stats: RunStats::default(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }

    pub fn current_phase(&self) -> Option<PhaseName> {
        self.current_phase
    }

    pub(crate) fn set_current_phase(&mut self, phase: Option<PhaseName>) {
        self.current_phase = phase;
    }

    /// 共享的中止标志（可克隆进批处理任务）
    pub fn abort_flag(&self) -> &AbortFlag {
        &self.abort
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        tracing::error!(run_id = %self.run_id, phase = ?self.current_phase, "{}", error);
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(run_id = %self.run_id, phase = ?self.current_phase, "{}", warning);
        self.warnings.push(warning);
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Ok,
    Failed,
}

/// 阶段结果（追加后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub phase: PhaseName,
    pub duration_ms: u64,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 未执行处理器（schema 已就绪 / 未注册处理器 / 被显式跳过）
    #[serde(default)]
    pub skipped: bool,
    #[serde(default = "default_attempts")]
    pub attempts: usize,
}

fn default_attempts() -> usize {
    1
}

impl PhaseResult {
    pub fn is_ok(&self) -> bool {
        self.status == PhaseStatus::Ok
    }

    pub fn skipped(phase: PhaseName) -> Self {
        Self {
            phase,
            duration_ms: 0,
            status: PhaseStatus::Ok,
            error: None,
            skipped: true,
            attempts: 0,
        }
    }
}

/// 一次迁移运行
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseResult>,
    pub status: RunStatus,
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub rollback: Option<RollbackStats>,
    #[serde(default)]
    pub stats: RunStats,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl MigrationRun {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_time: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            status: RunStatus::Running,
            backup_id: None,
            rollback: None,
            stats: RunStats::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            dry_run: false,
        }
    }

    pub fn push_result(&mut self, result: PhaseResult) {
        self.phases.push(result);
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }

    /// 收尾：固定结束时间并吸收上下文中的统计、错误与告警
    pub fn finish(&mut self, status: RunStatus, ctx: &RunContext) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.stats = ctx.stats.clone();
        self.errors = ctx.errors().to_vec();
        self.warnings = ctx.warnings().to_vec();
        self.dry_run = ctx.dry_run();
    }

    /// 总耗时（毫秒）
    pub fn duration_ms(&self) -> u64 {
        self.finished_at
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// 已成功执行（含跳过）的阶段
    pub fn completed_phases(&self) -> Vec<PhaseName> {
        self.phases
            .iter()
            .filter(|r| r.is_ok())
            .map(|r| r.phase)
            .collect()
    }

    pub fn failed_phases(&self) -> Vec<PhaseName> {
        self.phases
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| r.phase)
            .collect()
    }
}

/// 进度事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    PreflightCompleted {
        expected_files: usize,
        expected_media: usize,
    },
    BackupCompleted {
        backup_id: String,
        collections: usize,
    },
    PhaseStarted {
        phase: PhaseName,
        index: usize,
        total: usize,
    },
    PhaseFinished {
        phase: PhaseName,
        status: PhaseStatus,
        duration_ms: u64,
    },
    RollbackStarted {
        backup_id: String,
    },
    ReportWritten {
        path: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_flag_is_shared_between_clones() {
        let flag = AbortFlag::new();
        let clone = flag.clone();
        clone.raise();
        assert!(flag.is_raised());
        flag.reset();
        assert!(!clone.is_raised());
    }

    #[test]
    fn test_run_finish_absorbs_context() {
        let mut ctx = RunContext::new("run_1", MigrationOptions::default());
        ctx.stats.total_files = 10;
        ctx.add_warning("slow upload");

        let mut run = MigrationRun::new("run_1");
        run.push_result(PhaseResult::skipped(PhaseName::SchemaSetup));
        run.finish(RunStatus::Completed, &ctx);

        assert!(run.is_terminal());
        assert_eq!(run.stats.total_files, 10);
        assert_eq!(run.warnings, vec!["slow upload".to_string()]);
        assert_eq!(run.completed_phases(), vec![PhaseName::SchemaSetup]);
    }

    #[test]
    fn test_options_serde_defaults() {
        let options: MigrationOptions = serde_json::from_str("{}").unwrap();
        assert!(options.backup_enabled);
        assert!(!options.dry_run);

        let options = MigrationOptions::default()
            .skip(PhaseName::Cleanup)
            .skip(PhaseName::Cleanup);
        assert_eq!(options.skip_phases, vec![PhaseName::Cleanup]);
    }
}
