//! 阶段执行器
//!
//! 只负责计时、统一错误捕获，以及 schema-setup 的幂等保护；
//! 阶段本身做什么由注册的 `PhaseHandler` 决定。

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::context::{PhaseResult, PhaseStatus, RunContext};
use super::phases::{PhaseName, RegisteredPhase};
use super::MigrationError;
use crate::collections;
use crate::store::RemoteStore;

/// 一次阶段执行的结果
///
/// `result` 会被追加到运行记录；`error` 保留类型化错误供协调器判断是否重试。
#[derive(Debug)]
pub struct PhaseExecution {
    pub result: PhaseResult,
    pub error: Option<MigrationError>,
}

pub struct PhaseExecutor {
    store: Arc<dyn RemoteStore>,
}

impl PhaseExecutor {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// 执行一个阶段
    pub async fn execute(&self, registered: &RegisteredPhase, ctx: &mut RunContext) -> PhaseExecution {
        let name = registered.phase.name;
        let start = Instant::now();
        ctx.set_current_phase(Some(name));

        let outcome = self.run_handler(registered, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        ctx.set_current_phase(None);

        match outcome {
            Ok(skipped) => {
                debug!(
                    "[PhaseExecutor] {} 完成 ({}ms{})",
                    name,
                    duration_ms,
                    if skipped { ", skipped" } else { "" }
                );
                PhaseExecution {
                    result: PhaseResult {
                        phase: name,
                        duration_ms,
                        status: PhaseStatus::Ok,
                        error: None,
                        skipped,
                        attempts: 1,
                    },
                    error: None,
                }
            }
            Err(e) => {
                warn!("[PhaseExecutor] {} 失败 ({}ms): {}", name, duration_ms, e);
                PhaseExecution {
                    result: PhaseResult {
                        phase: name,
                        duration_ms,
                        status: PhaseStatus::Failed,
                        error: Some(e.to_string()),
                        skipped: false,
                        attempts: 1,
                    },
                    error: Some(e),
                }
            }
        }
    }

    /// 返回 `Ok(true)` 表示处理器未执行
    async fn run_handler(
        &self,
        registered: &RegisteredPhase,
        ctx: &mut RunContext,
    ) -> Result<bool, MigrationError> {
        let name = registered.phase.name;

        if name == PhaseName::SchemaSetup && self.schema_present().await? {
            info!("[PhaseExecutor] 目标 schema 已存在，schema-setup 跳过");
            return Ok(true);
        }

        let Some(handler) = registered.handler() else {
            ctx.add_warning(format!("Phase {} has no handler registered; skipped", name));
            return Ok(true);
        };

        handler.run(ctx).await?;
        Ok(false)
    }

    /// 所有被追踪集合都已存在时视为 schema 就绪
    async fn schema_present(&self) -> Result<bool, MigrationError> {
        for collection in collections::all_ordered() {
            if !self.store.collection_exists(collection.name).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::context::MigrationOptions;
    use crate::migration::phases::{handler_fn, PhaseRegistry};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> RunContext {
        RunContext::new("run_test", MigrationOptions::default())
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        for name in collections::tracked_names() {
            store.seed(name, Vec::new());
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_schema_setup_is_noop_when_schema_present() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = PhaseRegistry::builder()
            .handler(
                PhaseName::SchemaSetup,
                handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .handler(PhaseName::ContentMigration, handler_fn(|_| Ok(())))
            .build()
            .unwrap();

        let executor = PhaseExecutor::new(seeded_store());
        let mut ctx = ctx();
        let execution = executor
            .execute(registry.get(PhaseName::SchemaSetup).unwrap(), &mut ctx)
            .await;

        assert!(execution.result.is_ok());
        assert!(execution.result.skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_schema_setup_runs_on_empty_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = PhaseRegistry::builder()
            .handler(
                PhaseName::SchemaSetup,
                handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .handler(PhaseName::ContentMigration, handler_fn(|_| Ok(())))
            .build()
            .unwrap();

        let executor = PhaseExecutor::new(Arc::new(MemoryStore::new()));
        let mut ctx = ctx();
        let execution = executor
            .execute(registry.get(PhaseName::SchemaSetup).unwrap(), &mut ctx)
            .await;

        assert!(!execution.result.skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_result() {
        let registry = PhaseRegistry::builder()
            .handler(PhaseName::SchemaSetup, handler_fn(|_| Ok(())))
            .handler(
                PhaseName::ContentMigration,
                handler_fn(|_| Err(anyhow::anyhow!("parser exploded").into())),
            )
            .build()
            .unwrap();

        let executor = PhaseExecutor::new(seeded_store());
        let mut ctx = ctx();
        let execution = executor
            .execute(registry.get(PhaseName::ContentMigration).unwrap(), &mut ctx)
            .await;

        assert_eq!(execution.result.status, PhaseStatus::Failed);
        assert!(execution.result.error.unwrap().contains("parser exploded"));
        assert!(matches!(execution.error, Some(MigrationError::Handler(_))));
        assert!(ctx.current_phase().is_none());
    }

    #[tokio::test]
    async fn test_missing_optional_handler_is_skipped_with_warning() {
        let registry = PhaseRegistry::builder()
            .handler(PhaseName::SchemaSetup, handler_fn(|_| Ok(())))
            .handler(PhaseName::ContentMigration, handler_fn(|_| Ok(())))
            .build()
            .unwrap();

        let executor = PhaseExecutor::new(seeded_store());
        let mut ctx = ctx();
        let execution = executor
            .execute(registry.get(PhaseName::Validation).unwrap(), &mut ctx)
            .await;

        assert!(execution.result.is_ok());
        assert!(execution.result.skipped);
        assert_eq!(ctx.warnings().len(), 1);
    }
}
