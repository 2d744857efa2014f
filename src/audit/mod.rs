//! # Audit 模块
//!
//! 每次迁移运行在远端 `migration_log` 集合中留下一行审计记录。
//!
//! ## 设计原则
//!
//! 1. **结构化**：记录内容即报告负载，外加 `status` 等少量元字段
//! 2. **不阻断**：审计写入失败只记日志，本地报告文件才是权威来源
//! 3. **只追加**：审计集合不被追踪，永远不会被回滚

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collections::MIGRATION_LOG_COLLECTION;
use crate::store::{Record, RemoteStore, StoreError};

/// 审计日志条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    /// 唯一 ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    /// 操作目标（运行 ID）
    pub target: String,
    pub status: AuditStatus,
    pub duration_ms: Option<u64>,
    /// 详细信息（报告负载）
    pub details: Value,
    pub error_message: Option<String>,
}

/// 审计操作类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditOperation {
    /// 一次迁移运行
    MigrationRun {
        phases_completed: usize,
        phases_total: usize,
        rolled_back: bool,
    },
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::MigrationRun { .. } => "migration_run",
        }
    }
}

/// 审计状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Started,
    Completed,
    Failed,
    Partial,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::Partial => "partial",
        }
    }
}

impl AuditLog {
    pub fn new(operation: AuditOperation, target: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation,
            target: target.into(),
            status: AuditStatus::Started,
            duration_ms: None,
            details: Value::Null,
            error_message: None,
        }
    }

    /// 标记为完成
    pub fn complete(mut self, duration_ms: u64) -> Self {
        self.status = AuditStatus::Completed;
        self.duration_ms = Some(duration_ms);
        self
    }

    /// 标记为部分成功（可选阶段失败）
    pub fn partial(mut self, duration_ms: u64) -> Self {
        self.status = AuditStatus::Partial;
        self.duration_ms = Some(duration_ms);
        self
    }

    /// 标记为失败
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = AuditStatus::Failed;
        self.error_message = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// 转换为远端记录：报告负载 + 元字段
    pub fn to_record(&self) -> Record {
        let mut fields = match &self.details {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("details".to_string(), other.clone());
                map
            }
        };

        fields.insert("id".to_string(), Value::String(self.id.clone()));
        fields.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        fields.insert(
            "operation".to_string(),
            Value::String(self.operation.as_str().to_string()),
        );
        fields.insert("target".to_string(), Value::String(self.target.clone()));
        fields.insert(
            "loggedAt".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        if let Some(duration_ms) = self.duration_ms {
            fields.insert("durationMs".to_string(), Value::from(duration_ms));
        }
        if let Some(error) = &self.error_message {
            fields.insert("errorMessage".to_string(), Value::String(error.clone()));
        }
        Record::new(fields)
    }
}

/// 审计错误
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit store error: {0}")]
    Store(#[from] StoreError),
}

/// 审计日志仓库
pub struct AuditRepository;

impl AuditRepository {
    /// 保存审计日志
    pub async fn save(store: &dyn RemoteStore, log: &AuditLog) -> Result<(), AuditError> {
        store
            .insert_one(MIGRATION_LOG_COLLECTION, &log.to_record())
            .await?;
        tracing::debug!(
            "[Audit] 已写入审计记录 {} ({}, {})",
            log.id,
            log.target,
            log.status.as_str()
        );
        Ok(())
    }

    /// 读取全部审计记录（按写入顺序）
    pub async fn list(store: &dyn RemoteStore) -> Result<Vec<Record>, AuditError> {
        match store.list(MIGRATION_LOG_COLLECTION).await {
            Ok(records) => Ok(records),
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};
    use serde_json::json;

    fn operation() -> AuditOperation {
        AuditOperation::MigrationRun {
            phases_completed: 6,
            phases_total: 6,
            rolled_back: false,
        }
    }

    #[test]
    fn test_builder_transitions() {
        let log = AuditLog::new(operation(), "run_1").complete(1200);
        assert_eq!(log.status, AuditStatus::Completed);
        assert_eq!(log.duration_ms, Some(1200));

        let log = AuditLog::new(operation(), "run_2").fail("content-migration failed");
        assert_eq!(log.status, AuditStatus::Failed);
        assert!(log.error_message.is_some());
    }

    #[test]
    fn test_record_carries_payload_and_status() {
        let log = AuditLog::new(operation(), "run_1")
            .with_details(json!({"runId": "run_1", "success": true}))
            .partial(10);
        let record = log.to_record();

        assert_eq!(record.get_str("runId"), Some("run_1"));
        assert_eq!(record.get_str("status"), Some("partial"));
        assert_eq!(record.id(), Some(log.id.clone()));
    }

    #[tokio::test]
    async fn test_save_and_list() {
        let store = MemoryStore::new();
        assert!(AuditRepository::list(&store).await.unwrap().is_empty());

        let log = AuditLog::new(operation(), "run_1").complete(5);
        AuditRepository::save(&store, &log).await.unwrap();
        assert_eq!(AuditRepository::list(&store).await.unwrap().len(), 1);

        store.fail_on(StoreOp::InsertOne, MIGRATION_LOG_COLLECTION);
        assert!(AuditRepository::save(&store, &log).await.is_err());
    }
}
