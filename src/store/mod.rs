//! # Store 模块
//!
//! 远端存储的抽象边界。迁移引擎只依赖"按名称寻址的记录集合"这一最小能力，
//! 不关心具体的线协议（REST / SQL / KV 均可实现）。
//!
//! ## 组件
//!
//! - `RemoteStore`: 集合级 CRUD（list / delete_all / insert_batch / delete_by_id / insert_one）
//! - `BlobStore`: 二进制对象存储（仅需要 `remove_object`）
//! - `Record`: 以 `id` 字段寻址的不透明 JSON 对象
//! - `memory`: 进程内实现，用于 dry-run 与测试

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use memory::{MemoryBlobStore, MemoryStore, StoreCall, StoreOp};

/// 记录主键字段名
pub const RECORD_ID_FIELD: &str = "id";

/// 远端集合中的一条记录
///
/// 对记录内容不做任何解释，仅要求存在 `id` 字段。序列化形态与原始 JSON 对象完全一致，
/// 因此备份文件就是 `Vec<Record>` 的 JSON 数组。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// 从任意 JSON 值构造，非对象返回 `None`
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// 记录 ID（字符串原样返回，数字转为十进制字符串）
    pub fn id(&self) -> Option<String> {
        match self.0.get(RECORD_ID_FIELD)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// 读取字符串字段
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// 远端存储错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Remote store unreachable: {0}")]
    Unreachable(String),

    #[error("Remote store rejected request on {collection}: {reason}")]
    Rejected { collection: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote store error: {0}")]
    Other(String),
}

impl StoreError {
    /// 是否属于连通性问题（网络 / 服务不可用）
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 统一的远端集合访问 trait
///
/// 所有方法都是异步 I/O 边界；调用方挂起直到请求完成或超时。
/// 实现方不需要提供事务语义，引擎通过备份 + 串行纪律保证安全。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 获取存储后端名称（用于日志和调试）
    fn provider_name(&self) -> &'static str;

    /// 检查连接是否可用
    async fn ping(&self) -> StoreResult<()>;

    /// 列出集合中的全部记录
    async fn list(&self, collection: &str) -> StoreResult<Vec<Record>>;

    /// 清空集合（删除全部记录，不删除集合本身）
    async fn delete_all(&self, collection: &str) -> StoreResult<()>;

    /// 批量插入
    ///
    /// 调用方负责分块，单次调用的记录数不会超过配置的 `insert_chunk_size`
    async fn insert_batch(&self, collection: &str, records: &[Record]) -> StoreResult<()>;

    /// 按 ID 删除单条记录
    async fn delete_by_id(&self, collection: &str, id: &str) -> StoreResult<()>;

    /// 插入单条记录
    async fn insert_one(&self, collection: &str, record: &Record) -> StoreResult<()>;

    /// 集合是否已存在（用于判断目标 schema 是否已就绪）
    async fn collection_exists(&self, collection: &str) -> StoreResult<bool> {
        match self.list(collection).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// 二进制对象存储
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// 删除对象
    ///
    /// # Arguments
    /// * `bucket` - 存储桶
    /// * `key` - 对象键（相对于 bucket）
    async fn remove_object(&self, bucket: &str, key: &str) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_string_and_number() {
        let a = Record::from_value(json!({"id": "post-1", "title": "Hello"})).unwrap();
        let b = Record::from_value(json!({"id": 42})).unwrap();
        let c = Record::from_value(json!({"title": "no id"})).unwrap();

        assert_eq!(a.id().as_deref(), Some("post-1"));
        assert_eq!(b.id().as_deref(), Some("42"));
        assert_eq!(c.id(), None);
    }

    #[test]
    fn test_record_rejects_non_object() {
        assert!(Record::from_value(json!([1, 2, 3])).is_none());
        assert!(serde_json::from_str::<Vec<Record>>("[1, 2]").is_err());
    }

    #[test]
    fn test_record_serializes_as_plain_object() {
        let record = Record::from_value(json!({"id": "a", "n": 1})).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"id":"a","n":1}"#);
    }
}
