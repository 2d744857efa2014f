//! 进程内存储实现
//!
//! `MemoryStore` 记录每一次调用，并支持按 (操作, 集合) 注入失败，
//! 供 dry-run 预演和测试断言批量行为使用。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{BlobStore, Record, RemoteStore, StoreError, StoreResult};

/// 存储操作类型（用于失败注入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    DeleteAll,
    InsertBatch,
    DeleteById,
    InsertOne,
}

/// 已发生的存储调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    List { collection: String },
    DeleteAll { collection: String },
    InsertBatch { collection: String, size: usize },
    DeleteById { collection: String, id: String },
    InsertOne { collection: String },
}

impl StoreCall {
    pub fn collection(&self) -> &str {
        match self {
            StoreCall::List { collection }
            | StoreCall::DeleteAll { collection }
            | StoreCall::InsertBatch { collection, .. }
            | StoreCall::DeleteById { collection, .. }
            | StoreCall::InsertOne { collection } => collection,
        }
    }

    /// 是否为写操作
    pub fn is_mutation(&self) -> bool {
        !matches!(self, StoreCall::List { .. })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 内存远端存储
#[derive(Debug)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Vec<Record>>>,
    calls: Mutex<Vec<StoreCall>>,
    failures: Mutex<HashSet<(StoreOp, String)>>,
    reachable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// 预置集合内容（不记录调用）
    pub fn with_collection(self, name: &str, records: Vec<Record>) -> Self {
        self.seed(name, records);
        self
    }

    pub fn seed(&self, name: &str, records: Vec<Record>) {
        lock(&self.collections).insert(name.to_string(), records);
    }

    /// 读取集合当前内容（不记录调用）
    pub fn contents(&self, name: &str) -> Option<Vec<Record>> {
        lock(&self.collections).get(name).cloned()
    }

    /// 全部集合名
    pub fn collection_names(&self) -> Vec<String> {
        lock(&self.collections).keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// 某集合上每次 insert_batch 的批大小
    pub fn insert_batch_sizes(&self, collection: &str) -> Vec<usize> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                StoreCall::InsertBatch { collection: c, size } if c == collection => Some(*size),
                _ => None,
            })
            .collect()
    }

    /// 写操作次数
    pub fn mutation_count(&self) -> usize {
        lock(&self.calls).iter().filter(|c| c.is_mutation()).count()
    }

    /// 注入失败：之后对该集合的该操作都返回错误
    pub fn fail_on(&self, op: StoreOp, collection: &str) {
        lock(&self.failures).insert((op, collection.to_string()));
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self, op: StoreOp, collection: &str) -> StoreResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("memory store offline".to_string()));
        }
        if lock(&self.failures).contains(&(op, collection.to_string())) {
            return Err(StoreError::Rejected {
                collection: collection.to_string(),
                reason: format!("injected failure for {:?}", op),
            });
        }
        Ok(())
    }

    fn record_call(&self, call: StoreCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable("memory store offline".to_string()))
        }
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<Record>> {
        self.record_call(StoreCall::List {
            collection: collection.to_string(),
        });
        self.check(StoreOp::List, collection)?;
        lock(&self.collections)
            .get(collection)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("collection {}", collection)))
    }

    async fn delete_all(&self, collection: &str) -> StoreResult<()> {
        self.record_call(StoreCall::DeleteAll {
            collection: collection.to_string(),
        });
        self.check(StoreOp::DeleteAll, collection)?;
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .clear();
        Ok(())
    }

    async fn insert_batch(&self, collection: &str, records: &[Record]) -> StoreResult<()> {
        self.record_call(StoreCall::InsertBatch {
            collection: collection.to_string(),
            size: records.len(),
        });
        self.check(StoreOp::InsertBatch, collection)?;

        let mut collections = lock(&self.collections);
        let target = collections.entry(collection.to_string()).or_default();

        // 主键约束：整批校验通过后才写入
        let mut seen: BTreeSet<String> = target.iter().filter_map(Record::id).collect();
        for record in records {
            if let Some(id) = record.id() {
                if !seen.insert(id.clone()) {
                    return Err(StoreError::Rejected {
                        collection: collection.to_string(),
                        reason: format!("duplicate id {}", id),
                    });
                }
            }
        }
        target.extend(records.iter().cloned());
        Ok(())
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.record_call(StoreCall::DeleteById {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        self.check(StoreOp::DeleteById, collection)?;
        if let Some(records) = lock(&self.collections).get_mut(collection) {
            records.retain(|r| r.id().as_deref() != Some(id));
        }
        Ok(())
    }

    async fn insert_one(&self, collection: &str, record: &Record) -> StoreResult<()> {
        self.record_call(StoreCall::InsertOne {
            collection: collection.to_string(),
        });
        self.check(StoreOp::InsertOne, collection)?;

        let mut collections = lock(&self.collections);
        let target = collections.entry(collection.to_string()).or_default();
        if let Some(id) = record.id() {
            if target.iter().any(|r| r.id().as_deref() == Some(id.as_str())) {
                return Err(StoreError::Rejected {
                    collection: collection.to_string(),
                    reason: format!("duplicate id {}", id),
                });
            }
        }
        target.push(record.clone());
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> StoreResult<bool> {
        self.ping().await?;
        Ok(lock(&self.collections).contains_key(collection))
    }
}

/// 内存对象存储
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeSet<(String, String)>>,
    removed: Mutex<Vec<(String, String)>>,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str) {
        lock(&self.objects).insert((bucket.to_string(), key.to_string()));
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        lock(&self.objects).contains(&(bucket.to_string(), key.to_string()))
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// 已成功删除的 (bucket, key)
    pub fn removed(&self) -> Vec<(String, String)> {
        lock(&self.removed).clone()
    }

    pub fn fail_on_key(&self, key: &str) {
        lock(&self.failing_keys).insert(key.to_string());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        if lock(&self.failing_keys).contains(key) {
            return Err(StoreError::Other(format!("injected failure for {}", key)));
        }
        let removed = lock(&self.objects).remove(&(bucket.to_string(), key.to_string()));
        if !removed {
            return Err(StoreError::NotFound(format!("{}/{}", bucket, key)));
        }
        lock(&self.removed).push((bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: &str) -> Record {
        Record::from_value(json!({ "id": id })).unwrap()
    }

    #[tokio::test]
    async fn test_insert_batch_rejects_duplicate_ids() {
        let store = MemoryStore::new().with_collection("posts", vec![rec("a")]);

        let result = store.insert_batch("posts", &[rec("b"), rec("a")]).await;
        assert!(matches!(result, Err(StoreError::Rejected { .. })));
        // 整批拒绝，不写入部分数据
        assert_eq!(store.contents("posts").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_and_call_log() {
        let store = MemoryStore::new().with_collection("posts", vec![rec("a")]);
        store.fail_on(StoreOp::DeleteAll, "posts");

        assert!(store.delete_all("posts").await.is_err());
        assert_eq!(store.contents("posts").unwrap().len(), 1);
        assert_eq!(
            store.calls(),
            vec![StoreCall::DeleteAll {
                collection: "posts".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_offline_store_is_unreachable() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let err = store.ping().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_blob_remove_missing_object() {
        let blobs = MemoryBlobStore::new();
        blobs.put("media", "a.png");
        assert!(blobs.remove_object("media", "a.png").await.is_ok());
        assert!(matches!(
            blobs.remove_object("media", "a.png").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(blobs.removed().len(), 1);
    }
}
