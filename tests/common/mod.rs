//! 集成测试共用的夹具

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use content_migrator_lib::collections;
use content_migrator_lib::{MemoryStore, MigrationConfig, Record};

pub fn rec(id: &str) -> Record {
    Record::from_value(json!({ "id": id, "title": format!("title {}", id), "draft": false }))
        .expect("object literal")
}

/// `<prefix>-0 .. <prefix>-(n-1)`
pub fn records(prefix: &str, n: usize) -> Vec<Record> {
    (0..n).map(|i| rec(&format!("{}-{}", prefix, i))).collect()
}

/// 每个被追踪集合预置 3 条记录
pub fn seeded_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for name in collections::tracked_names() {
        store.seed(name, records(name, 3));
    }
    Arc::new(store)
}

/// 按 id 排序后的集合内容（集合相等比较用）
pub fn sorted(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by_key(|r| r.id());
    records
}

pub fn live(store: &MemoryStore, name: &str) -> Vec<Record> {
    sorted(store.contents(name).unwrap_or_default())
}

/// 指向临时目录的配置，源语料包含两个 markdown 文件
pub fn test_config(root: &Path) -> MigrationConfig {
    let content = root.join("content/posts");
    std::fs::create_dir_all(&content).expect("create content dir");
    std::fs::write(content.join("hello.md"), "# Hello").expect("write post");
    std::fs::write(content.join("world.md"), "# World").expect("write post");

    MigrationConfig {
        store_url: Some("memory://test".into()),
        store_key: Some("test-key".into()),
        content_dir: root.join("content"),
        media_dir: Some(root.join("static")),
        backup_dir: root.join("backups"),
        reports_dir: root.join("reports"),
        max_phase_attempts: 2,
        retry_min_delay_ms: 1,
        ..MigrationConfig::default()
    }
}
