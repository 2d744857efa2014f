//! # Collection Registry (集合注册表)
//!
//! 迁移管线写入的所有远端集合，按正向依赖顺序登记。
//!
//! 后面的集合可能引用前面的集合（例如 `hugo_post_tags` 引用 `hugo_posts` 与 `hugo_tags`），
//! 因此全量回滚必须按**逆序**执行，避免启用外键约束的存储出现瞬时的引用完整性冲突。
//!
//! 审计日志集合 `migration_log` 不在此登记，永远不会被回滚。

use serde::{Deserialize, Serialize};

use crate::migration::PhaseName;

/// 审计日志集合
pub const MIGRATION_LOG_COLLECTION: &str = "migration_log";

/// 集合类别，决定其所属的回滚粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// 内容数据（文章、分类、标签及其关联）
    Content,
    /// 媒体迁移记录
    Media,
    /// 旧 URL → 新 URL 映射
    UrlMapping,
}

/// 被追踪（备份 / 可回滚）的集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackedCollection {
    pub name: &'static str,
    pub kind: CollectionKind,
    /// 正向管线中写入该集合的阶段
    pub phase: PhaseName,
}

/// 正向依赖顺序
const TRACKED_COLLECTIONS: &[TrackedCollection] = &[
    TrackedCollection {
        name: "hugo_categories",
        kind: CollectionKind::Content,
        phase: PhaseName::ContentMigration,
    },
    TrackedCollection {
        name: "hugo_tags",
        kind: CollectionKind::Content,
        phase: PhaseName::ContentMigration,
    },
    TrackedCollection {
        name: "hugo_posts",
        kind: CollectionKind::Content,
        phase: PhaseName::ContentMigration,
    },
    TrackedCollection {
        name: "hugo_post_categories",
        kind: CollectionKind::Content,
        phase: PhaseName::ContentMigration,
    },
    TrackedCollection {
        name: "hugo_post_tags",
        kind: CollectionKind::Content,
        phase: PhaseName::ContentMigration,
    },
    MEDIA_MIGRATIONS,
    URL_MAPPINGS,
];

const MEDIA_MIGRATIONS: TrackedCollection = TrackedCollection {
    name: "hugo_media_migrations",
    kind: CollectionKind::Media,
    phase: PhaseName::MediaMigration,
};

const URL_MAPPINGS: TrackedCollection = TrackedCollection {
    name: "hugo_url_mappings",
    kind: CollectionKind::UrlMapping,
    phase: PhaseName::UrlMappings,
};

/// 返回所有被追踪集合（正向依赖顺序）
pub fn all_ordered() -> &'static [TrackedCollection] {
    TRACKED_COLLECTIONS
}

/// 所有被追踪集合的名称（正向依赖顺序）
pub fn tracked_names() -> Vec<&'static str> {
    TRACKED_COLLECTIONS.iter().map(|c| c.name).collect()
}

/// 逆依赖顺序：正向管线最后写入的集合最先回滚
pub fn reverse_dependency_order() -> Vec<&'static TrackedCollection> {
    TRACKED_COLLECTIONS.iter().rev().collect()
}

/// 内容类集合（不含媒体迁移记录与 URL 映射），逆依赖顺序
pub fn content_collections() -> Vec<&'static TrackedCollection> {
    reverse_dependency_order()
        .into_iter()
        .filter(|c| c.kind == CollectionKind::Content)
        .collect()
}

pub fn media_collection() -> &'static TrackedCollection {
    &MEDIA_MIGRATIONS
}

pub fn url_mapping_collection() -> &'static TrackedCollection {
    &URL_MAPPINGS
}

pub fn find(name: &str) -> Option<&'static TrackedCollection> {
    TRACKED_COLLECTIONS.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_order_starts_with_last_written() {
        let reversed: Vec<&str> = reverse_dependency_order().iter().map(|c| c.name).collect();
        assert_eq!(reversed.first(), Some(&"hugo_url_mappings"));
        assert_eq!(reversed.last(), Some(&"hugo_categories"));
        assert_eq!(reversed.len(), all_ordered().len());
    }

    #[test]
    fn test_content_subset_excludes_media_and_urls() {
        let names: Vec<&str> = content_collections().iter().map(|c| c.name).collect();
        assert!(names.contains(&"hugo_posts"));
        assert!(!names.contains(&"hugo_media_migrations"));
        assert!(!names.contains(&"hugo_url_mappings"));
        // 关联表先于主表回滚
        let post_tags = names.iter().position(|n| *n == "hugo_post_tags").unwrap();
        let posts = names.iter().position(|n| *n == "hugo_posts").unwrap();
        assert!(post_tags < posts);
    }

    #[test]
    fn test_kind_lookups() {
        assert_eq!(media_collection().name, "hugo_media_migrations");
        assert_eq!(url_mapping_collection().name, "hugo_url_mappings");
        assert!(find(MIGRATION_LOG_COLLECTION).is_none());
    }

    #[test]
    fn test_single_registered_entry_per_non_content_kind() {
        for (kind, expected) in [
            (CollectionKind::Media, media_collection()),
            (CollectionKind::UrlMapping, url_mapping_collection()),
        ] {
            let registered: Vec<&TrackedCollection> =
                all_ordered().iter().filter(|c| c.kind == kind).collect();
            assert_eq!(registered, vec![expected], "{:?}", kind);
            assert_eq!(expected.kind, kind);
        }
    }

    #[test]
    fn test_phase_order_is_monotonic() {
        // 集合的正向顺序必须与阶段注册顺序一致
        let phases: Vec<usize> = all_ordered().iter().map(|c| c.phase.index()).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
    }
}
