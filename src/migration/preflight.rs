//! 预检
//!
//! 任何写操作之前执行：远端连通性、源语料目录、待处理项计数。
//! 预检失败时不需要备份，也没有可回滚的内容。

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use walkdir::WalkDir;

use super::MigrationError;
use crate::config::MigrationConfig;
use crate::store::RemoteStore;

const CONTENT_EXTENSIONS: &[&str] = &["md", "markdown"];

const MEDIA_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "avif", "ico", "mp4", "webm", "mp3", "pdf",
];

/// 预检结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub content_files: usize,
    pub media_files: usize,
}

pub async fn run_preflight(
    store: &dyn RemoteStore,
    config: &MigrationConfig,
) -> Result<PreflightReport, MigrationError> {
    store.ping().await.map_err(|e| {
        MigrationError::Connectivity(format!("{} 不可达: {}", store.provider_name(), e))
    })?;

    if !config.content_dir.is_dir() {
        return Err(MigrationError::Configuration(format!(
            "源内容目录不存在: {}",
            config.content_dir.display()
        )));
    }

    let content_files = count_files(&config.content_dir, CONTENT_EXTENSIONS);
    let media_files = match config.media_dir.as_deref() {
        Some(dir) if dir.is_dir() => count_files(dir, MEDIA_EXTENSIONS),
        _ => 0,
    };

    info!(
        "[Preflight] 预检通过: {} 个内容文件, {} 个媒体文件",
        content_files, media_files
    );

    Ok(PreflightReport {
        content_files,
        media_files,
    })
}

fn count_files(root: &Path, extensions: &[&str]) -> usize {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .count()
}
