//! 媒体对象定位
//!
//! 媒体迁移记录里保存的是对象的公开 URL，删除对象需要还原出存储键：
//!
//! ```text
//! https://<host>/storage/v1/object/public/<bucket>/images/a%20b.png  ->  images/a b.png
//! ```

use std::collections::BTreeSet;

use url::Url;

use crate::store::Record;

/// 媒体记录中可能保存对象 URL 的字段
pub const OBJECT_URL_FIELDS: &[&str] = &["storage_url", "new_url", "public_url"];

const ACCESS_MODES: &[&str] = &["public", "sign", "authenticated"];

/// 从对象 URL（或裸存储键）还原存储键
///
/// 优先匹配 `/object/<public|sign|authenticated>/<bucket>/<key...>`，
/// 否则取路径中第一个等于 `bucket` 的段之后的部分。
/// 非 URL 的输入视为裸存储键，去掉前导 `/` 与可选的 `<bucket>/` 前缀。
pub fn object_key_from_url(bucket: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let Ok(url) = Url::parse(raw) else {
        return raw_key(bucket, raw);
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let segments: Vec<String> = url
        .path_segments()?
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
        .collect();

    let start = segments
        .windows(3)
        .position(|w| w[0] == "object" && ACCESS_MODES.contains(&w[1].as_str()) && w[2] == bucket)
        .map(|i| i + 3)
        .or_else(|| segments.iter().position(|s| s == bucket).map(|i| i + 1))?;

    let key = segments[start..]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/");
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

fn raw_key(bucket: &str, raw: &str) -> Option<String> {
    let trimmed = raw.trim_start_matches('/');
    let key = trimmed
        .strip_prefix(bucket)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(trimmed);
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// 收集记录中的对象 URL（去重，保持稳定顺序）
pub fn collect_object_urls<'a>(records: impl IntoIterator<Item = &'a Record>) -> BTreeSet<String> {
    records
        .into_iter()
        .flat_map(|r| OBJECT_URL_FIELDS.iter().filter_map(move |f| r.get_str(f)))
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// 收集记录引用的存储键
///
/// 同一对象可能以不同 URL 形式出现（查询参数、public / sign 路径、不同字段），
/// 比较对象归属时必须按存储键而不是 URL 字符串。
pub fn collect_object_keys<'a>(
    bucket: &str,
    records: impl IntoIterator<Item = &'a Record>,
) -> BTreeSet<String> {
    collect_object_urls(records)
        .iter()
        .filter_map(|url| object_key_from_url(bucket, url))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_public_object_url() {
        let key = object_key_from_url(
            "media",
            "https://xyz.example.co/storage/v1/object/public/media/images/2024/a%20b.png",
        );
        assert_eq!(key.as_deref(), Some("images/2024/a b.png"));
    }

    #[test]
    fn test_signed_url_with_query() {
        let key = object_key_from_url(
            "media",
            "https://cdn.example.com/storage/v1/object/sign/media/docs/x.pdf?token=abc",
        );
        assert_eq!(key.as_deref(), Some("docs/x.pdf"));
    }

    #[test]
    fn test_bucket_segment_fallback() {
        let key = object_key_from_url("media", "https://cdn.example.com/media/cover.jpg");
        assert_eq!(key.as_deref(), Some("cover.jpg"));
        assert_eq!(object_key_from_url("media", "https://cdn.example.com/other/x.jpg"), None);
    }

    #[test]
    fn test_raw_keys() {
        assert_eq!(object_key_from_url("media", "images/a.png").as_deref(), Some("images/a.png"));
        assert_eq!(object_key_from_url("media", "/media/images/a.png").as_deref(), Some("images/a.png"));
        assert_eq!(object_key_from_url("media", "  "), None);
    }

    #[test]
    fn test_collect_object_urls() {
        let records = vec![
            Record::from_value(json!({"id": "1", "storage_url": "https://h/media/a.png"})).unwrap(),
            Record::from_value(json!({"id": "2", "new_url": "https://h/media/b.png", "public_url": ""})).unwrap(),
            Record::from_value(json!({"id": "3", "storage_url": "https://h/media/a.png"})).unwrap(),
        ];
        let urls = collect_object_urls(&records);
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_collect_object_keys_merges_url_forms() {
        let records = vec![
            Record::from_value(json!({
                "id": "1",
                "storage_url": "https://h/storage/v1/object/public/media/a.png",
                "new_url": "https://h/storage/v1/object/public/media/a.png?v=2",
            }))
            .unwrap(),
            Record::from_value(json!({
                "id": "2",
                "public_url": "https://h/storage/v1/object/sign/media/a.png?token=t",
            }))
            .unwrap(),
        ];
        let keys = collect_object_keys("media", &records);
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["a.png".to_string()]);
    }
}
