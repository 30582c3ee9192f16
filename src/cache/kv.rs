use crate::error::{AppError, ErrorKind, Result};
use crate::options::TransformOptions;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::time::{SystemTime, UNIX_EPOCH};

/// A lightweight, serializable snapshot of the options that produced an
/// entry, kept for debugging and for the `/debug/kv-config` endpoint
/// (spec.md §3 "CacheEntry" — "transformOptions snapshot").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OptionsSnapshot {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub quality: Option<u8>,
    pub fit: Option<String>,
}

impl From<&TransformOptions> for OptionsSnapshot {
    fn from(o: &TransformOptions) -> Self {
        Self {
            width: o.width,
            height: o.height,
            format: o.format.map(|f| f.to_string()),
            quality: o.quality,
            fit: o.fit.map(|f| f.to_string()),
        }
    }
}

/// Persistent-layer metadata stored alongside every value (spec.md §3
/// "CacheEntry"). Every entry has a timestamp and a ttl; missing/invalid
/// metadata is served with safe defaults, never rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub timestamp: u64,
    pub ttl: u32,
    pub content_type: String,
    pub size: usize,
    pub original_size: usize,
    pub compression_ratio: f64,
    pub storage_type: String,
    pub tags: Vec<String>,
    pub options: OptionsSnapshot,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Default for CacheEntryMeta {
    fn default() -> Self {
        Self {
            timestamp: now_secs(),
            ttl: 60,
            content_type: "application/octet-stream".into(),
            size: 0,
            original_size: 0,
            compression_ratio: 1.0,
            storage_type: "unknown".into(),
            tags: Vec::new(),
            options: OptionsSnapshot::default(),
            width: None,
            height: None,
        }
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Sled-backed persistent key-value layer (spec.md §4.6.1 "Layer B").
/// Keys are `<prefix>:<fingerprint>`; the tag secondary index lives
/// under `<prefix>:tag:<tag>` as an append-then-trim list of
/// fingerprints.
pub struct PersistentCache {
    db: Db,
    prefix: String,
}

impl PersistentCache {
    pub fn open(path: impl AsRef<std::path::Path>, prefix: impl Into<String>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| AppError::new(ErrorKind::CacheUnavailable, e.to_string()))?;
        Ok(Self { db, prefix: prefix.into() })
    }

    fn data_key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.prefix, fingerprint)
    }

    fn meta_key(&self, fingerprint: &str) -> String {
        format!("{}:meta:{}", self.prefix, fingerprint)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.prefix, tag)
    }

    pub fn get(&self, fingerprint: &str) -> Result<Option<(Vec<u8>, CacheEntryMeta)>> {
        let data = self
            .db
            .get(self.data_key(fingerprint).as_bytes())
            .map_err(|e| AppError::new(ErrorKind::CacheReadFailed, e.to_string()))?;
        let Some(data) = data else { return Ok(None) };

        let meta = self
            .db
            .get(self.meta_key(fingerprint).as_bytes())
            .map_err(|e| AppError::new(ErrorKind::CacheReadFailed, e.to_string()))?
            .and_then(|bytes| serde_json::from_slice::<CacheEntryMeta>(&bytes).ok())
            .unwrap_or_else(|| {
                tracing::warn!(fingerprint, "cache entry missing or invalid metadata, using safe defaults");
                CacheEntryMeta::default()
            });

        Ok(Some((data.to_vec(), meta)))
    }

    pub fn put(&self, fingerprint: &str, data: &[u8], meta: &CacheEntryMeta) -> Result<()> {
        self.db
            .insert(self.data_key(fingerprint).as_bytes(), data)
            .map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))?;
        let meta_bytes = serde_json::to_vec(meta)?;
        self.db
            .insert(self.meta_key(fingerprint).as_bytes(), meta_bytes)
            .map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))?;

        for tag in &meta.tags {
            self.index_tag(tag, fingerprint)?;
        }
        Ok(())
    }

    fn index_tag(&self, tag: &str, fingerprint: &str) -> Result<()> {
        let key = self.tag_key(tag);
        let mut list: Vec<String> = self
            .db
            .get(key.as_bytes())
            .map_err(|e| AppError::new(ErrorKind::TagGenerationFailed, e.to_string()))?
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();
        if !list.contains(&fingerprint.to_string()) {
            list.push(fingerprint.to_string());
        }
        let bytes = serde_json::to_vec(&list)?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| AppError::new(ErrorKind::TagGenerationFailed, e.to_string()))?;
        Ok(())
    }

    fn remove_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.db
            .remove(self.data_key(fingerprint).as_bytes())
            .map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))?;
        self.db
            .remove(self.meta_key(fingerprint).as_bytes())
            .map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))?;
        Ok(())
    }

    /// `purgeByTag(tag) -> count` (spec.md §4.6.7). Tag index entries are
    /// best-effort; a stale reference that no longer has a matching data
    /// key is skipped, not treated as an error (spec.md §5).
    pub fn purge_by_tag(&self, tag: &str) -> Result<usize> {
        let key = self.tag_key(tag);
        let Some(bytes) = self.db.get(key.as_bytes()).map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))? else {
            return Ok(0);
        };
        let fingerprints: Vec<String> = serde_json::from_slice(&bytes).unwrap_or_default();
        let mut count = 0;
        for fp in &fingerprints {
            let existed = self.db.get(self.data_key(fp).as_bytes()).ok().flatten().is_some();
            if existed {
                self.remove_fingerprint(fp)?;
                count += 1;
            }
        }
        self.db
            .remove(key.as_bytes())
            .map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))?;
        Ok(count)
    }

    /// `purgeByPath(pattern) -> count`: list + filter over the meta
    /// keyspace, since paths are not individually indexed (spec.md
    /// §4.6.7).
    pub fn purge_by_path(&self, pattern: &regex::Regex) -> Result<usize> {
        let meta_prefix = format!("{}:meta:", self.prefix);
        let mut to_remove = Vec::new();
        for item in self.db.scan_prefix(meta_prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))?;
            let Ok(meta) = serde_json::from_slice::<CacheEntryMeta>(&value) else { continue };
            let fingerprint = String::from_utf8_lossy(&key)
                .strip_prefix(&meta_prefix)
                .unwrap_or_default()
                .to_string();
            if meta.tags.iter().any(|t| pattern.is_match(t)) {
                to_remove.push(fingerprint);
            }
        }
        let count = to_remove.len();
        for fp in to_remove {
            self.remove_fingerprint(&fp)?;
        }
        Ok(count)
    }

    pub fn tag_index_size(&self, tag: &str) -> usize {
        self.db
            .get(self.tag_key(tag).as_bytes())
            .ok()
            .flatten()
            .and_then(|b| serde_json::from_slice::<Vec<String>>(&b).ok())
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map(|_| ()).map_err(|e| AppError::new(ErrorKind::CacheWriteFailed, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> PersistentCache {
        let dir = tempdir();
        PersistentCache::open(dir, "t").unwrap()
    }

    fn tempdir() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("imagekit-kv-test-{}", now_secs_nanos()));
        p
    }

    fn now_secs_nanos() -> u128 {
        std::time::SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = temp_cache();
        let meta = CacheEntryMeta {
            tags: vec!["t-path-cat-jpg".into()],
            ..Default::default()
        };
        cache.put("fp1", b"hello", &meta).unwrap();
        let (data, got_meta) = cache.get("fp1").unwrap().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(got_meta.tags, meta.tags);
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let cache = temp_cache();
        assert!(cache.get("nope").unwrap().is_none());
    }

    #[test]
    fn purge_by_tag_removes_entries_and_reports_count() {
        let cache = temp_cache();
        let meta = CacheEntryMeta { tags: vec!["t-path-cat-jpg".into()], ..Default::default() };
        cache.put("fp1", b"a", &meta).unwrap();
        cache.put("fp2", b"b", &meta).unwrap();
        let count = cache.purge_by_tag("t-path-cat-jpg").unwrap();
        assert_eq!(count, 2);
        assert!(cache.get("fp1").unwrap().is_none());
        assert!(cache.get("fp2").unwrap().is_none());
    }

    #[test]
    fn purge_by_tag_tolerates_stale_index_entries() {
        let cache = temp_cache();
        let meta = CacheEntryMeta { tags: vec!["t-path-cat-jpg".into()], ..Default::default() };
        cache.put("fp1", b"a", &meta).unwrap();
        cache.remove_fingerprint("fp1").unwrap(); // data gone, tag index still points at it
        let count = cache.purge_by_tag("t-path-cat-jpg").unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn two_identical_puts_are_observationally_equivalent() {
        let cache = temp_cache();
        let meta = CacheEntryMeta::default();
        cache.put("fp1", b"same", &meta).unwrap();
        let (d1, _) = cache.get("fp1").unwrap().unwrap();
        cache.put("fp1", b"same", &meta).unwrap();
        let (d2, _) = cache.get("fp1").unwrap().unwrap();
        assert_eq!(d1, d2);
    }
}
