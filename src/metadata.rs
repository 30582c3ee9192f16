//! Three-tier image metadata lookup (spec.md §4.9 "MetadataFetcher"):
//! an in-process LRU (L1), the persistent KV cache (L2, TTL-bound), and
//! a decode-header probe against the origin bytes (L3). Concurrent
//! lookups for the same key are coalesced so a cache stampede on a
//! popular image only triggers one L3 probe.

use crate::error::{AppError, ErrorKind};
use crate::options::{Gravity, TransformOptions};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// How the dimensions in an `ImageMetadata` were obtained (spec.md §4.9:
/// "confidence is `low` when dimensions were inferred from headers or
/// byte-size heuristics"). A full decode of the image data yields exact
/// pixel dimensions and is always `High`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub confidence: Confidence,
    pub source: String,
}

impl ImageMetadata {
    fn format_name(fmt: image::ImageFormat) -> &'static str {
        match fmt {
            image::ImageFormat::Jpeg => "jpeg",
            image::ImageFormat::Png => "png",
            image::ImageFormat::WebP => "webp",
            image::ImageFormat::Avif => "avif",
            image::ImageFormat::Gif => "gif",
            _ => "unknown",
        }
    }
}

/// What's actually stored in the sled L2 tree: the metadata plus the
/// insertion time it needs to expire against (spec.md §4.9 "persistent
/// KV cache (L2, TTL bound)").
#[derive(Serialize, Deserialize)]
struct L2Record {
    meta: ImageMetadata,
    inserted_at_secs: u64,
}

type Coalesced = Shared<BoxFuture<'static, Option<ImageMetadata>>>;

/// Process-local metadata cache plus request coalescing (spec.md §4.9):
/// `lru` backs L1, a dedicated `sled` tree backs L2 (the same crate the
/// persistent image cache uses, opened at a separate path so metadata
/// churn never evicts transformed bytes), and L3 is the decode-header
/// probe in `probe_l3`.
pub struct MetadataFetcher {
    l1: Mutex<LruCache<String, ImageMetadata>>,
    l2: sled::Db,
    l2_ttl: Duration,
    inflight: Mutex<HashMap<String, Coalesced>>,
}

impl MetadataFetcher {
    pub fn open(l1_capacity: usize, l2_ttl: Duration, l2_path: impl AsRef<std::path::Path>) -> Result<Self, AppError> {
        let l2 = sled::open(l2_path).map_err(|e| AppError::new(ErrorKind::CacheUnavailable, e.to_string()))?;
        Ok(Self {
            l1: Mutex::new(LruCache::new(NonZeroUsize::new(l1_capacity.max(1)).unwrap())),
            l2,
            l2_ttl,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Looks up metadata for `key`, probing `bytes` via L3 (header-only
    /// decode) on a full miss. Concurrent callers with the same key
    /// share the single in-flight L3 probe.
    pub async fn get_or_probe(self: &Arc<Self>, key: &str, bytes: Arc<Vec<u8>>) -> Option<ImageMetadata> {
        if let Some(v) = self.l1.lock().get(key).cloned() {
            return Some(v);
        }

        if let Some(v) = self.l2_lookup(key) {
            self.l1.lock().put(key.to_string(), v.clone());
            return Some(v);
        }

        let existing = self.inflight.lock().get(key).cloned();
        let fut = if let Some(fut) = existing {
            fut
        } else {
            let this = Arc::clone(self);
            let key_owned = key.to_string();
            let shared: Coalesced = async move { this.probe_l3(&key_owned, bytes).await }.boxed().shared();
            self.inflight.lock().insert(key.to_string(), shared.clone());
            shared
        };

        let result = fut.await;
        self.inflight.lock().remove(key);
        result
    }

    /// Degrades to a miss on any sled error rather than surfacing it
    /// (spec.md §5, same posture as the persistent image cache).
    fn l2_lookup(&self, key: &str) -> Option<ImageMetadata> {
        let bytes = self.l2.get(key.as_bytes()).ok().flatten()?;
        let record: L2Record = serde_json::from_slice(&bytes).ok()?;
        let now = crate::cache::kv::now_secs();
        if now.saturating_sub(record.inserted_at_secs) > self.l2_ttl.as_secs() {
            let _ = self.l2.remove(key.as_bytes());
            return None;
        }
        Some(record.meta)
    }

    fn l2_store(&self, key: &str, meta: &ImageMetadata) {
        let record = L2Record { meta: meta.clone(), inserted_at_secs: crate::cache::kv::now_secs() };
        if let Ok(bytes) = serde_json::to_vec(&record) {
            let _ = self.l2.insert(key.as_bytes(), bytes);
        }
    }

    async fn probe_l3(&self, key: &str, bytes: Arc<Vec<u8>>) -> Option<ImageMetadata> {
        let decoded = tokio::task::spawn_blocking(move || {
            let fmt = image::guess_format(&bytes).ok()?;
            let img = image::load_from_memory_with_format(&bytes, fmt).ok()?;
            use image::GenericImageView;
            let (w, h) = img.dimensions();
            Some(ImageMetadata {
                width: w,
                height: h,
                format: ImageMetadata::format_name(fmt).to_string(),
                confidence: Confidence::High,
                source: "l3-decode".to_string(),
            })
        })
        .await
        .ok()
        .flatten();

        if let Some(meta) = &decoded {
            self.l1.lock().put(key.to_string(), meta.clone());
            self.l2_store(key, meta);
        }
        decoded
    }
}

/// Fills in whatever `width`/`height`/`gravity` smart mode left
/// unresolved, now that the natural dimensions of the source image are
/// known (spec.md §4.4 "smart" option, §4.9). A no-op when `smart` was
/// never requested or the caller already pinned both dimensions.
pub fn resolve_smart(options: &mut TransformOptions, meta: ImageMetadata) {
    if !options.smart.smart {
        return;
    }

    if options.gravity.is_none() {
        if let Some(focal) = &options.smart.focal {
            if let Ok(g) = Gravity::from_str(focal) {
                options.gravity = Some(g);
            }
        }
    }

    let aspect_ratio = options.smart.aspect.as_deref().and_then(parse_aspect_ratio);

    match (options.width, options.height, aspect_ratio) {
        (Some(w), None, Some(ratio)) => options.height = Some((w as f64 / ratio).round().max(1.0) as u32),
        (None, Some(h), Some(ratio)) => options.width = Some((h as f64 * ratio).round().max(1.0) as u32),
        (None, None, Some(ratio)) => {
            let w = meta.width;
            options.width = Some(w);
            options.height = Some((w as f64 / ratio).round().max(1.0) as u32);
        }
        (None, None, None) => {
            options.width = Some(meta.width);
            options.height = Some(meta.height);
        }
        _ => {}
    }
}

/// Parses a `"16:9"`-style aspect string into a width/height ratio.
fn parse_aspect_ratio(s: &str) -> Option<f64> {
    let (w, h) = s.split_once(':')?;
    let w: f64 = w.trim().parse().ok()?;
    let h: f64 = h.trim().parse().ok()?;
    if w <= 0.0 || h <= 0.0 {
        return None;
    }
    Some(w / h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::NamedGravity;

    fn jpeg_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    fn temp_fetcher() -> Arc<MetadataFetcher> {
        let mut p = std::env::temp_dir();
        p.push(format!("imagekit-metadata-test-{}", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()));
        Arc::new(MetadataFetcher::open(10, Duration::from_secs(60), p).unwrap())
    }

    #[tokio::test]
    async fn probes_and_then_hits_l1_on_repeat_lookup() {
        let fetcher = temp_fetcher();
        let bytes = Arc::new(jpeg_bytes());
        let first = fetcher.get_or_probe("k1", bytes.clone()).await.unwrap();
        assert_eq!(first.width, 4);
        assert_eq!(first.height, 4);

        let second = fetcher.get_or_probe("k1", Arc::new(Vec::new())).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn concurrent_lookups_for_same_key_coalesce() {
        let fetcher = temp_fetcher();
        let bytes = Arc::new(jpeg_bytes());
        let f1 = fetcher.get_or_probe("same-key", bytes.clone());
        let f2 = fetcher.get_or_probe("same-key", bytes.clone());
        let (a, b) = tokio::join!(f1, f2);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[tokio::test]
    async fn unusable_bytes_yield_none_without_panicking() {
        let fetcher = temp_fetcher();
        let result = fetcher.get_or_probe("bad-key", Arc::new(vec![0u8; 4])).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn l2_survives_an_l1_eviction() {
        let mut p = std::env::temp_dir();
        p.push(format!("imagekit-metadata-test-l2-{}", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()));
        // l1 capacity of 1 forces an immediate eviction on the second key.
        let fetcher = Arc::new(MetadataFetcher::open(1, Duration::from_secs(60), p).unwrap());
        let bytes = Arc::new(jpeg_bytes());
        let first = fetcher.get_or_probe("k1", bytes.clone()).await.unwrap();
        fetcher.get_or_probe("k2", bytes.clone()).await.unwrap(); // evicts k1 from l1
        assert!(fetcher.l1.lock().peek("k1").is_none());
        let refetched = fetcher.get_or_probe("k1", Arc::new(Vec::new())).await.unwrap();
        assert_eq!(refetched, first);
    }

    fn meta() -> ImageMetadata {
        ImageMetadata {
            width: 1200,
            height: 800,
            format: "jpeg".to_string(),
            confidence: Confidence::High,
            source: "l3-decode".to_string(),
        }
    }

    #[test]
    fn non_smart_options_are_left_untouched() {
        let mut options = TransformOptions::default();
        resolve_smart(&mut options, meta());
        assert!(options.width.is_none());
        assert!(options.height.is_none());
    }

    #[test]
    fn smart_with_no_dimensions_falls_back_to_natural_size() {
        let mut options = TransformOptions::default();
        options.smart.smart = true;
        resolve_smart(&mut options, meta());
        assert_eq!(options.width, Some(1200));
        assert_eq!(options.height, Some(800));
    }

    #[test]
    fn smart_with_width_and_aspect_derives_height() {
        let mut options = TransformOptions::default();
        options.smart.smart = true;
        options.smart.aspect = Some("16:9".into());
        options.width = Some(1600);
        resolve_smart(&mut options, meta());
        assert_eq!(options.height, Some(900));
    }

    #[test]
    fn smart_with_height_and_aspect_derives_width() {
        let mut options = TransformOptions::default();
        options.smart.smart = true;
        options.smart.aspect = Some("16:9".into());
        options.height = Some(900);
        resolve_smart(&mut options, meta());
        assert_eq!(options.width, Some(1600));
    }

    #[test]
    fn smart_leaves_explicit_dimensions_alone_without_aspect() {
        let mut options = TransformOptions::default();
        options.smart.smart = true;
        options.width = Some(640);
        options.height = Some(480);
        resolve_smart(&mut options, meta());
        assert_eq!(options.width, Some(640));
        assert_eq!(options.height, Some(480));
    }

    #[test]
    fn focal_point_resolves_to_gravity_when_unset() {
        let mut options = TransformOptions::default();
        options.smart.smart = true;
        options.smart.focal = Some("north".into());
        resolve_smart(&mut options, meta());
        assert!(matches!(options.gravity, Some(Gravity::Named(NamedGravity::North))));
    }

    #[test]
    fn invalid_aspect_string_is_ignored() {
        assert_eq!(parse_aspect_ratio("garbage"), None);
        assert_eq!(parse_aspect_ratio("0:9"), None);
        assert_eq!(parse_aspect_ratio("16:9").unwrap(), 16.0 / 9.0);
    }
}
