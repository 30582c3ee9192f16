//! Request orchestration (spec.md §4.1 "RequestOrchestrator"): the
//! single pipeline a request to `/img/*path` runs through — resolve
//! options, score for bypass, check cache, detect the client, fetch
//! from storage, transform, and cache the result in the background.

use crate::cache::CacheCore;
use crate::client::{self, DetectorCache};
use crate::config::{AppConfig, Env};
use crate::error::{AppError, ErrorKind};
use crate::metadata::MetadataFetcher;
use crate::metrics::Metrics;
use crate::options::TransformOptions;
use crate::resolver;
use crate::storage::StorageFetcher;
use crate::transform::{LocalImageTransform, TransformPrimitive};
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Shared process state handed to every request (spec.md §4.1).
pub struct AppState {
    pub config: AppConfig,
    pub env: Env,
    pub cache: CacheCore,
    pub storage: StorageFetcher,
    pub transform: Box<dyn TransformPrimitive>,
    pub detector_cache: DetectorCache,
    pub metadata: Arc<MetadataFetcher>,
    pub metrics: Metrics,
    /// Deferred cache writes, drained by a background task so the
    /// response is not held up by a KV write (spec.md §4.1 step 9).
    pub after_response: AsyncMutex<Vec<AfterResponseWrite>>,
}

pub struct AfterResponseWrite {
    pub path: String,
    pub key: String,
    pub bytes: Vec<u8>,
    pub options: TransformOptions,
    pub content_type: String,
}

impl AppState {
    pub fn new(config: AppConfig, env: Env) -> Result<Self, AppError> {
        let cache = CacheCore::new(&config)?;
        let storage = StorageFetcher::new(32 * 1024 * 1024);
        let detector_cache = DetectorCache::new(config.detection.lru_max_size, std::time::Duration::from_secs(config.detection.lru_ttl_secs));
        let metadata = Arc::new(MetadataFetcher::open(1000, std::time::Duration::from_secs(3600), &config.metadata_kv_path)?);
        Ok(Self {
            config,
            env,
            cache,
            storage,
            transform: Box::new(LocalImageTransform),
            detector_cache,
            metadata,
            metrics: Metrics::new(),
            after_response: AsyncMutex::new(Vec::new()),
        })
    }
}

fn query_map(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `GET /*path?...` (spec.md §4.1, §6). Runs the full ten-step
/// pipeline: resolve -> bypass check -> cache lookup -> detect -> merge
/// -> fetch -> transform -> respond -> schedule cache write.
pub async fn serve(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = query.unwrap_or_default();
    let path = format!("/{}", path.trim_start_matches('/'));
    match serve_inner(&state, &path, &query, &headers).await {
        Ok(resp) => resp,
        Err(e) => {
            state.metrics.record_request(e.http_status.as_u16());
            e.into_response()
        }
    }
}

async fn serve_inner(state: &Arc<AppState>, path: &str, query: &str, headers: &HeaderMap) -> Result<Response, AppError> {
    let start = std::time::Instant::now();
    let pairs = query_map(query);
    let options = resolver::resolve(path, query, &state.config)
        .map_err(|e| AppError::new(ErrorKind::InvalidRequest, e.to_string()))?;

    let query_keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
    let bypass = state.cache.should_bypass(&query_keys, headers, &options);

    let client_info = client::detect(headers, &state.config.detection, &state.detector_cache);
    let mut merged = client::optimize(&client_info, options);

    let fingerprint = state.cache.fingerprint(path, &merged);

    if !bypass {
        if let Some(entry) = state.cache.get(&fingerprint).await {
            state.metrics.record_cache_status("HIT");
            state.metrics.record_request(200);
            let age = cache_age_secs(entry.meta.timestamp);
            let debug = DebugContext {
                storage_source: "cache",
                original_size: entry.meta.original_size,
                width: entry.meta.width,
                height: entry.meta.height,
                elapsed: start.elapsed(),
                client: &client_info,
            };
            return Ok(build_response(entry.bytes, &entry.meta.content_type, "HIT", &entry.meta.tags, entry.meta.ttl, age, state.config.debug_headers_enabled, &merged, &debug));
        }
    }
    state.metrics.record_cache_status(if bypass { "BYPASS" } else { "MISS" });

    let host = headers.get("host").and_then(|v| v.to_str().ok()).unwrap_or_default();
    let fetched = state.storage.fetch(host, path, &state.config, &state.env).await?;
    state.metrics.record_origin_fetch(&fetched.origin_id, "success");

    // Smart mode can only resolve its final width/height/gravity once
    // the source image's natural dimensions are known, which means
    // waiting for the bytes to land. The fingerprint taken above
    // (and any HIT against it) covers requests that already pinned
    // concrete dimensions. A smart request that still needs resolving
    // falls through to here, gets its dimensions filled in, and is
    // checked against the cache a second time under the now-concrete
    // fingerprint before paying for a transform.
    let smart = merged.smart.smart;
    let fingerprint = if smart {
        let meta_key = format!("{}:{}", fetched.origin_id, path);
        if let Some(meta) = state.metadata.get_or_probe(&meta_key, Arc::new(fetched.bytes.clone())).await {
            crate::metadata::resolve_smart(&mut merged, meta);
        }
        let resolved = state.cache.fingerprint(path, &merged);
        if !bypass && resolved != fingerprint {
            if let Some(entry) = state.cache.get(&resolved).await {
                state.metrics.record_cache_status("HIT");
                state.metrics.record_request(200);
                let age = cache_age_secs(entry.meta.timestamp);
                let debug = DebugContext {
                    storage_source: "cache",
                    original_size: entry.meta.original_size,
                    width: entry.meta.width,
                    height: entry.meta.height,
                    elapsed: start.elapsed(),
                    client: &client_info,
                };
                return Ok(build_response(entry.bytes, &entry.meta.content_type, "HIT", &entry.meta.tags, entry.meta.ttl, age, state.config.debug_headers_enabled, &merged, &debug));
            }
        }
        resolved
    } else {
        fingerprint
    };

    let output = state.transform.transform(&fetched.bytes, &merged).await?;

    let tags = crate::cache::tags::generate_tags(path, &merged, state.cache.tag_prefix());
    let debug = DebugContext {
        storage_source: &fetched.origin_id,
        original_size: fetched.bytes.len(),
        width: Some(output.width),
        height: Some(output.height),
        elapsed: start.elapsed(),
        client: &client_info,
    };
    let response = build_response(
        output.bytes.clone(),
        output.content_type,
        if bypass { "BYPASS" } else { "MISS" },
        &tags,
        merged.ttl.unwrap_or(state.config.default_ttl_secs),
        0,
        state.config.debug_headers_enabled,
        &merged,
        &debug,
    );

    if !bypass {
        let mut queue = state.after_response.lock().await;
        queue.push(AfterResponseWrite {
            path: path.to_string(),
            key: fingerprint,
            bytes: output.bytes,
            options: merged,
            content_type: output.content_type.to_string(),
        });
    }

    state.metrics.record_request(200);
    Ok(response)
}

/// `now - timestamp` (spec.md §4.6.5 "Age = now - timestamp"), clamped to
/// non-negative in case of clock skew between the writer and this read.
fn cache_age_secs(timestamp: u64) -> u32 {
    crate::cache::kv::now_secs().saturating_sub(timestamp).min(u32::MAX as u64) as u32
}

/// Response provenance needed only for the debug header family
/// (spec.md §6), kept separate from the cache headers proper.
struct DebugContext<'a> {
    storage_source: &'a str,
    original_size: usize,
    width: Option<u32>,
    height: Option<u32>,
    elapsed: std::time::Duration,
    client: &'a client::ClientInfo,
}

fn build_response(
    bytes: Vec<u8>,
    content_type: &str,
    cache_status: &str,
    tags: &[String],
    ttl: u32,
    age: u32,
    debug_headers: bool,
    options: &TransformOptions,
    debug: &DebugContext,
) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(content_type) {
        headers.insert(axum::http::header::CONTENT_TYPE, v);
    }
    crate::cache::edge::apply_cache_headers(&mut headers, ttl, age, &crate::cache::tags::tags_header_value(tags), cache_status);

    if debug_headers {
        apply_debug_headers(&mut headers, options, content_type, debug);
    }

    (StatusCode::OK, headers, Bytes::from(bytes)).into_response()
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl std::fmt::Display) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}

/// `X-Storage-Source`, `X-Transform-Options`, `X-Image-*`, `X-Performance`,
/// `X-Original-*`, `X-Client-*`, `X-Device-Type` (spec.md §6, debug-only
/// header family).
fn apply_debug_headers(headers: &mut HeaderMap, options: &TransformOptions, content_type: &str, debug: &DebugContext) {
    insert_header(headers, "x-storage-source", debug.storage_source);
    insert_header(headers, "x-transform-options", transform_options_summary(options));
    insert_header(headers, "x-performance", format!("total;dur={}", debug.elapsed.as_millis()));
    insert_header(headers, "x-original-size", debug.original_size);
    insert_header(headers, "x-device-type", format!("{:?}", debug.client.device_type).to_lowercase());
    insert_header(headers, "x-client-network-quality", format!("{:?}", debug.client.network_quality).to_lowercase());
    insert_header(headers, "x-client-device-class", format!("{:?}", debug.client.device_class).to_lowercase());

    if let Some(w) = debug.width.or(options.width) {
        insert_header(headers, "x-image-width", w);
        // kept for backward-compatible debug tooling that reads the
        // short-form width/format headers.
        insert_header(headers, "x-debug-width", w);
    }
    if let Some(h) = debug.height.or(options.height) {
        insert_header(headers, "x-image-height", h);
    }
    insert_header(headers, "x-image-format", content_type);
    if let Some(fmt) = options.format {
        insert_header(headers, "x-debug-format", fmt);
    }
    if let Some(q) = options.quality {
        insert_header(headers, "x-image-quality", q);
    }
}

/// A compact `key=value;key=value` summary of the non-default fields a
/// client actually set or the detector adapted, for `X-Transform-Options`.
fn transform_options_summary(options: &TransformOptions) -> String {
    let mut parts = Vec::new();
    if let Some(w) = options.width {
        parts.push(format!("width={w}"));
    }
    if let Some(h) = options.height {
        parts.push(format!("height={h}"));
    }
    if let Some(fit) = options.fit {
        parts.push(format!("fit={fit}"));
    }
    if let Some(q) = options.quality {
        parts.push(format!("quality={q}"));
    }
    if let Some(fmt) = options.format {
        parts.push(format!("format={fmt}"));
    }
    if options.smart.smart {
        parts.push("smart=true".to_string());
    }
    if let Some(d) = &options.derivative_name {
        parts.push(format!("derivative={d}"));
    }
    parts.join(";")
}

/// Drains queued cache writes. Intended to run on a spawned background
/// task so `serve` never blocks the client response on a KV write
/// (spec.md §4.1 step 9, §4.7 "writes never fail the request").
pub async fn drain_after_response(state: Arc<AppState>) {
    loop {
        let writes: Vec<AfterResponseWrite> = {
            let mut queue = state.after_response.lock().await;
            std::mem::take(&mut *queue)
        };
        for write in writes {
            state
                .cache
                .put(&write.path, &write.key, &write.bytes, &write.options, &write.content_type, 200, write.options.ttl)
                .await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
