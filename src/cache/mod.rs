pub mod bypass;
pub mod edge;
pub mod fingerprint;
pub mod kv;
pub mod tags;
pub mod ttl;

use crate::config::AppConfig;
use crate::error::{AppError, Result as AppResult};
use crate::options::TransformOptions;
use crate::resilience::{breaker::CircuitBreaker, fallback::FailureLog};
use axum::http::HeaderMap;
use kv::{CacheEntryMeta, OptionsSnapshot, PersistentCache};
use std::time::Duration;
use ttl::{AccessPatternTracker, TtlInputs};

/// Generate an ETag from a cache key.
pub fn etag_for_key(key: &str) -> String {
    format!("\"{}\"", key)
}

/// What a cache lookup decided, surfaced on the `X-Cache-Status` debug
/// header (spec.md §4.6.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Stale => "STALE",
        }
    }
}

pub struct CachedEntry {
    pub bytes: Vec<u8>,
    pub meta: CacheEntryMeta,
}

/// The two-layer cache core (spec.md §4.6): fingerprinting, tagging,
/// ttl computation, bypass scoring and the persistent KV layer, wired
/// through a circuit breaker so a degraded KV never takes the edge
/// down with it (spec.md §4.7.2).
pub struct CacheCore {
    persistent: Option<PersistentCache>,
    breaker: CircuitBreaker,
    failures: FailureLog,
    tracker: AccessPatternTracker,
    tag_prefix: String,
    bypass_threshold: u32,
    /// TTL inputs taken from the live `AppConfig` rather than rebuilt
    /// from scratch on every `put`, so a deployment's own tiers,
    /// path-ttl rules, and max-ttl actually govern cache writes.
    ttl_config: TtlConfig,
}

#[derive(Clone)]
struct TtlConfig {
    path_ttl_rules: Vec<crate::config::PathTtlRule>,
    tiers: Vec<crate::config::Tier>,
    max_ttl_secs: u32,
    default_ttl_secs: u32,
}

impl From<&AppConfig> for TtlConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            path_ttl_rules: config.path_ttl_rules.clone(),
            tiers: config.tiers.clone(),
            max_ttl_secs: config.max_ttl_secs,
            default_ttl_secs: config.default_ttl_secs,
        }
    }
}

impl CacheCore {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let persistent = if config.persistent_cache_enabled {
            Some(PersistentCache::open(&config.kv_path, "img")?)
        } else {
            None
        };
        Ok(Self {
            persistent,
            breaker: CircuitBreaker::new(config.breaker.clone()),
            failures: FailureLog::new(Duration::from_secs(300), 5),
            tracker: AccessPatternTracker::new(10_000),
            tag_prefix: config.cache_tag_prefix.clone(),
            bypass_threshold: config.bypass_threshold,
            ttl_config: TtlConfig::from(config),
        })
    }

    /// `shouldBypass(request, options) -> bool` (spec.md §4.6.2), exposed
    /// so the orchestrator can decide before even computing a fingerprint.
    pub fn should_bypass(&self, query_keys: &[&str], headers: &HeaderMap, options: &TransformOptions) -> bool {
        bypass::should_bypass(query_keys, headers, options, self.bypass_threshold)
    }

    pub fn fingerprint(&self, path: &str, options: &TransformOptions) -> String {
        fingerprint::fingerprint(path, options)
    }

    /// `get(fingerprint) -> Option<CachedEntry>`, degrading to `None` on
    /// any persistent-layer failure rather than surfacing it (spec.md
    /// §4.6.1, §5 "cache write/read failures never fail the request").
    pub async fn get(&self, key: &str) -> Option<CachedEntry> {
        let Some(persistent) = &self.persistent else { return None };
        let primary = async {
            self.breaker
                .call(|| async { persistent.get(key).map_err(AppError::from) })
                .await
        };
        let result = resilience_fallback(&self.failures, primary, async { None }).await;
        let (bytes, meta) = result?;
        self.tracker.record_hit(key);
        Some(CachedEntry { bytes, meta })
    }

    /// `put(fingerprint, data, metadata)` (spec.md §4.6.1). Failures are
    /// logged and swallowed: a cache write is never allowed to fail the
    /// response that triggered it.
    pub async fn put(&self, path: &str, key: &str, data: &[u8], options: &TransformOptions, content_type: &str, status: u16, explicit_ttl: Option<u32>) {
        let Some(persistent) = &self.persistent else { return };

        let ttl = compute_ttl_for_core(
            &TtlInputs {
                path,
                status,
                content_type,
                content_length: Some(data.len() as u64),
                explicit_ttl,
            },
            &self.ttl_config,
            &self.tracker,
        );

        let tags = tags::generate_tags(path, options, &self.tag_prefix);
        let meta = CacheEntryMeta {
            timestamp: kv::now_secs(),
            ttl,
            content_type: content_type.to_string(),
            size: data.len(),
            original_size: data.len(),
            compression_ratio: 1.0,
            storage_type: "sled".to_string(),
            tags,
            options: OptionsSnapshot::from(options),
            width: options.width,
            height: options.height,
        };

        let _ = self
            .breaker
            .call(|| async { persistent.put(key, data, &meta).map_err(AppError::from) })
            .await;
    }

    /// `purgeByTag(tag) -> count` (spec.md §4.6.7).
    pub fn purge_by_tag(&self, tag: &str) -> usize {
        let Some(persistent) = &self.persistent else { return 0 };
        persistent.purge_by_tag(&format!("{}{}", self.tag_prefix, tag)).unwrap_or(0)
    }

    /// `purgeByPath(pattern) -> count` (spec.md §4.6.7).
    pub fn purge_by_path(&self, pattern: &str) -> AppResult<usize> {
        let Some(persistent) = &self.persistent else { return Ok(0) };
        let re = regex::Regex::new(pattern).map_err(|e| AppError::internal(e.to_string()))?;
        Ok(persistent.purge_by_path(&re).unwrap_or(0))
    }

    pub fn tag_prefix(&self) -> &str {
        &self.tag_prefix
    }
}

fn compute_ttl_for_core(inputs: &TtlInputs, ttl_config: &TtlConfig, tracker: &AccessPatternTracker) -> u32 {
    ttl::compute_ttl(
        inputs,
        &ttl::TtlPolicy {
            path_ttl_rules: &ttl_config.path_ttl_rules,
            tiers: &ttl_config.tiers,
            max_ttl_secs: ttl_config.max_ttl_secs,
            default_ttl_secs: ttl_config.default_ttl_secs,
        },
        tracker,
    )
}

async fn resilience_fallback<T, P, F>(log: &FailureLog, primary: P, fallback: F) -> T
where
    P: std::future::Future<Output = AppResult<T>>,
    F: std::future::Future<Output = T>,
{
    crate::resilience::fallback::execute_with_fallback(log, primary, fallback).await
}
