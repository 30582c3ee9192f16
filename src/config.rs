use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// An addressable source of bytes (spec.md §3 "Origin").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Origin {
    pub id: String,
    /// Literal host or wildcard pattern (`*.example.com`). Origins are
    /// matched in declaration order; first match wins.
    pub domain_pattern: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub auth: AuthConfig,
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// `"https"` or `"http"`, used to build the fetch URL from
    /// `domain_pattern`. Defaults to `https`; only a loopback/test origin
    /// should ever need `http`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_true() -> bool {
    true
}

fn default_scheme() -> String {
    "https".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AuthConfig {
    Bearer {
        secret_ref: String,
    },
    CustomHeader {
        headers: HashMap<String, String>,
    },
    SignedQuery {
        secret_ref: String,
        token_param: String,
        #[serde(default = "default_expiry_window")]
        expiry_window_secs: i64,
    },
    S3Sig {
        access_key_ref: String,
        secret_key_ref: String,
        region: String,
        service: String,
    },
    None,
}

fn default_expiry_window() -> i64 {
    300
}

/// `strict` fails the request when signing fails; `permissive` proceeds
/// unauthenticated and records a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Strict,
    Permissive,
}

/// A named preset of transform options applied when a URL pattern matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Derivative {
    pub name: String,
    pub path_pattern: String,
    pub template: HashMap<String, String>,
}

/// First-match-wins TTL rule keyed on a path regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathTtlRule {
    pub regex: String,
    /// Inclusive status range -> ttl seconds, checked in declared order.
    pub ttl_by_status_range: Vec<((u16, u16), u32)>,
}

/// A tiered TTL multiplier (spec.md §4.6.3). Evaluated in declared order;
/// first tier whose `applies` rule matches wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionThresholds {
    pub device_class_low_max: u8,
    pub device_class_high_min: u8,
    pub lru_ttl_secs: u64,
    pub lru_max_size: usize,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            device_class_low_max: 30,
            device_class_high_min: 70,
            lru_ttl_secs: 600,
            lru_max_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub origin_fetch_ms: u64,
    pub transform_ms: u64,
    pub cache_read_ms: u64,
    pub cache_write_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            origin_fetch_ms: 5000,
            transform_ms: 10000,
            cache_read_ms: 200,
            cache_write_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLevelConfig(pub SecurityLevel);

impl Default for SecurityLevelConfig {
    fn default() -> Self {
        Self(SecurityLevel::Strict)
    }
}

/// Read-mostly, reloadable configuration consumed by the core. Loading it
/// from YAML/JSON/a config service is out of scope; this crate only
/// defines the shape and validates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub origins: Vec<Origin>,
    #[serde(default)]
    pub derivatives: Vec<Derivative>,
    #[serde(default)]
    pub path_ttl_rules: Vec<PathTtlRule>,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: u32,
    #[serde(default = "default_default_ttl")]
    pub default_ttl_secs: u32,
    #[serde(default = "default_bypass_threshold")]
    pub bypass_threshold: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub detection: DetectionThresholds,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_cache_tag_prefix")]
    pub cache_tag_prefix: String,
    #[serde(default)]
    pub security_level: SecurityLevelConfig,
    #[serde(default = "default_true")]
    pub persistent_cache_enabled: bool,
    #[serde(default = "default_true")]
    pub debug_headers_enabled: bool,
    pub kv_path: PathBuf,
    pub metadata_kv_path: PathBuf,
}

fn default_tiers() -> Vec<Tier> {
    vec![
        Tier { name: "frequent".into(), multiplier: 2.0 },
        Tier { name: "small".into(), multiplier: 1.5 },
        Tier { name: "large".into(), multiplier: 0.7 },
        Tier { name: "images".into(), multiplier: 1.0 },
        Tier { name: "default".into(), multiplier: 1.0 },
    ]
}

fn default_max_ttl() -> u32 {
    30 * 24 * 3600
}

fn default_default_ttl() -> u32 {
    3600
}

fn default_bypass_threshold() -> u32 {
    70
}

fn default_cache_tag_prefix() -> String {
    "imagekit-".into()
}

use std::path::PathBuf;

impl AppConfig {
    /// A config with one unauthenticated origin, suitable for tests and
    /// as a starting point for a real deployment's loader.
    pub fn minimal(origin_domain: impl Into<String>, kv_path: impl Into<PathBuf>) -> Self {
        let kv_path = kv_path.into();
        Self {
            origins: vec![Origin {
                id: "default".into(),
                domain_pattern: origin_domain.into(),
                enabled: true,
                auth: AuthConfig::None,
                path_prefix: None,
                scheme: default_scheme(),
            }],
            derivatives: vec![],
            path_ttl_rules: vec![],
            tiers: default_tiers(),
            max_ttl_secs: default_max_ttl(),
            default_ttl_secs: default_default_ttl(),
            bypass_threshold: default_bypass_threshold(),
            retry: RetryPolicy::default(),
            breaker: BreakerSettings::default(),
            detection: DetectionThresholds::default(),
            timeouts: Timeouts::default(),
            cache_tag_prefix: default_cache_tag_prefix(),
            security_level: SecurityLevelConfig::default(),
            persistent_cache_enabled: true,
            debug_headers_enabled: true,
            metadata_kv_path: kv_path.join("metadata"),
            kv_path,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one origin must be declared")]
    NoOrigins,
    #[error("origin `{0}` has an empty domain pattern")]
    EmptyDomainPattern(String),
    #[error("bypass threshold must be in [0, 100]")]
    InvalidBypassThreshold,
    #[error("max_ttl_secs must be > 0")]
    InvalidMaxTtl,
    #[error("invalid wildcard pattern for origin `{0}`: {1}")]
    InvalidPattern(String, String),
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.origins.is_empty() {
            return Err(ConfigError::NoOrigins);
        }
        for o in &self.origins {
            if o.domain_pattern.trim().is_empty() {
                return Err(ConfigError::EmptyDomainPattern(o.id.clone()));
            }
            if let Err(e) = crate::storage::auth::compile_domain_pattern(&o.domain_pattern) {
                return Err(ConfigError::InvalidPattern(o.id.clone(), e));
            }
        }
        if self.bypass_threshold > 100 {
            return Err(ConfigError::InvalidBypassThreshold);
        }
        if self.max_ttl_secs == 0 {
            return Err(ConfigError::InvalidMaxTtl);
        }
        Ok(())
    }
}

/// Environment secrets map, looked up by name (spec.md §6 "Environment
/// variables consumed"). A real deployment populates this from process
/// env vars; tests populate it directly.
#[derive(Debug, Clone, Default)]
pub struct Env {
    secrets: HashMap<String, String>,
}

impl Env {
    pub fn from_process() -> Self {
        let mut secrets = HashMap::new();
        for (k, v) in std::env::vars() {
            if k.starts_with("AUTH_TOKEN_SECRET_")
                || k.starts_with("AUTH_SIGNING_SECRET_")
                || k == "AWS_ACCESS_KEY_ID"
                || k == "AWS_SECRET_ACCESS_KEY"
                || k == "WORKER_SIGNING_SECRET"
            {
                secrets.insert(k, v);
            }
        }
        Self { secrets }
    }

    pub fn with(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.secrets.insert(k.into(), v.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(|s| s.as_str())
    }
}
