use crate::config::{PathTtlRule, Tier};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-URL access history used to decide the "frequent" tier (spec.md
/// §4.6.3). Process-local and pruned under a soft high-watermark like
/// the detector LRU (spec.md §5).
pub struct AccessPatternTracker {
    entries: Mutex<HashMap<String, AccessRecord>>,
    max_entries: usize,
}

struct AccessRecord {
    first_seen: Instant,
    hits: u64,
    recent_hits_window: Vec<Instant>,
}

impl AccessPatternTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn record_hit(&self, url: &str) {
        let mut map = self.entries.lock();
        let now = Instant::now();
        let record = map.entry(url.to_string()).or_insert_with(|| AccessRecord {
            first_seen: now,
            hits: 0,
            recent_hits_window: Vec::new(),
        });
        record.hits += 1;
        record.recent_hits_window.push(now);
        record.recent_hits_window.retain(|t| now.duration_since(*t) < Duration::from_secs(5 * 3600));

        if map.len() > self.max_entries {
            prune_oldest(&mut map, self.max_entries * 3 / 4);
        }
    }

    /// "Frequently accessed" = >=10 total hits AND (>=1 hit/hour since
    /// first seen OR >=5 hits within the first 5h).
    pub fn is_frequent(&self, url: &str) -> bool {
        let map = self.entries.lock();
        let Some(record) = map.get(url) else { return false };
        if record.hits < 10 {
            return false;
        }
        let elapsed_hours = record.first_seen.elapsed().as_secs_f64() / 3600.0;
        let hits_per_hour_ok = elapsed_hours > 0.0 && (record.hits as f64 / elapsed_hours) >= 1.0;
        let burst_ok = record.recent_hits_window.len() >= 5;
        hits_per_hour_ok || burst_ok
    }
}

fn prune_oldest(map: &mut HashMap<String, AccessRecord>, target: usize) {
    let mut keys: Vec<(String, Instant)> = map.iter().map(|(k, v)| (k.clone(), v.first_seen)).collect();
    keys.sort_by_key(|(_, ts)| *ts);
    let overflow = map.len().saturating_sub(target);
    for (k, _) in keys.into_iter().take(overflow) {
        map.remove(&k);
    }
}

/// `ttl(response, options, storage?) -> seconds` (spec.md §4.6.3).
pub struct TtlInputs<'a> {
    pub path: &'a str,
    pub status: u16,
    pub content_type: &'a str,
    pub content_length: Option<u64>,
    pub explicit_ttl: Option<u32>,
}

/// The slice of `AppConfig` that `compute_ttl` needs, taken by
/// reference so callers that already hold their own copy (like
/// `CacheCore`) don't have to reconstruct a whole config just to call
/// this function (spec.md §4.6.3).
pub struct TtlPolicy<'a> {
    pub path_ttl_rules: &'a [PathTtlRule],
    pub tiers: &'a [Tier],
    pub max_ttl_secs: u32,
    pub default_ttl_secs: u32,
}

pub fn compute_ttl(inputs: &TtlInputs, policy: &TtlPolicy, tracker: &AccessPatternTracker) -> u32 {
    if let Some(t) = inputs.explicit_ttl {
        if t > 0 {
            return t.min(policy.max_ttl_secs);
        }
    }

    let mut base = path_pattern_ttl(inputs, policy.path_ttl_rules).unwrap_or_else(|| status_range_ttl(inputs.status, policy.default_ttl_secs));

    let tier = select_tier(inputs, policy.tiers, tracker);
    if let Some(tier) = tier {
        base = (base as f64 * tier.multiplier).round() as u32;
    }

    base.clamp(1, policy.max_ttl_secs)
}

fn path_pattern_ttl(inputs: &TtlInputs, rules: &[PathTtlRule]) -> Option<u32> {
    for rule in rules {
        let re = Regex::new(&rule.regex).ok()?;
        if re.is_match(inputs.path) {
            for ((lo, hi), ttl) in &rule.ttl_by_status_range {
                if inputs.status >= *lo && inputs.status <= *hi {
                    return Some(*ttl);
                }
            }
        }
    }
    None
}

fn status_range_ttl(status: u16, default_ttl: u32) -> u32 {
    match status {
        200..=299 => default_ttl,
        400..=499 => 60,
        500..=599 => 10,
        _ => default_ttl,
    }
}

fn select_tier<'a>(inputs: &TtlInputs, tiers: &'a [Tier], tracker: &AccessPatternTracker) -> Option<&'a Tier> {
    for tier in tiers {
        let applies = match tier.name.as_str() {
            "frequent" => tracker.is_frequent(inputs.path),
            "images" => inputs.content_type.starts_with("image/"),
            "small" => inputs.content_length.map(|l| l <= 50 * 1024).unwrap_or(false),
            "large" => inputs.content_length.map(|l| l >= 1024 * 1024).unwrap_or(false),
            "default" => true,
            _ => false,
        };
        if applies {
            return Some(tier);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn cfg() -> AppConfig {
        AppConfig::minimal("img.example.com", "./kv-test-ttl")
    }

    fn policy(cfg: &AppConfig) -> TtlPolicy<'_> {
        TtlPolicy {
            path_ttl_rules: &cfg.path_ttl_rules,
            tiers: &cfg.tiers,
            max_ttl_secs: cfg.max_ttl_secs,
            default_ttl_secs: cfg.default_ttl_secs,
        }
    }

    #[test]
    fn explicit_ttl_wins() {
        let tracker = AccessPatternTracker::new(1000);
        let inputs = TtlInputs {
            path: "/x.jpg",
            status: 200,
            content_type: "image/jpeg",
            content_length: Some(1000),
            explicit_ttl: Some(555),
        };
        assert_eq!(compute_ttl(&inputs, &policy(&cfg()), &tracker), 555);
    }

    #[test]
    fn ttl_is_within_policy_bounds() {
        let tracker = AccessPatternTracker::new(1000);
        let inputs = TtlInputs {
            path: "/x.jpg",
            status: 200,
            content_type: "image/jpeg",
            content_length: Some(1000),
            explicit_ttl: None,
        };
        let cfg = cfg();
        let ttl = compute_ttl(&inputs, &policy(&cfg), &tracker);
        assert!(ttl >= 1 && ttl <= cfg.max_ttl_secs);
    }

    #[test]
    fn small_images_get_larger_multiplier_than_large() {
        let tracker = AccessPatternTracker::new(1000);
        let small = TtlInputs {
            path: "/x.jpg",
            status: 200,
            content_type: "image/jpeg",
            content_length: Some(10 * 1024),
            explicit_ttl: None,
        };
        let large = TtlInputs {
            path: "/y.jpg",
            status: 200,
            content_type: "image/jpeg",
            content_length: Some(2 * 1024 * 1024),
            explicit_ttl: None,
        };
        let cfg = cfg();
        let policy = policy(&cfg);
        assert!(compute_ttl(&small, &policy, &tracker) > compute_ttl(&large, &policy, &tracker));
    }

    #[test]
    fn frequent_access_doubles_ttl() {
        let tracker = AccessPatternTracker::new(1000);
        for _ in 0..12 {
            tracker.record_hit("/hot.jpg");
        }
        let cfg = cfg();
        let policy = policy(&cfg);
        let inputs_hot = TtlInputs {
            path: "/hot.jpg",
            status: 200,
            content_type: "image/jpeg",
            content_length: Some(500 * 1024),
            explicit_ttl: None,
        };
        let inputs_cold = TtlInputs {
            path: "/cold.jpg",
            status: 200,
            content_type: "image/jpeg",
            content_length: Some(500 * 1024),
            explicit_ttl: None,
        };
        assert!(compute_ttl(&inputs_hot, &policy, &tracker) > compute_ttl(&inputs_cold, &policy, &tracker));
    }
}
