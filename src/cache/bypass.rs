use crate::options::TransformOptions;
use axum::http::HeaderMap;

/// `shouldBypass(request, options) -> bool` via a 0-100 score, not a
/// boolean list (spec.md §4.6.2).
pub fn bypass_score(query_keys: &[&str], headers: &HeaderMap, options: &TransformOptions) -> u32 {
    let mut score: i32 = 0;

    if query_keys.iter().any(|k| *k == "debug" || *k == "no-cache") {
        score += 80;
    }
    if query_keys.iter().any(|k| matches!(*k, "_" | "cacheBuster" | "v" | "t")) {
        score += 60;
    }

    let cache_control = headers.get("cache-control").and_then(|v| v.to_str().ok()).unwrap_or("");
    let pragma = headers.get("pragma").and_then(|v| v.to_str().ok()).unwrap_or("");
    if cache_control.contains("no-cache") || cache_control.contains("no-store") || pragma.contains("no-cache") {
        score += 50;
    }

    if headers.contains_key("if-none-match") || headers.contains_key("if-modified-since") {
        score += 20;
    }

    // "dynamic-looking" options: width/height present but no fixed
    // dimension pair resolved yet (smart mode still deferring).
    if options.smart.smart && (options.width.is_none() || options.height.is_none()) {
        score += 15;
    }

    if matches!(options.format, Some(crate::options::Format::Auto)) {
        score += 10;
    }

    if options.has_effects() {
        score += 20;
    }

    if options.cache == Some(false) {
        score += 100;
    } else if options.cache == Some(true) {
        score -= 50;
    }
    if matches!(options.ttl, Some(t) if t > 0) {
        score -= 30;
    }

    score.clamp(0, 100) as u32
}

pub fn should_bypass(query_keys: &[&str], headers: &HeaderMap, options: &TransformOptions, threshold: u32) -> bool {
    bypass_score(query_keys, headers, options) >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn debug_query_scores_above_threshold() {
        let headers = HeaderMap::new();
        let opts = TransformOptions::default();
        let score = bypass_score(&["debug"], &headers, &opts);
        assert!(score >= 70);
    }

    #[test]
    fn explicit_cache_false_forces_bypass() {
        let headers = HeaderMap::new();
        let mut opts = TransformOptions::default();
        opts.cache = Some(false);
        assert!(should_bypass(&[], &headers, &opts, 70));
    }

    #[test]
    fn explicit_ttl_lowers_score() {
        let headers = HeaderMap::new();
        let mut opts = TransformOptions::default();
        opts.ttl = Some(3600);
        let with_ttl = bypass_score(&[], &headers, &opts);
        opts.ttl = None;
        let without = bypass_score(&[], &headers, &opts);
        assert!(with_ttl < without);
    }

    #[test]
    fn adding_buster_params_never_decreases_score() {
        let headers = HeaderMap::new();
        let opts = TransformOptions::default();
        let base = bypass_score(&[], &headers, &opts);
        for key in ["debug", "no-cache", "_", "cacheBuster", "v", "t"] {
            let bumped = bypass_score(&[key], &headers, &opts);
            assert!(bumped >= base, "key {key} decreased score");
        }
    }

    #[test]
    fn client_cache_control_contributes_but_is_capped() {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        let opts = TransformOptions::default();
        let score = bypass_score(&[], &headers, &opts);
        assert_eq!(score, 50);
    }
}
