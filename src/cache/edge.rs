use axum::http::HeaderMap;

/// Builds the edge-facing `Cache-Control`/`Surrogate-Control` headers for
/// a response carrying the given ttl (spec.md §4.6.1 "Layer A").
pub fn cache_control_value(ttl: u32, stale_while_revalidate: Option<u32>, stale_if_error: Option<u32>) -> String {
    let mut parts = vec!["public".to_string(), format!("max-age={ttl}")];
    if let Some(swr) = stale_while_revalidate {
        parts.push(format!("stale-while-revalidate={swr}"));
    }
    if let Some(sie) = stale_if_error {
        parts.push(format!("stale-if-error={sie}"));
    }
    parts.join(", ")
}

/// `Surrogate-Control` carries the same ttl to CDNs that honor it
/// separately from browser `Cache-Control` (spec.md §4.6.1).
pub fn surrogate_control_value(ttl: u32) -> String {
    format!("public, max-age={ttl}")
}

/// `age` is `now - entry.timestamp` for a cache hit, `0` for a freshly
/// produced response (spec.md §4.6.5 "Retrieval": `Age = now - timestamp`,
/// `Cache-Control: public, max-age=max(0, ttl - age)`). `Surrogate-Control`
/// always carries the full, un-aged `ttl` — it is the shared-cache signal,
/// not the client-facing one.
pub fn apply_cache_headers(headers: &mut HeaderMap, ttl: u32, age: u32, tags_header: &str, edge_status: &str) {
    let live_max_age = ttl.saturating_sub(age);
    if let Ok(v) = cache_control_value(live_max_age, Some(live_max_age / 2), Some(ttl)).parse() {
        headers.insert("cache-control", v);
    }
    if let Ok(v) = surrogate_control_value(ttl).parse() {
        headers.insert("surrogate-control", v);
    }
    if let Ok(v) = age.to_string().parse() {
        headers.insert("age", v);
    }
    if !tags_header.is_empty() {
        if let Ok(v) = tags_header.parse() {
            headers.insert("cache-tag", v);
        }
    }
    // spec.md §6 "HTTP response headers": `X-Cache: HIT|MISS`, a closed
    // two-value enum. `BYPASS` never went through the cache at all, so
    // it is reported as a MISS on this header; the finer-grained
    // three-way distinction is kept on `X-Cache-Status` for debugging.
    let spec_status = if edge_status == "HIT" { "HIT" } else { "MISS" };
    if let Ok(v) = spec_status.parse() {
        headers.insert("x-cache", v);
    }
    if let Ok(v) = edge_status.parse() {
        headers.insert("x-cache-status", v);
    }
}
