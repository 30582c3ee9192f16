use crate::options::{Format, TransformOptions};
use sha2::{Digest, Sha256};

/// Query params known to be cache-busters; never part of the
/// fingerprint (spec.md §3 "Fingerprint" — "omitting declared
/// cache-buster params").
pub const CACHE_BUSTER_PARAMS: &[&str] = &["_", "cacheBuster", "v", "t"];

/// Normalizes an origin path: strips leading slashes, replaces invalid
/// characters with `-` (spec.md §3 "Fingerprint").
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Canonical subset of `TransformOptions` that participates in the
/// fingerprint: sorted keys, auto-chosen format excluded unless the user
/// explicitly requested it (spec.md §3 "Fingerprint").
fn canonical_pairs(options: &TransformOptions) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    macro_rules! push {
        ($k:expr, $v:expr) => {
            pairs.push(($k.to_string(), $v))
        };
    }
    if let Some(w) = options.width {
        push!("width", w.to_string());
    }
    if let Some(h) = options.height {
        push!("height", h.to_string());
    }
    if let Some(fit) = options.fit {
        push!("fit", fit.to_string());
    }
    if let Some(q) = options.quality {
        push!("quality", q.to_string());
    }
    // Auto-chosen format is excluded; only an explicit, non-auto format
    // or one the user literally typed "auto" for participates.
    if let Some(fmt) = options.format {
        if fmt != Format::Auto {
            push!("format", fmt.to_string());
        }
    }
    if let Some(dpr) = options.dpr {
        push!("dpr", dpr.to_string());
    }
    if let Some(blur) = options.blur {
        push!("blur", blur.to_string());
    }
    if let Some(rotate) = options.rotate {
        push!("rotate", rotate.to_string());
    }
    if options.flip {
        push!("flip", "1".to_string());
    }
    if options.flop {
        push!("flop", "1".to_string());
    }
    if options.trim {
        push!("trim", "1".to_string());
    }
    if let Some(name) = &options.derivative_name {
        push!("derivative", name.clone());
    }
    for (k, v) in &options.extras {
        if !CACHE_BUSTER_PARAMS.contains(&k.as_str()) {
            push!(format!("x-{k}"), v.clone());
        }
    }
    pairs.sort();
    pairs
}

/// Deterministic canonical key for a (path, options) pair, URL-safe and
/// stable across restarts (spec.md §3 "Fingerprint").
pub fn fingerprint(path: &str, options: &TransformOptions) -> String {
    let norm_path = normalize_path(path);
    let pairs = canonical_pairs(options);
    let canonical: String = std::iter::once(format!("path={norm_path}"))
        .chain(pairs.into_iter().map(|(k, v)| format!("{k}={v}")))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ParamSource;

    fn opts_with(width: u32, height: u32) -> TransformOptions {
        let mut o = TransformOptions::default();
        o.width = Some(width);
        o.height = Some(height);
        o
    }

    #[test]
    fn differing_only_in_cache_buster_params_is_same_fingerprint() {
        let mut a = opts_with(400, 300);
        a.set("_", "123", ParamSource::User).unwrap();
        let b = opts_with(400, 300);
        assert_eq!(fingerprint("/cat.jpg", &a), fingerprint("/cat.jpg", &b));
    }

    #[test]
    fn auto_format_excluded_unless_explicit() {
        let mut a = opts_with(400, 300);
        a.format = Some(Format::Auto);
        let b = opts_with(400, 300);
        assert_eq!(fingerprint("/cat.jpg", &a), fingerprint("/cat.jpg", &b));
    }

    #[test]
    fn explicit_format_changes_fingerprint() {
        let mut a = opts_with(400, 300);
        a.format = Some(Format::Webp);
        let b = opts_with(400, 300);
        assert_ne!(fingerprint("/cat.jpg", &a), fingerprint("/cat.jpg", &b));
    }

    #[test]
    fn path_is_normalized() {
        assert_eq!(normalize_path("///a b/c?d"), "a-b/c-d");
    }

    #[test]
    fn order_of_recognized_params_does_not_matter() {
        // Both built the same way here since we always build options via
        // struct fields, but canonical_pairs sorts regardless of
        // insertion order, which this exercises indirectly via extras.
        let mut a = TransformOptions::default();
        a.set("zeta", "1", ParamSource::User).unwrap();
        a.set("alpha", "2", ParamSource::User).unwrap();
        let mut b = TransformOptions::default();
        b.set("alpha", "2", ParamSource::User).unwrap();
        b.set("zeta", "1", ParamSource::User).unwrap();
        assert_eq!(fingerprint("/x.jpg", &a), fingerprint("/x.jpg", &b));
    }
}
