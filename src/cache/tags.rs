use crate::options::{Format, TransformOptions};

/// Normalizes a path the same way `fingerprint::normalize_path` does,
/// but additionally strips all leading slashes (spec.md §4.6.4).
fn normalize_for_tags(path: &str) -> String {
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

/// Dots inside segments are replaced with `-` for header safety once a
/// value is emitted as a `Cache-Tag` token (spec.md §4.6.4).
fn header_safe(segment: &str) -> String {
    segment.replace('.', "-")
}

/// Generates the cache-tag set for a (path, options) pair (spec.md
/// §4.6.4). Tags are emitted both as response headers and as secondary
/// index entries.
pub fn generate_tags(path: &str, options: &TransformOptions, prefix: &str) -> Vec<String> {
    let norm = normalize_for_tags(path);
    let mut tags = Vec::new();

    tags.push(format!("{prefix}path-{}", header_safe(&norm)));

    let segments: Vec<&str> = norm.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > 1 {
        for (i, seg) in segments.iter().enumerate() {
            tags.push(format!("{prefix}segment-{i}-{}", header_safe(seg)));
        }
    }

    if let Some(file_name) = segments.last() {
        tags.push(format!("{prefix}file-{}", header_safe(file_name)));
        if let Some((_, ext)) = file_name.rsplit_once('.') {
            tags.push(format!("{prefix}ext-{}", header_safe(ext)));
        }
    }

    if let Some(w) = options.width {
        tags.push(format!("{prefix}width-{w}"));
    }
    if let Some(h) = options.height {
        tags.push(format!("{prefix}height-{h}"));
    }
    if let (Some(w), Some(h)) = (options.width, options.height) {
        tags.push(format!("{prefix}dimensions-{w}x{h}"));
    }
    if let Some(fmt) = options.format {
        if fmt != Format::Auto {
            tags.push(format!("{prefix}format-{fmt}"));
        }
    }
    if let Some(q) = options.quality {
        tags.push(format!("{prefix}quality-{q}"));
    }
    if let Some(fit) = options.fit {
        tags.push(format!("{prefix}fit-{fit}"));
    }
    if let Some(d) = &options.derivative_name {
        tags.push(format!("{prefix}derivative-{}", header_safe(d)));
    }

    tags
}

/// Serializes a tag list for the `Cache-Tag` response header.
pub fn tags_header_value(tags: &[String]) -> String {
    tags.join(",")
}
