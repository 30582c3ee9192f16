use crate::config::{AppConfig, Derivative};
use crate::options::{OptionsError, ParamSource, TransformOptions};

/// Resolves the final `TransformOptions` for a request path + query
/// (spec.md §4.4).
///
/// Steps: match the longest derivative path pattern, load its template,
/// parse the query string, coerce and validate, then merge — query wins
/// over derivative.
pub fn resolve(path: &str, query: &str, config: &AppConfig) -> Result<TransformOptions, OptionsError> {
    let mut opts = TransformOptions::default();

    if let Some(derivative) = longest_matching_derivative(path, &config.derivatives) {
        for (k, v) in &derivative.template {
            opts.set(k, v, ParamSource::Derivative)?;
        }
        opts.derivative_name = Some(derivative.name.clone());
    }

    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        opts.set(&k, &v, ParamSource::User)?;
    }

    opts.validate()?;
    Ok(opts)
}

/// Longest-path-pattern-wins derivative match. `path_pattern` is treated
/// as a literal path prefix (not a glob) — the longest prefix that
/// matches `path` wins, matching spec.md §4.4 "longest match wins".
fn longest_matching_derivative<'a>(path: &str, derivatives: &'a [Derivative]) -> Option<&'a Derivative> {
    derivatives
        .iter()
        .filter(|d| path.starts_with(&d.path_pattern))
        .max_by_key(|d| d.path_pattern.len())
}
