pub mod auth;

use crate::config::{AppConfig, Env, Origin};
use crate::error::{AppError, ErrorKind};
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;

/// The bytes and metadata fetched from whichever origin served the
/// request (spec.md §3 "FetchResult").
pub struct FetchResult {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub status: u16,
    pub origin_id: String,
}

/// Multi-origin fetcher (spec.md §4.2 "StorageFetcher"). Origins are
/// tried in declaration order; a 404/410 or a transport/5xx failure
/// advances to the next origin, a retry policy governs transient
/// failures on each individual origin before giving up on it.
pub struct StorageFetcher {
    client: Client,
    max_size: usize,
}

impl StorageFetcher {
    pub fn new(max_size: usize) -> Self {
        Self { client: Client::new(), max_size }
    }

    /// Resolves `path` against every enabled origin matching `host` in
    /// config order, short-circuiting on the first success. Returns
    /// `OriginNotFound` only if every origin responded 404/410;
    /// any other terminal failure is reported with `sourceTag=error`
    /// via `ErrorKind::OriginFetchFailed`.
    pub async fn fetch(&self, host: &str, path: &str, config: &AppConfig, env: &Env) -> Result<FetchResult, AppError> {
        let mut last_not_found = false;
        let mut last_err: Option<AppError> = None;

        for origin in &config.origins {
            let Ok(pattern) = auth::compile_domain_pattern(&origin.domain_pattern) else {
                continue;
            };
            if !auth::matches_domain(&pattern, host) {
                continue;
            }

            // A disabled origin is not skipped outright (spec.md §3
            // "Origin" invariant: "a disabled origin means 'no auth
            // required' rather than 'fetch forbidden'") — it is fetched
            // unauthenticated instead.
            match self.fetch_from_origin(origin, path, config, env, !origin.enabled).await {
                Ok(result) => return Ok(result),
                Err(e) if e.http_status.as_u16() == 404 || e.http_status.as_u16() == 410 => {
                    last_not_found = true;
                    continue;
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }

        if let Some(e) = last_err {
            return Err(e);
        }
        if last_not_found {
            return Err(AppError::new(ErrorKind::OriginNotFound, format!("no origin served `{path}`")));
        }
        Err(AppError::new(ErrorKind::OriginNotFound, format!("no origin configured for host `{host}`")))
    }

    async fn fetch_from_origin(&self, origin: &Origin, path: &str, config: &AppConfig, env: &Env, force_unauthenticated: bool) -> Result<FetchResult, AppError> {
        let rewritten_path = match &origin.path_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path.trim_start_matches('/')),
            None => path.to_string(),
        };
        let base_url = format!("{}://{}/{}", origin.scheme, origin.domain_pattern.trim_start_matches("*."), rewritten_path.trim_start_matches('/'));

        let decision = if force_unauthenticated {
            auth::apply_auth(&crate::config::AuthConfig::None, &base_url, env)?
        } else {
            match auth::apply_auth(&origin.auth, &base_url, env) {
                Ok(decision) => decision,
                // spec.md §4.3 "Security modes": `permissive` proceeds
                // unauthenticated and records a warning instead of
                // failing the request outright.
                Err(e) if config.security_level.0 == crate::config::SecurityLevel::Permissive => {
                    tracing::warn!(origin = %origin.id, error = %e, "auth failed under permissive security level, proceeding unauthenticated");
                    auth::apply_auth(&crate::config::AuthConfig::None, &base_url, env)?
                }
                Err(e) => return Err(e),
            }
        };

        let policy = config.retry.clone();
        let origin_id = origin.id.clone();
        let timeout = Duration::from_millis(config.timeouts.origin_fetch_ms);

        crate::resilience::retry::with_retry(&policy, || {
            let url = decision.url.clone();
            let headers = decision.headers.clone();
            let origin_id = origin_id.clone();
            async move { self.do_fetch(&url, &headers, &origin_id, timeout).await }
        })
        .await
    }

    async fn do_fetch(&self, url: &str, headers: &[(String, String)], origin_id: &str, timeout: Duration) -> Result<FetchResult, AppError> {
        let mut req = self.client.get(url).timeout(timeout);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await?;
        let status = resp.status();

        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(AppError::new(ErrorKind::OriginNotFound, format!("{status}")).with_status(status).with_url(url));
        }
        if status.is_server_error() {
            return Err(AppError::new(ErrorKind::OriginFetchFailed, format!("upstream status {status}")).with_url(url));
        }
        if !status.is_success() {
            return Err(AppError::new(ErrorKind::OriginFetchFailed, format!("upstream status {status}"))
                .with_status(status)
                .with_url(url));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        if let Some(len) = resp.content_length() {
            if len as usize > self.max_size {
                return Err(AppError::new(ErrorKind::InvalidResponse, "origin response exceeds size limit").with_url(url));
            }
        }

        let mut buf = BytesMut::with_capacity(8192);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await.transpose()? {
            if buf.len() + chunk.len() > self.max_size {
                return Err(AppError::new(ErrorKind::InvalidResponse, "origin response exceeds size limit").with_url(url));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchResult {
            bytes: buf.to_vec(),
            content_type,
            status: status.as_u16(),
            origin_id: origin_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    fn config_with_origins(origins: Vec<Origin>) -> AppConfig {
        let mut cfg = AppConfig::minimal("img.example.com", "./kv-test-storage");
        cfg.origins = origins;
        cfg
    }

    #[tokio::test]
    async fn no_matching_origin_for_host_is_origin_not_found() {
        let fetcher = StorageFetcher::new(10_000_000);
        let cfg = config_with_origins(vec![Origin {
            id: "a".into(),
            domain_pattern: "other.example.com".into(),
            enabled: true,
            auth: AuthConfig::None,
            path_prefix: None,
            scheme: "https".into(),
        }]);
        let err = fetcher.fetch("img.example.com", "/cat.jpg", &cfg, &Env::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OriginNotFound);
    }

    #[tokio::test]
    async fn strict_security_level_surfaces_auth_failure() {
        let fetcher = StorageFetcher::new(10_000_000);
        let cfg = config_with_origins(vec![Origin {
            id: "a".into(),
            domain_pattern: "img.example.com".into(),
            enabled: true,
            auth: AuthConfig::Bearer { secret_ref: "MISSING_SECRET".into() },
            path_prefix: None,
            scheme: "https".into(),
        }]);
        let err = fetcher.fetch("img.example.com", "/cat.jpg", &cfg, &Env::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthFailure);
    }

    #[tokio::test]
    async fn permissive_security_level_proceeds_unauthenticated_on_auth_failure() {
        let mut cfg = config_with_origins(vec![Origin {
            id: "a".into(),
            domain_pattern: "img.example.com".into(),
            enabled: true,
            auth: AuthConfig::Bearer { secret_ref: "MISSING_SECRET".into() },
            path_prefix: None,
            scheme: "https".into(),
        }]);
        cfg.security_level = crate::config::SecurityLevelConfig(crate::config::SecurityLevel::Permissive);
        let fetcher = StorageFetcher::new(10_000_000);
        // No live server is listening, so this still fails overall, but
        // it must get past auth resolution and fail as a transport
        // error, never as an auth failure.
        let err = fetcher.fetch("img.example.com", "/cat.jpg", &cfg, &Env::default()).await.unwrap_err();
        assert_ne!(err.kind, ErrorKind::AuthFailure);
    }

    #[tokio::test]
    async fn disabled_origin_is_still_fetched_without_auth() {
        // spec.md §3 "Origin" invariant: disabled means "no auth
        // required", not "fetch forbidden" — a disabled origin with a
        // bearer secret that doesn't even exist must not surface an
        // auth-failure, since auth is skipped entirely.
        let fetcher = StorageFetcher::new(10_000_000);
        let cfg = config_with_origins(vec![Origin {
            id: "a".into(),
            domain_pattern: "img.example.com".into(),
            enabled: false,
            auth: AuthConfig::Bearer { secret_ref: "MISSING_SECRET".into() },
            path_prefix: None,
            scheme: "https".into(),
        }]);
        // No live server is listening, so this still fails, but it must
        // fail as a transport error, never as an auth failure.
        let err = fetcher.fetch("img.example.com", "/cat.jpg", &cfg, &Env::default()).await.unwrap_err();
        assert_ne!(err.kind, ErrorKind::AuthFailure);
    }
}
