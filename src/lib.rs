use axum::{
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hmac::Hmac;
use hmac::Mac;
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod options;
pub mod orchestrator;
pub mod resilience;
pub mod resolver;
pub mod storage;
pub mod transform;

pub use config::{AppConfig, Env};
pub use error::{AppError, ErrorKind};
pub use orchestrator::AppState;

/// `GET /sign?...` (spec.md §9 supplement): signs the full
/// `TransformOptions` query shape with an HMAC keyed over whatever
/// fields the caller sends.
async fn sign_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> impl IntoResponse {
    let Some(secret) = state.env.get("WORKER_SIGNING_SECRET") else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "signing secret not configured").into_response();
    };

    let canonical = canonical_params(&params);
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    mac.update(canonical.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());

    let path = params.get("path").cloned().unwrap_or_default();
    let mut signed_url = format!("/{}?{}", path.trim_start_matches('/'), canonical);
    signed_url.push_str("&sig=");
    signed_url.push_str(&sig);

    Json(SignResponse { canonical, sig, signed_url }).into_response()
}

#[derive(Debug, Serialize)]
struct SignResponse {
    canonical: String,
    sig: String,
    signed_url: String,
}

fn canonical_params(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(k, _)| k.as_str() != "sig")
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// `GET /debug-report` (spec.md §6). The HTML debug renderer itself is
/// out of scope; this returns a plain-text stub a real deployment can
/// replace with an actual report page.
async fn debug_report_handler() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "text/plain")], "debug report rendering is out of scope for this crate")
}

/// `GET /debug/kv-config` (spec.md §6, §9 supplement): a minimal JSON
/// introspection endpoint listing what the persistent cache layer is
/// configured with.
async fn debug_kv_config_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "tagPrefix": state.cache.tag_prefix(),
        "persistentCacheEnabled": state.config.persistent_cache_enabled,
        "defaultTtlSecs": state.config.default_ttl_secs,
        "maxTtlSecs": state.config.max_ttl_secs,
        "bypassThreshold": state.config.bypass_threshold,
    }))
}

/// `GET /health`.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "imagekit",
    }))
}

/// `GET /stats/cache` (spec.md §9 supplement).
async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "persistentCacheEnabled": state.config.persistent_cache_enabled,
        "tagPrefix": state.cache.tag_prefix(),
    }))
}

/// `GET /metrics`, Prometheus text exposition format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))], body)
}

/// `GET /`, per spec.md §6 "`/` -> static hello".
async fn root_handler() -> impl IntoResponse {
    (StatusCode::OK, "imagekit edge image-resizing worker")
}

/// Builds the full router: bypass routes are registered before the
/// catch-all image path so they are matched first (spec.md §4.1 step 2
/// "if pathname matches a declared bypass rule, short-circuit").
pub fn router(state: Arc<AppState>) -> Router {
    let observability_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/stats/cache", get(cache_stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/kv-config", get(debug_kv_config_handler))
        .route("/debug-report", get(debug_report_handler))
        .with_state(state.clone());

    let mut transform_routes = Router::new()
        .route("/sign", get(sign_handler))
        .route("/*path", get(orchestrator::serve))
        .with_state(state.clone());

    if std::env::var("DISABLE_RATE_LIMIT").is_err() {
        let governor_conf = Box::new(
            GovernorConfigBuilder::default()
                .per_second(10)
                .burst_size(30)
                .finish()
                .expect("static governor config is always valid"),
        );
        tracing::info!("router configured with rate limiting: 10/sec, burst 30");
        transform_routes = transform_routes.layer(GovernorLayer { config: Box::leak(governor_conf) });
    } else {
        tracing::info!("rate limiting disabled");
    }

    Router::new()
        .route("/", get(root_handler))
        .merge(observability_routes)
        .merge(transform_routes)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(kv_path: &str) -> Arc<AppState> {
        std::env::set_var("DISABLE_RATE_LIMIT", "1");
        let config = AppConfig::minimal("img.example.com", kv_path);
        Arc::new(AppState::new(config, Env::default().with("WORKER_SIGNING_SECRET", "topsecret")).unwrap())
    }

    #[tokio::test]
    async fn health_route_reports_healthy() {
        let app = router(test_state("./kv-test-lib-health"));
        let resp = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn debug_report_is_a_bypass_route_not_the_image_handler() {
        let app = router(test_state("./kv-test-lib-debugreport"));
        let resp = app.oneshot(Request::builder().uri("/debug-report").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sign_endpoint_returns_a_signature() {
        let app = router(test_state("./kv-test-lib-sign"));
        let resp = app
            .oneshot(Request::builder().uri("/sign?path=cat.jpg&width=200").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn root_route_returns_static_hello() {
        let app = router(test_state("./kv-test-lib-root"));
        let resp = app.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
