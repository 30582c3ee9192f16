use imagekit::{router, AppConfig, AppState, Env};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagekit=debug,tower_http=debug".into()),
        )
        .init();

    tracing::info!("Starting ImageKit server");

    let origin_domain = std::env::var("IMAGEKIT_ORIGIN_DOMAIN").unwrap_or_else(|_| "*.example.com".into());
    let kv_path = std::env::var("IMAGEKIT_KV_PATH").unwrap_or_else(|_| "./cache/kv".into());
    let cfg = AppConfig::minimal(origin_domain, kv_path);
    cfg.validate()?;

    let env = Env::from_process();
    let state = Arc::new(AppState::new(cfg, env)?);

    tokio::spawn(imagekit::orchestrator::drain_after_response(state.clone()));

    let app = router(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string()).parse::<u16>().unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
