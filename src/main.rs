use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use amenityd::compactor;
use amenityd::engine::Engine;
use amenityd::http::{self, AppState};
use amenityd::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("AMENITYD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    amenityd::observability::init(metrics_port);

    let port = std::env::var("AMENITYD_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("AMENITYD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("AMENITYD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let api_token = std::env::var("AMENITYD_TOKEN").unwrap_or_else(|_| "amenityd".into());
    let compact_threshold: u64 = std::env::var("AMENITYD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let wal_path = PathBuf::from(&data_dir).join("bookings.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(wal_path, notify)?);

    let compactor_engine = engine.clone();
    tokio::spawn(async move {
        compactor::run_compactor(compactor_engine, compact_threshold).await;
    });

    let state = Arc::new(AppState { engine, api_token });
    let app = http::router(state);

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("amenityd listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  compact_threshold: {compact_threshold}");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight requests
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received, draining connections");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("amenityd stopped");
    Ok(())
}
