use sea_orm::Database;
use secureteach_server::{
    config::AppConfig,
    pipeline::WatermarkPipeline,
    roster::{HttpRoster, StaticRoster, StudentRoster},
    storage::UploadLayout,
    watermark::ProcessRunner,
    worker,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Load .env if present (dotenvy)
    dotenvy::dotenv().ok();

    secureteach_server::telemetry::init_telemetry("secureteach-worker");

    let config = AppConfig::from_env();
    let (prometheus_layer, metric_handle) = axum_prometheus::PrometheusMetricLayer::pair();

    // Spawn metrics server
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route(
                "/metrics",
                axum::routing::get(|| async move { metric_handle.render() }),
            )
            .layer(prometheus_layer);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 9091));
        tracing::info!("Metrics server listening on {}", addr);
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("Metrics server stopped: {}", e);
                }
            }
            Err(e) => tracing::error!("Metrics server could not bind {}: {}", addr, e),
        }
    });

    let db = Database::connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let redis_client = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");

    let roster: Arc<dyn StudentRoster> = match &config.roster_url {
        Some(url) => {
            tracing::info!("Using student roster at {}", url);
            Arc::new(HttpRoster::new(url.clone(), config.roster_timeout))
        }
        None => {
            tracing::warn!("ROSTER_URL not set, using static student data");
            Arc::new(StaticRoster::default())
        }
    };

    let layout = UploadLayout::new(config.upload_dir.clone());
    layout
        .ensure_dirs()
        .await
        .expect("Failed to create upload directories");

    let runner = ProcessRunner::new(config.watermark_concurrency, config.watermark_timeout);
    let pipeline = WatermarkPipeline::new(roster, runner, config.ffmpeg_bin.clone(), layout);

    tracing::info!(
        workers = config.worker_concurrency,
        transcoders = config.watermark_concurrency,
        "Starting watermark workers..."
    );

    worker::start_workers(
        redis_client,
        db,
        config.worker_concurrency,
        pipeline,
        config.watermark_max_retries,
    )
    .await;

    // Keep the main process alive
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutting down worker process"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }
}
