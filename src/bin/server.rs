use axum::{routing::get, Extension, Router};
use sea_orm::{Database, DatabaseConnection};
use secureteach_server::{api, config::AppConfig, migrator, storage::UploadLayout, token::TokenKeys};
use std::net::SocketAddr;
use std::sync::Arc;

/// Room for multipart framing and the text fields on top of the file.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

#[tokio::main]
async fn main() {
    // Load .env if present (dotenvy)
    dotenvy::dotenv().ok();

    secureteach_server::telemetry::init_telemetry("secureteach-server");

    let config = AppConfig::from_env();
    let (prometheus_layer, metric_handle) = axum_prometheus::PrometheusMetricLayer::pair();

    let db = Database::connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let redis_client = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");

    use sea_orm_migration::MigratorTrait;
    migrator::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    secureteach_server::metrics::init_metrics(&db).await;

    let layout = UploadLayout::new(config.upload_dir.clone());
    layout
        .ensure_dirs()
        .await
        .expect("Failed to create upload directories");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = app(db, redis_client, Arc::new(config), layout, prometheus_layer, metric_handle);

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    // Peer addresses back the IP restriction on playback.
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("Server error");
}

fn app(
    db: DatabaseConnection,
    redis_client: redis::Client,
    config: Arc<AppConfig>,
    layout: UploadLayout,
    prometheus_layer: axum_prometheus::PrometheusMetricLayer<'static>,
    metric_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Router {
    let keys = TokenKeys::from_secret(&config.jwt_secret);
    let body_limit = config.max_upload_bytes + BODY_LIMIT_SLACK;
    let cors_origin = config
        .cors_origin
        .parse::<axum::http::HeaderValue>()
        .expect("CORS_ORIGIN must be a valid header value");

    api::routes()
        .layer(Extension(db))
        .layer(Extension(redis_client))
        .layer(Extension(keys))
        .layer(Extension(layout))
        .layer(Extension(config))
        .layer(prometheus_layer)
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<axum::body::Body>| {
                    let matched_path = request
                        .extensions()
                        .get::<axum::extract::MatchedPath>()
                        .map(|matched| matched.as_str());

                    // "METHOD /path", e.g. "POST /api/video/upload"
                    let span_name = if let Some(path) = matched_path {
                        format!("{} {}", request.method(), path)
                    } else {
                        format!("{} {}", request.method(), request.uri().path())
                    };

                    let user_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .or_else(|| {
                            request
                                .headers()
                                .get("x-real-ip")
                                .and_then(|v| v.to_str().ok())
                        })
                        .unwrap_or("unknown");

                    // The query string carries embed tokens; only the path is logged.
                    tracing::info_span!(
                        "request",
                        "otel.name" = span_name,
                        user_ip = user_ip,
                        method = ?request.method(),
                        path = request.uri().path(),
                        // Filled in by handlers
                        action = tracing::field::Empty,
                        user_id = tracing::field::Empty,
                        video_id = tracing::field::Empty,
                        business_event = tracing::field::Empty,
                        error = tracing::field::Empty,
                        status = tracing::field::Empty,
                        latency = tracing::field::Empty,
                    )
                })
                .on_request(|_request: &axum::http::Request<axum::body::Body>, _span: &tracing::Span| {})
                .on_response(|response: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                    span.record("status", tracing::field::display(response.status()));
                    span.record("latency", tracing::field::debug(latency));
                    tracing::info!("request completed");
                }),
        )
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(cors_origin)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                ])
                .allow_credentials(true),
        )
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}
