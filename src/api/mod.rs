pub mod auth;
pub mod embed;
pub mod middleware;
pub mod playback;
pub mod video;

use axum::{
    routing::{get, post},
    Router,
};

async fn health_check() -> &'static str {
    "OK"
}

/// All HTTP routes. Shared state (database, redis client, token keys, config,
/// upload layout) is expected as `Extension` layers added by the caller.
pub fn routes() -> Router {
    let auth_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/api/video", get(video::list_videos))
        .route("/api/video/upload", post(video::upload_video))
        .route("/api/video/:id", get(video::get_video))
        .route("/api/video/:id/retry", post(video::retry_video))
        .route("/api/embed/generate", post(embed::generate_embed_code))
        .route_layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        // Playback is authorized by the embed token in the query string.
        .route("/videos/:id", get(playback::serve_video))
        .merge(auth_routes)
        .merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::storage::UploadLayout;
    use crate::token::TokenKeys;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Extension;
    use http_body_util::BodyExt;
    use sea_orm::DatabaseConnection;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "test-secret-that-is-long-enough-for-hmac";

    fn app(upload_dir: &std::path::Path) -> Router {
        app_with_db(upload_dir, DatabaseConnection::Disconnected)
    }

    fn app_with_db(upload_dir: &std::path::Path, db: DatabaseConnection) -> Router {
        let config = AppConfig::for_tests(upload_dir.to_path_buf());
        routes()
            .layer(Extension(db))
            .layer(Extension(
                redis::Client::open("redis://127.0.0.1:1/").expect("redis url"),
            ))
            .layer(Extension(TokenKeys::from_secret(SECRET)))
            .layer(Extension(UploadLayout::new(upload_dir)))
            .layer(Extension(Arc::new(config)))
    }

    fn multipart_upload(token: Option<&str>) -> Request<Body> {
        let boundary = "X-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nFractions\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"a.mp4\"\r\n\
             Content-Type: video/mp4\r\n\r\nnot really a video\r\n--{boundary}--\r\n"
        );
        let mut builder = Request::post("/api/video/upload").header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).expect("request")
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn student_upload_is_rejected_before_anything_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = TokenKeys::from_secret(SECRET)
            .issue_session(2, "pupil", "student")
            .expect("token");

        let response = app(dir.path())
            .oneshot(multipart_upload(Some(&token)))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Only teachers can upload videos");
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(std::fs::read_dir(dir.path()).expect("dir").next().is_none());
    }

    #[tokio::test]
    async fn upload_without_token_is_unauthorized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = app(dir.path())
            .oneshot(multipart_upload(None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_session_token_is_forbidden() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = app(dir.path())
            .oneshot(multipart_upload(Some("not.a.jwt")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn playback_requires_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uri = format!("/videos/{}", Uuid::new_v4());
        let response = app(dir.path())
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn playback_rejects_token_for_another_video() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = TokenKeys::from_secret(SECRET)
            .issue_embed(Uuid::new_v4(), Duration::from_secs(900))
            .expect("token");
        let uri = format!("/videos/{}?token={token}", Uuid::new_v4());
        let response = app(dir.path())
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn processed_files_are_not_served_statically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = app(dir.path())
            .oneshot(
                Request::get("/uploads/processed/x.mp4")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_with_queue_down_leaves_video_failed() {
        use crate::entities::video::{self, VideoStatus};
        use sea_orm::{DatabaseBackend, MockDatabase};

        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("raw.mp4");
        std::fs::write(&raw, b"raw").expect("raw file");

        let now = chrono::Utc::now().fixed_offset();
        let failed = video::Model {
            id: Uuid::new_v4(),
            title: "Fractions".to_string(),
            teacher_id: 3,
            raw_file_path: raw.to_string_lossy().into_owned(),
            processed_file_path: None,
            status: VideoStatus::Failed.to_string(),
            retry_count: 2,
            last_error: Some("transcoder exited with code 1".to_string()),
            watermark_options: serde_json::json!({}),
            security_options: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let pending = video::Model {
            status: VideoStatus::Pending.to_string(),
            retry_count: 0,
            last_error: None,
            ..failed.clone()
        };
        let failed_again = video::Model {
            status: VideoStatus::Failed.to_string(),
            last_error: Some("enqueue failed".to_string()),
            ..pending.clone()
        };
        // find, update to PENDING, update back to FAILED
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![failed.clone()], vec![pending], vec![failed_again]])
            .into_connection();

        let token = TokenKeys::from_secret(SECRET)
            .issue_session(3, "ms.frizzle", "teacher")
            .expect("token");
        let request = Request::post(format!("/api/video/{}/retry", failed.id))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");

        let response = app_with_db(dir.path(), db.clone())
            .oneshot(request)
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let log = format!("{:?}", db.into_transaction_log());
        let pending_at = log.find("\"PENDING\"").expect("status reset to PENDING");
        let failed_at = log.rfind("\"FAILED\"").expect("status restored to FAILED");
        assert!(failed_at > pending_at, "{log}");
    }

    #[tokio::test]
    async fn health_is_public() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = app(dir.path())
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&bytes[..], b"OK");
    }
}
