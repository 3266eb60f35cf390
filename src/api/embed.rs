use axum::{extract::Extension, response::IntoResponse, Json};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::video::find_visible;
use crate::config::AppConfig;
use crate::entities::video::{SecurityOptions, VideoStatus};
use crate::error::{AppError, AppResult, ValidationError};
use crate::token::{Claims, TokenKeys};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedRequest {
    pub video_id: Uuid,
}

/// Iframe snippet pointing at the token-checked playback URL.
pub fn embed_snippet(
    base_url: &str,
    video_id: Uuid,
    token: &str,
    security: &SecurityOptions,
) -> String {
    let mut attrs = String::from(r#"frameborder="0" allowfullscreen"#);
    if security.prevent_download {
        attrs.push_str(r#" controlsList="nodownload""#);
    }
    if security.prevent_screen_capture {
        attrs.push_str(r#" data-prevent-capture="true""#);
    }
    format!(r#"<iframe src="{base_url}/videos/{video_id}?token={token}" {attrs}></iframe>"#)
}

pub async fn generate_embed_code(
    Extension(claims): Extension<Claims>,
    Extension(db): Extension<DatabaseConnection>,
    Extension(keys): Extension<TokenKeys>,
    Extension(config): Extension<Arc<AppConfig>>,
    Json(payload): Json<EmbedRequest>,
) -> AppResult<impl IntoResponse> {
    let (video, _owner) = find_visible(&db, &claims, payload.video_id).await?;
    if video.status != VideoStatus::Processed.as_str() {
        return Err(ValidationError::NotReady.into());
    }

    let token = keys
        .issue_embed(video.id, config.embed_token_ttl)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let expires_at = chrono::Utc::now()
        + chrono::Duration::seconds(config.embed_token_ttl.as_secs() as i64);

    tracing::Span::current()
        .record("video_id", tracing::field::display(video.id))
        .record("action", "generate_embed_code");
    metrics::counter!("secureteach_embed_codes_total").increment(1);

    Ok(Json(json!({
        "embedCode": embed_snippet(&config.public_base_url, video.id, &token, &video.security_options()),
        "expiresAt": expires_at,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_carries_token_and_security_flags() {
        let id = Uuid::nil();
        let html = embed_snippet("https://example.test", id, "abc.def.ghi", &SecurityOptions::default());
        assert!(html.starts_with(&format!(
            r#"<iframe src="https://example.test/videos/{id}?token=abc.def.ghi""#
        )));
        assert!(html.contains(r#"controlsList="nodownload""#));
        assert!(html.contains(r#"data-prevent-capture="true""#));

        let open = SecurityOptions {
            prevent_download: false,
            prevent_screen_capture: false,
            ..Default::default()
        };
        let html = embed_snippet("https://example.test", id, "t", &open);
        assert!(!html.contains("nodownload"));
        assert!(!html.contains("prevent-capture"));
    }
}
