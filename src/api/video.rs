use axum::{
    extract::{multipart::Field, Extension, Multipart, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::video::{self, SecurityOptions, VideoStatus};
use crate::error::{AppError, AppResult, ValidationError};
use crate::pipeline::UploadStage;
use crate::queue::enqueue_or_fail;
use crate::storage::{remove_quietly, UploadLayout};
use crate::token::Claims;
use crate::watermark::WatermarkOptions;

#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    10
}

/// What callers get to see of a video. File paths and failure detail are
/// only shown to the owning teacher.
#[derive(Debug, Serialize)]
pub struct VideoView {
    pub id: Uuid,
    pub title: String,
    pub teacher_id: i32,
    pub status: String,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub watermark_options: WatermarkOptions,
    pub security_options: SecurityOptions,
    pub created_at: chrono::DateTime<chrono::FixedOffset>,
}

impl VideoView {
    pub fn new(video: video::Model, owner: bool) -> Self {
        let watermark_options = video.watermark_options();
        let security_options = video.security_options();
        Self {
            id: video.id,
            title: video.title,
            teacher_id: video.teacher_id,
            status: video.status,
            retry_count: video.retry_count,
            raw_file_path: owner.then_some(video.raw_file_path),
            processed_file_path: video.processed_file_path.filter(|_| owner),
            last_error: video.last_error.filter(|_| owner),
            watermark_options,
            security_options,
            created_at: video.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VideoListResponse {
    pub videos: Vec<VideoView>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

/// Fields collected from the upload form.
#[derive(Default)]
struct UploadForm {
    title: Option<String>,
    raw_path: Option<std::path::PathBuf>,
    watermark_options: Option<WatermarkOptions>,
    security_options: Option<SecurityOptions>,
}

pub async fn upload_video(
    Extension(claims): Extension<Claims>,
    Extension(db): Extension<DatabaseConnection>,
    Extension(redis_client): Extension<redis::Client>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(layout): Extension<UploadLayout>,
    multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    // Reject before a single byte of the body is read.
    if !claims.is_teacher() {
        tracing::Span::current()
            .record("action", "upload_video_rejected")
            .record("error", "role_mismatch");
        return Err(ValidationError::RoleMismatch.into());
    }

    let video_id = Uuid::new_v4();
    tracing::Span::current().record("video_id", tracing::field::display(video_id));
    UploadStage::Received.enter(video_id);

    layout.ensure_dirs().await?;
    UploadStage::DirectoryReady.enter(video_id);

    let form = match read_upload_form(multipart, &layout, video_id, config.max_upload_bytes).await {
        Ok(form) => form,
        Err((e, partial)) => {
            if let Some(path) = partial {
                remove_quietly(&path).await;
            }
            return Err(e);
        }
    };

    let Some(raw_path) = form.raw_path else {
        return Err(ValidationError::MissingFile.into());
    };
    let title = match form.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        Some(title) => title,
        None => {
            remove_quietly(&raw_path).await;
            return Err(ValidationError::MissingTitle.into());
        }
    };

    let now = Utc::now().fixed_offset();
    let new_video = video::ActiveModel {
        id: Set(video_id),
        title: Set(title),
        teacher_id: Set(claims.sub),
        raw_file_path: Set(raw_path.to_string_lossy().into_owned()),
        processed_file_path: Set(None),
        status: Set(VideoStatus::Pending.to_string()),
        retry_count: Set(0),
        last_error: Set(None),
        watermark_options: Set(json!(form.watermark_options.unwrap_or_default())),
        security_options: Set(json!(form.security_options.unwrap_or_default())),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let saved = match new_video.insert(&db).await {
        Ok(v) => v,
        Err(e) => {
            remove_quietly(&raw_path).await;
            return Err(e.into());
        }
    };

    crate::metrics::record_status_change(None, VideoStatus::Pending);
    // On failure the row is FAILED and the raw upload kept for a retry.
    enqueue_or_fail(&db, &redis_client, saved.clone()).await?;

    tracing::Span::current()
        .record("action", "upload_video")
        .record("business_event", "Video queued for watermarking");
    metrics::counter!("secureteach_videos_uploaded_total").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "video": VideoView::new(saved, true),
        })),
    ))
}

/// Walk the multipart body. On error, returns the partially written raw file
/// so the caller can remove it.
async fn read_upload_form(
    mut multipart: Multipart,
    layout: &UploadLayout,
    video_id: Uuid,
    max_bytes: usize,
) -> Result<UploadForm, (AppError, Option<std::path::PathBuf>)> {
    let mut form = UploadForm::default();
    let bad = |msg: String| -> AppError { ValidationError::Invalid(msg).into() };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err((bad(e.to_string()), form.raw_path)),
        };
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "video" if form.raw_path.is_none() => {
                let file_name = field.file_name().unwrap_or("video.mp4").to_string();
                let path = layout.raw_path(video_id, &file_name);
                if let Err(e) = write_field(field, &path, max_bytes).await {
                    return Err((e, Some(path)));
                }
                form.raw_path = Some(path);
            }
            "title" => {
                let text = field.text().await.map_err(|e| (bad(e.to_string()), form.raw_path.clone()))?;
                form.title = Some(text);
            }
            "watermark_options" => {
                let text = field.text().await.map_err(|e| (bad(e.to_string()), form.raw_path.clone()))?;
                let options = serde_json::from_str(&text).map_err(|e| {
                    (bad(format!("Invalid watermark_options: {e}")), form.raw_path.clone())
                })?;
                form.watermark_options = Some(options);
            }
            "security_options" => {
                let text = field.text().await.map_err(|e| (bad(e.to_string()), form.raw_path.clone()))?;
                let options = serde_json::from_str(&text).map_err(|e| {
                    (bad(format!("Invalid security_options: {e}")), form.raw_path.clone())
                })?;
                form.security_options = Some(options);
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Stream a multipart field to `path`, enforcing `max_bytes`.
async fn write_field(mut field: Field<'_>, path: &FsPath, max_bytes: usize) -> AppResult<()> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0usize;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ValidationError::Invalid(e.to_string()))?
    {
        written += chunk.len();
        if written > max_bytes {
            return Err(ValidationError::FileTooLarge.into());
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if written == 0 {
        return Err(ValidationError::MissingFile.into());
    }
    Ok(())
}

pub async fn list_videos(
    Extension(claims): Extension<Claims>,
    Extension(db): Extension<DatabaseConnection>,
    Query(params): Query<PaginationParams>,
) -> AppResult<impl IntoResponse> {
    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let query = if claims.is_teacher() {
        video::Entity::find().filter(video::Column::TeacherId.eq(claims.sub))
    } else {
        video::Entity::find().filter(video::Column::Status.eq(VideoStatus::Processed.as_str()))
    };

    let paginator = query
        .order_by_desc(video::Column::CreatedAt)
        .paginate(&db, per_page);
    let counts = paginator.num_items_and_pages().await?;
    let videos = paginator.fetch_page(page - 1).await?;

    let views = videos
        .into_iter()
        .map(|v| {
            let owner = v.teacher_id == claims.sub && claims.is_teacher();
            VideoView::new(v, owner)
        })
        .collect();

    Ok(Json(VideoListResponse {
        videos: views,
        total: counts.number_of_items,
        page,
        per_page,
        total_pages: counts.number_of_pages,
    }))
}

/// Load a video the caller may see: owners see everything they uploaded,
/// everyone else only processed videos.
pub(crate) async fn find_visible(
    db: &DatabaseConnection,
    claims: &Claims,
    video_id: Uuid,
) -> AppResult<(video::Model, bool)> {
    let video = video::Entity::find_by_id(video_id)
        .one(db)
        .await?
        .ok_or(AppError::NotFound("Video"))?;

    let owner = claims.is_teacher() && video.teacher_id == claims.sub;
    let visible = owner
        || (!claims.is_teacher() && video.status == VideoStatus::Processed.as_str());
    if !visible {
        return Err(AppError::NotFound("Video"));
    }
    Ok((video, owner))
}

pub async fn get_video(
    Extension(claims): Extension<Claims>,
    Extension(db): Extension<DatabaseConnection>,
    Path(video_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let (video, owner) = find_visible(&db, &claims, video_id).await?;
    Ok(Json(VideoView::new(video, owner)))
}

/// Whether a manual retry may start for `video` at `now`.
///
/// `FAILED` videos always qualify. Queued or in-flight videos qualify once
/// they have not moved for `stale_after`, which covers a lost queue entry or a
/// worker that died mid-job.
pub fn retryable(video: &video::Model, now: DateTime<FixedOffset>, stale_after: Duration) -> bool {
    match VideoStatus::parse(&video.status) {
        Some(VideoStatus::Failed) => true,
        Some(VideoStatus::Pending | VideoStatus::Processing | VideoStatus::Retrying) => {
            let idle = now.signed_duration_since(video.updated_at);
            idle.to_std().map_or(false, |idle| idle > stale_after)
        }
        Some(VideoStatus::Processed) | None => false,
    }
}

/// Re-run the watermark step for a failed or stalled video. The raw upload is
/// reused.
pub async fn retry_video(
    Extension(claims): Extension<Claims>,
    Extension(db): Extension<DatabaseConnection>,
    Extension(redis_client): Extension<redis::Client>,
    Extension(config): Extension<Arc<AppConfig>>,
    Path(video_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let (video, owner) = find_visible(&db, &claims, video_id).await?;
    if !owner {
        return Err(AppError::NotFound("Video"));
    }
    if !retryable(&video, Utc::now().fixed_offset(), config.stale_job_after()) {
        return Err(ValidationError::NotRetryable.into());
    }
    if !tokio::fs::try_exists(&video.raw_file_path).await.unwrap_or(false) {
        return Err(ValidationError::Invalid("Raw upload is no longer available".to_string()).into());
    }

    let previous = VideoStatus::parse(&video.status);
    let mut active = video.into_active_model();
    active.status = Set(VideoStatus::Pending.to_string());
    active.retry_count = Set(0);
    active.last_error = Set(None);
    active.updated_at = Set(Utc::now().fixed_offset());
    let updated = active.update(&db).await?;
    crate::metrics::record_status_change(previous, VideoStatus::Pending);

    enqueue_or_fail(&db, &redis_client, updated.clone()).await?;

    tracing::Span::current()
        .record("video_id", tracing::field::display(video_id))
        .record("action", "retry_video")
        .record("business_event", "Video re-queued for watermarking");
    metrics::counter!("secureteach_watermark_manual_retries_total").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "queued", "video": VideoView::new(updated, true) })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(status: VideoStatus) -> video::Model {
        let now = Utc::now().fixed_offset();
        video::Model {
            id: Uuid::new_v4(),
            title: "Fractions".to_string(),
            teacher_id: 3,
            raw_file_path: "uploads/raw/x.mp4".to_string(),
            processed_file_path: Some("uploads/processed/x.mp4".to_string()),
            status: status.to_string(),
            retry_count: 1,
            last_error: Some("exit code 1".to_string()),
            watermark_options: json!({"position": "center"}),
            security_options: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn owner_view_includes_paths_and_errors() {
        let view = serde_json::to_value(VideoView::new(model(VideoStatus::Failed), true)).expect("json");
        assert_eq!(view["raw_file_path"], "uploads/raw/x.mp4");
        assert_eq!(view["last_error"], "exit code 1");
        assert_eq!(view["watermark_options"]["position"], "center");
    }

    #[test]
    fn failed_and_stalled_videos_are_retryable() {
        let stale_after = Duration::from_secs(60);
        let mut video = model(VideoStatus::Failed);
        let now = video.updated_at;
        assert!(retryable(&video, now, stale_after));

        for status in [VideoStatus::Pending, VideoStatus::Processing, VideoStatus::Retrying] {
            video.status = status.to_string();
            assert!(!retryable(&video, now + chrono::Duration::seconds(30), stale_after));
            assert!(retryable(&video, now + chrono::Duration::seconds(61), stale_after));
        }

        video.status = VideoStatus::Processed.to_string();
        assert!(!retryable(&video, now + chrono::Duration::hours(1), stale_after));
    }

    #[test]
    fn public_view_hides_paths_and_errors() {
        let view =
            serde_json::to_value(VideoView::new(model(VideoStatus::Processed), false)).expect("json");
        assert!(view.get("raw_file_path").is_none());
        assert!(view.get("processed_file_path").is_none());
        assert!(view.get("last_error").is_none());
        assert_eq!(view["security_options"]["prevent_download"], true);
    }
}
