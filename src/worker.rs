use chrono::Utc;
use redis::AsyncCommands;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, Set};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::entities::video::{self, VideoStatus};
use crate::pipeline::{UploadStage, WatermarkPipeline, WatermarkRequest};
use crate::queue::{enqueue_or_fail, WatermarkMessage, WATERMARK_QUEUE};
use crate::watermark::ProcessingFailed;

/// Longest `last_error` stored on a video row.
const MAX_LAST_ERROR_CHARS: usize = 500;

// Queue Monitoring
pub async fn start_queue_monitor(redis_client: redis::Client) {
    let redis_client = Arc::new(redis_client);

    tokio::spawn(async move {
        tracing::info!("Queue Monitor started");
        loop {
            let mut conn = match redis_client.get_multiplexed_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Queue Monitor: Failed to get redis conn: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(15)).await;
                    continue;
                }
            };

            let queue_len: redis::RedisResult<u64> = conn.llen(WATERMARK_QUEUE).await;
            match queue_len {
                Ok(len) => metrics::gauge!("secureteach_queue_depth", "queue" => WATERMARK_QUEUE)
                    .set(len as f64),
                Err(e) => tracing::error!("Failed to get {} len: {}", WATERMARK_QUEUE, e),
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(15)).await;
        }
    });
}

pub async fn start_workers(
    redis_client: redis::Client,
    db: DatabaseConnection,
    concurrency: usize,
    pipeline: WatermarkPipeline,
    max_retries: i32,
) {
    start_queue_monitor(redis_client.clone()).await;

    let db = Arc::new(db);
    let redis_client = Arc::new(redis_client);
    let pipeline = Arc::new(pipeline);

    for i in 0..concurrency {
        let db = db.clone();
        let redis_client = redis_client.clone();
        let pipeline = pipeline.clone();

        tokio::spawn(async move {
            tracing::info!("Worker {} started", i);
            loop {
                let mut conn = match redis_client.get_multiplexed_async_connection().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!("Worker {}: Failed to get redis conn: {}", i, e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let result: redis::RedisResult<(String, String)> =
                    conn.blpop(WATERMARK_QUEUE, 0.0).await;

                match result {
                    Ok((_key, payload)) => {
                        let message: WatermarkMessage = match serde_json::from_str(&payload) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::error!("Worker {}: Bad payload: {}", i, e);
                                continue;
                            }
                        };
                        process_video(&message, &db, &redis_client, &pipeline, max_retries).await;
                    }
                    Err(e) => {
                        tracing::error!("Worker {}: Redis error: {}", i, e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }
}

/// What happens to a video after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub status: VideoStatus,
    pub retry_count: i32,
    pub requeue: bool,
}

/// Automatic retries continue while the bumped count stays below `max_retries`.
pub fn failure_outcome(retry_count: i32, max_retries: i32) -> FailureOutcome {
    let retry_count = retry_count + 1;
    if retry_count < max_retries {
        FailureOutcome {
            status: VideoStatus::Retrying,
            retry_count,
            requeue: true,
        }
    } else {
        FailureOutcome {
            status: VideoStatus::Failed,
            retry_count,
            requeue: false,
        }
    }
}

/// Row-level summary of a failure: the reason and the last stderr line.
pub fn last_error_summary(err: &ProcessingFailed) -> String {
    let summary = match err.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => format!("{}: {}", err.reason, line.trim()),
        None => err.reason.to_string(),
    };
    summary.chars().take(MAX_LAST_ERROR_CHARS).collect()
}

async fn process_video(
    message: &WatermarkMessage,
    db: &DatabaseConnection,
    redis_client: &redis::Client,
    pipeline: &WatermarkPipeline,
    max_retries: i32,
) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let video_id = message.video_id;
    let span = tracing::info_span!(
        "process_video_job",
        "otel.name" = "process_video_job",
        video_id = %video_id
    );
    span.set_parent(message.parent_context());

    async move {
        tracing::info!("Dequeued video {} from {}", video_id, WATERMARK_QUEUE);
        let start_time = std::time::Instant::now();

        let video = match video::Entity::find_by_id(video_id).one(db).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                tracing::error!("Video {} not found in DB", video_id);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to load video {}: {}", video_id, e);
                metrics::counter!("secureteach_video_processing_errors_total", "stage" => "db_load").increment(1);
                return;
            }
        };
        if video.status == VideoStatus::Processed.as_str() {
            tracing::warn!("Video {} already processed, skipping", video_id);
            return;
        }
        let previous = VideoStatus::parse(&video.status);
        let request = WatermarkRequest::from(&video);
        let retry_count = video.retry_count;

        let mut active = video.into_active_model();
        active.status = Set(VideoStatus::Processing.to_string());
        active.updated_at = Set(Utc::now().fixed_offset());
        let video = match active.update(db).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to update status: {}", e);
                metrics::counter!("secureteach_video_processing_errors_total", "stage" => "db_update").increment(1);
                return;
            }
        };
        crate::metrics::record_status_change(previous, VideoStatus::Processing);

        let result = pipeline
            .watermark(&request)
            .instrument(tracing::info_span!("apply_watermark"))
            .await;

        match result {
            Ok(processed_path) => {
                let mut active = video.into_active_model();
                active.status = Set(VideoStatus::Processed.to_string());
                active.processed_file_path =
                    Set(Some(processed_path.to_string_lossy().into_owned()));
                active.last_error = Set(None);
                active.updated_at = Set(Utc::now().fixed_offset());
                match active.update(db).await {
                    Ok(_) => {
                        UploadStage::Persisted.enter(video_id);
                        crate::metrics::record_status_change(
                            Some(VideoStatus::Processing),
                            VideoStatus::Processed,
                        );
                        metrics::counter!("secureteach_video_processed_total").increment(1);
                    }
                    Err(e) => {
                        tracing::error!("Failed to update video {}: {}", video_id, e);
                        metrics::counter!("secureteach_video_processing_errors_total", "stage" => "db_final_update").increment(1);
                    }
                }
            }
            Err(err) => {
                // stderr can name server paths; it stays in the logs.
                tracing::error!(
                    reason = %err.reason,
                    stderr = %err.stderr,
                    "Watermarking failed for {}",
                    video_id
                );
                crate::metrics::increment_watermark_failures(err.reason.label());

                let outcome = failure_outcome(retry_count, max_retries);
                let mut active = video.into_active_model();
                active.status = Set(outcome.status.to_string());
                active.retry_count = Set(outcome.retry_count);
                active.last_error = Set(Some(last_error_summary(&err)));
                active.updated_at = Set(Utc::now().fixed_offset());
                let video = match active.update(db).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!("Failed to record failure for {}: {}", video_id, e);
                        return;
                    }
                };
                crate::metrics::record_status_change(Some(VideoStatus::Processing), outcome.status);

                if outcome.requeue {
                    tracing::warn!(
                        "Re-enqueueing video {} (attempt {} of {})",
                        video_id,
                        outcome.retry_count + 1,
                        max_retries
                    );
                    // A lost re-enqueue leaves the video FAILED, not RETRYING.
                    let _ = enqueue_or_fail(db, redis_client, video).await;
                } else {
                    tracing::warn!(
                        "Video {} marked FAILED after {} attempts; raw upload kept",
                        video_id,
                        outcome.retry_count
                    );
                }
            }
        }

        let duration = start_time.elapsed().as_secs_f64();
        crate::metrics::record_job_duration(duration);
    }
    .instrument(span)
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::FailureReason;

    #[test]
    fn first_failure_retries_then_gives_up() {
        let first = failure_outcome(0, 2);
        assert_eq!(first.status, VideoStatus::Retrying);
        assert_eq!(first.retry_count, 1);
        assert!(first.requeue);

        let second = failure_outcome(first.retry_count, 2);
        assert_eq!(second.status, VideoStatus::Failed);
        assert_eq!(second.retry_count, 2);
        assert!(!second.requeue);
    }

    #[test]
    fn zero_retries_fails_immediately() {
        let outcome = failure_outcome(0, 0);
        assert_eq!(outcome.status, VideoStatus::Failed);
        assert!(!outcome.requeue);
    }

    #[test]
    fn summary_uses_last_stderr_line() {
        let err = ProcessingFailed {
            reason: FailureReason::Exit(1),
            stderr: "frame=1\nmoov atom not found\n\n".to_string(),
        };
        assert_eq!(
            last_error_summary(&err),
            "transcoder exited with code 1: moov atom not found"
        );
    }

    #[test]
    fn summary_is_bounded() {
        let err = ProcessingFailed {
            reason: FailureReason::EmptyOutput,
            stderr: "x".repeat(5000),
        };
        assert_eq!(last_error_summary(&err).chars().count(), MAX_LAST_ERROR_CHARS);
    }
}
