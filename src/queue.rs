use chrono::Utc;
use redis::AsyncCommands;
use sea_orm::{ActiveModelTrait, DatabaseConnection, IntoActiveModel, Set};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::entities::video::{self, VideoStatus};

/// Redis list holding pending watermark jobs.
pub const WATERMARK_QUEUE: &str = "watermark_queue";

/// Queue payload. Only the id travels; the worker reloads the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkMessage {
    pub video_id: Uuid,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
}

impl WatermarkMessage {
    /// Message for `video_id` carrying the current span's trace context.
    pub fn new(video_id: Uuid) -> Self {
        use opentelemetry::propagation::TextMapPropagator;
        use opentelemetry_sdk::propagation::TraceContextPropagator;
        use tracing_opentelemetry::OpenTelemetrySpanExt;

        let mut trace_context = HashMap::new();
        let cx = tracing::Span::current().context();
        TraceContextPropagator::new().inject_context(&cx, &mut trace_context);

        Self {
            video_id,
            trace_context,
        }
    }

    /// Parent context for the worker span.
    pub fn parent_context(&self) -> opentelemetry::Context {
        use opentelemetry::propagation::TextMapPropagator;
        use opentelemetry_sdk::propagation::TraceContextPropagator;

        if self.trace_context.is_empty() {
            opentelemetry::Context::new()
        } else {
            TraceContextPropagator::new().extract(&self.trace_context)
        }
    }
}

pub async fn enqueue_watermark(
    redis_client: &redis::Client,
    message: &WatermarkMessage,
) -> redis::RedisResult<()> {
    let payload = serde_json::to_string(message).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "failed to encode queue payload",
            e.to_string(),
        ))
    })?;
    let mut conn = redis_client.get_multiplexed_async_connection().await?;
    let _: () = conn.rpush(WATERMARK_QUEUE, payload).await?;
    tracing::info!(video_id = %message.video_id, "Enqueued video to {}", WATERMARK_QUEUE);
    Ok(())
}

/// Enqueue `video` for watermarking. If the push fails the row is marked
/// `FAILED` so the owner can retry it; no row is left waiting on a job that
/// does not exist.
pub async fn enqueue_or_fail(
    db: &DatabaseConnection,
    redis_client: &redis::Client,
    video: video::Model,
) -> redis::RedisResult<()> {
    let video_id = video.id;
    let err = match enqueue_watermark(redis_client, &WatermarkMessage::new(video_id)).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    tracing::error!("Failed to enqueue video {}: {}", video_id, err);
    let previous = VideoStatus::parse(&video.status);
    let mut active = video.into_active_model();
    active.status = Set(VideoStatus::Failed.to_string());
    active.last_error = Set(Some(format!("enqueue failed: {err}")));
    active.updated_at = Set(Utc::now().fixed_offset());
    match active.update(db).await {
        Ok(_) => crate::metrics::record_status_change(previous, VideoStatus::Failed),
        Err(db_err) => tracing::error!("Failed to mark video {} as failed: {}", video_id, db_err),
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_without_trace_context_is_minimal() {
        let id = Uuid::nil();
        let message = WatermarkMessage {
            video_id: id,
            trace_context: HashMap::new(),
        };
        let json = serde_json::to_value(&message).expect("encode");
        assert_eq!(json, serde_json::json!({ "video_id": id }));

        let back: WatermarkMessage =
            serde_json::from_str(&format!(r#"{{"video_id":"{id}"}}"#)).expect("decode");
        assert!(back.trace_context.is_empty());
    }
}
