use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};

use crate::entities::{user, video, video::VideoStatus};

const STATUSES: [VideoStatus; 5] = [
    VideoStatus::Pending,
    VideoStatus::Processing,
    VideoStatus::Retrying,
    VideoStatus::Processed,
    VideoStatus::Failed,
];

/// Seed the gauges from the database. Counting errors leave a gauge at zero.
pub async fn init_metrics(db: &DatabaseConnection) {
    let user_count = user::Entity::find().count(db).await.unwrap_or(0);
    metrics::gauge!("secureteach_users_total").set(user_count as f64);

    let mut video_count = 0;
    for status in STATUSES {
        let count = video::Entity::find()
            .filter(video::Column::Status.eq(status.as_str()))
            .count(db)
            .await
            .unwrap_or(0);
        video_count += count;
        metrics::gauge!("secureteach_videos", "status" => status.as_str()).set(count as f64);
    }

    tracing::info!(
        "Initialized metrics: Users={}, Videos={}",
        user_count,
        video_count
    );
}

/// Move one video between status gauges.
pub fn record_status_change(from: Option<VideoStatus>, to: VideoStatus) {
    if let Some(from) = from {
        metrics::gauge!("secureteach_videos", "status" => from.as_str()).decrement(1.0);
    }
    metrics::gauge!("secureteach_videos", "status" => to.as_str()).increment(1.0);
}

pub fn increment_users() {
    metrics::gauge!("secureteach_users_total").increment(1.0);
}

pub fn increment_watermark_failures(reason: &str) {
    metrics::counter!("secureteach_watermark_failures_total", "reason" => reason.to_string())
        .increment(1);
}

pub fn record_job_duration(seconds: f64) {
    metrics::histogram!("secureteach_watermark_job_duration_seconds").record(seconds);
}
