//! The upload pipeline.
//!
//! An upload moves through [`UploadStage`] in order. The API handler covers
//! `Received` and `DirectoryReady` and queues the video; the worker covers the
//! rest through [`WatermarkPipeline`]. Any failure stops the sequence.

use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::video;
use crate::roster::{fetch_or_placeholder, StudentRoster};
use crate::storage::UploadLayout;
use crate::watermark::{
    apply_watermark, overlay_text, ProcessRunner, ProcessingFailed, WatermarkJob,
    WatermarkOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UploadStage {
    Received,
    DirectoryReady,
    StudentDataFetched,
    Watermarked,
    Persisted,
}

impl UploadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::DirectoryReady => "directory_ready",
            Self::StudentDataFetched => "student_data_fetched",
            Self::Watermarked => "watermarked",
            Self::Persisted => "persisted",
        }
    }

    /// Log entry into this stage for `video_id`.
    pub fn enter(self, video_id: Uuid) -> Self {
        tracing::info!(video_id = %video_id, stage = self.as_str(), "Upload stage reached");
        self
    }
}

/// Inputs of the watermark step for one stored video.
#[derive(Debug, Clone)]
pub struct WatermarkRequest {
    pub video_id: Uuid,
    pub teacher_id: i32,
    pub raw_path: PathBuf,
    pub options: WatermarkOptions,
}

impl From<&video::Model> for WatermarkRequest {
    fn from(video: &video::Model) -> Self {
        Self {
            video_id: video.id,
            teacher_id: video.teacher_id,
            raw_path: PathBuf::from(&video.raw_file_path),
            options: video.watermark_options(),
        }
    }
}

/// Worker half of the upload: fetch the viewer identity and burn it in.
#[derive(Clone)]
pub struct WatermarkPipeline {
    roster: Arc<dyn StudentRoster>,
    runner: ProcessRunner,
    ffmpeg: PathBuf,
    layout: UploadLayout,
}

impl WatermarkPipeline {
    pub fn new(
        roster: Arc<dyn StudentRoster>,
        runner: ProcessRunner,
        ffmpeg: PathBuf,
        layout: UploadLayout,
    ) -> Self {
        Self {
            roster,
            runner,
            ffmpeg,
            layout,
        }
    }

    /// Produce the processed file for `request` and return its path.
    ///
    /// Safe to call again for the same video: the previous output is replaced
    /// atomically.
    pub async fn watermark(&self, request: &WatermarkRequest) -> Result<PathBuf, ProcessingFailed> {
        let student = fetch_or_placeholder(self.roster.as_ref(), request.teacher_id).await;
        UploadStage::StudentDataFetched.enter(request.video_id);

        let job = WatermarkJob {
            input: request.raw_path.clone(),
            output: self.layout.processed_path(request.video_id),
            text: overlay_text(&student, &request.options),
            options: request.options.clone(),
        };

        let output = apply_watermark(&self.runner, &self.ffmpeg, &job).await?;
        tracing::info!(
            video_id = %request.video_id,
            elapsed = ?output.elapsed,
            "Watermark applied"
        );
        UploadStage::Watermarked.enter(request.video_id);
        Ok(job.output)
    }
}
