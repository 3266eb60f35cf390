pub mod command;
pub mod runner;

use std::path::{Path, PathBuf};

pub use command::{
    build_watermark_command, overlay_text, WatermarkCommand, WatermarkOptions, WatermarkPosition,
    WatermarkSize,
};
pub use runner::{FailureReason, ProcessRunner, ProcessingFailed, RunOutput};

/// One watermark invocation: read `input`, burn `text`, publish at `output`.
#[derive(Debug, Clone)]
pub struct WatermarkJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub text: String,
    pub options: WatermarkOptions,
}

/// Sibling of `output` used while the transcoder is still writing.
///
/// Keeps the extension so the transcoder picks the same container format.
pub fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!(".{}.{}.part.{}", stem, uuid::Uuid::new_v4(), ext.to_string_lossy()),
        None => format!(".{}.{}.part", stem, uuid::Uuid::new_v4()),
    };
    output.with_file_name(name)
}

/// Run `job` through `ffmpeg` and publish the result atomically.
pub async fn apply_watermark(
    runner: &ProcessRunner,
    ffmpeg: &Path,
    job: &WatermarkJob,
) -> Result<RunOutput, ProcessingFailed> {
    let staged = staging_path(&job.output);
    let cmd = build_watermark_command(ffmpeg, &job.input, &staged, &job.text, &job.options);
    runner.run_and_publish(&cmd, &staged, &job.output, None).await
}

#[cfg(test)]
mod tests {
    use super::runner::tests::{fake_transcoder, WRITES_LAST_ARG};
    use super::*;
    use std::time::Duration;

    #[test]
    fn staging_path_keeps_directory_and_extension() {
        let staged = staging_path(Path::new("/data/processed/abc.mp4"));
        assert_eq!(staged.parent(), Some(Path::new("/data/processed")));
        assert_eq!(staged.extension().and_then(|e| e.to_str()), Some("mp4"));
        let name = staged.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with(".abc."));
        assert_ne!(staged, staging_path(Path::new("/data/processed/abc.mp4")));
    }

    #[tokio::test]
    async fn apply_watermark_publishes_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ffmpeg = fake_transcoder(dir.path(), "ffmpeg", WRITES_LAST_ARG);
        let input = dir.path().join("raw.mp4");
        std::fs::write(&input, b"raw").expect("write input");

        let job = WatermarkJob {
            input,
            output: dir.path().join("processed.mp4"),
            text: "O'Brien; $(id)".to_string(),
            options: WatermarkOptions::default(),
        };
        apply_watermark(&ProcessRunner::new(1, Duration::from_secs(5)), &ffmpeg, &job)
            .await
            .expect("watermark");

        assert!(job.output.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
