//! Runs transcoder invocations out of process.
//!
//! Every run holds a permit from a shared semaphore for its whole lifetime, so
//! no more than `concurrency` transcoders exist at once no matter how many
//! jobs are in flight. Output is written to a staging path and renamed into
//! place only after the process exited cleanly and left a non-empty file.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::command::WatermarkCommand;

/// Most stderr kept per run; older output is discarded.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long to wait for stderr to drain once the process is gone.
const STDERR_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("could not start transcoder: {0}")]
    Spawn(String),

    #[error("transcoder exited with code {0}")]
    Exit(i32),

    #[error("transcoder was terminated by a signal")]
    Signal,

    #[error("transcoder exceeded the {0:?} ceiling and was killed")]
    Timeout(Duration),

    #[error("transcoder produced no output")]
    EmptyOutput,

    #[error("I/O error: {0}")]
    Io(String),
}

impl FailureReason {
    /// Short metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Exit(_) => "exit",
            Self::Signal => "signal",
            Self::Timeout(_) => "timeout",
            Self::EmptyOutput => "empty_output",
            Self::Io(_) => "io",
        }
    }
}

/// The transcoding step failed; `stderr` holds the tail of the tool's output.
#[derive(Debug, Clone, thiserror::Error)]
#[error("watermark processing failed: {reason}")]
pub struct ProcessingFailed {
    pub reason: FailureReason,
    pub stderr: String,
}

impl ProcessingFailed {
    fn new(reason: FailureReason) -> Self {
        Self {
            reason,
            stderr: String::new(),
        }
    }

    fn with_stderr(reason: FailureReason, stderr: String) -> Self {
        Self { reason, stderr }
    }
}

/// Captured result of a clean (exit code 0) run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub elapsed: Duration,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `cmd` and wait for it, killing it once the timeout expires.
    pub async fn run(
        &self,
        cmd: &WatermarkCommand,
        working_dir: Option<&Path>,
    ) -> Result<RunOutput, ProcessingFailed> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ProcessingFailed::new(FailureReason::Io(e.to_string())))?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| ProcessingFailed::new(FailureReason::Spawn(e.to_string())))?;

        let stderr_handle = child.stderr.take();
        let stderr_task = tokio::spawn(async move { read_tail(stderr_handle).await });

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let stderr = collect(stderr_task).await;
                let elapsed = start.elapsed();
                metrics::histogram!("secureteach_transcode_duration_seconds")
                    .record(elapsed.as_secs_f64());

                if status.success() {
                    Ok(RunOutput { elapsed, stderr })
                } else {
                    let reason = match status.code() {
                        Some(code) => FailureReason::Exit(code),
                        None => FailureReason::Signal,
                    };
                    Err(ProcessingFailed::with_stderr(reason, stderr))
                }
            }
            Ok(Err(e)) => Err(ProcessingFailed::new(FailureReason::Io(e.to_string()))),
            Err(_elapsed) => {
                tracing::warn!(
                    program = %cmd.program.display(),
                    timeout = ?self.timeout,
                    "Transcoder timed out, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::error!("Failed to kill timed out transcoder: {}", e);
                }
                let stderr = collect(stderr_task).await;
                Err(ProcessingFailed::with_stderr(
                    FailureReason::Timeout(self.timeout),
                    stderr,
                ))
            }
        }
    }

    /// Run `cmd`, which must write to `staged`, then publish `staged` at
    /// `destination`. Nothing is left at `staged` afterwards, whatever happens.
    pub async fn run_and_publish(
        &self,
        cmd: &WatermarkCommand,
        staged: &Path,
        destination: &Path,
        working_dir: Option<&Path>,
    ) -> Result<RunOutput, ProcessingFailed> {
        let result = match self.run(cmd, working_dir).await {
            Ok(output) => publish(staged, destination).await.map(|()| output),
            Err(e) => Err(e),
        };

        if result.is_err() {
            discard(staged).await;
        }
        result
    }
}

async fn publish(staged: &Path, destination: &Path) -> Result<(), ProcessingFailed> {
    let size = match tokio::fs::metadata(staged).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(ProcessingFailed::new(FailureReason::Io(e.to_string()))),
    };
    if size == 0 {
        return Err(ProcessingFailed::new(FailureReason::EmptyOutput));
    }

    tokio::fs::rename(staged, destination)
        .await
        .map_err(|e| ProcessingFailed::new(FailureReason::Io(e.to_string())))
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!("Failed to remove partial output {}: {}", path.display(), e),
    }
}

async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    // A grandchild may still hold the pipe open after the direct child exits.
    match tokio::time::timeout(STDERR_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

/// Drain a stream to EOF, keeping only the last [`MAX_STDERR_BYTES`].
async fn read_tail<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut tail = Vec::new();
    let Some(mut h) = handle else {
        return tail;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match h.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > MAX_STDERR_BYTES {
                    let excess = tail.len() - MAX_STDERR_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}
