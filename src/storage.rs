use std::path::{Path, PathBuf};
use uuid::Uuid;

/// On-disk layout of uploaded and processed videos.
///
/// ```text
/// <root>/raw/<video_id>.<ext>
/// <root>/processed/<video_id>.mp4
/// ```
#[derive(Debug, Clone)]
pub struct UploadLayout {
    root: PathBuf,
}

impl UploadLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    /// Create both directories if missing.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.raw_dir()).await?;
        tokio::fs::create_dir_all(self.processed_dir()).await
    }

    /// Where the untouched upload for `id` lives. Only the extension of the
    /// client-supplied file name is kept, and only if it is plain alphanumeric.
    pub fn raw_path(&self, id: Uuid, original_name: &str) -> PathBuf {
        let ext = Path::new(original_name)
            .extension()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty() && s.len() <= 8 && s.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_else(|| "mp4".to_string());
        self.raw_dir().join(format!("{id}.{ext}"))
    }

    pub fn processed_path(&self, id: Uuid) -> PathBuf {
        self.processed_dir().join(format!("{id}.mp4"))
    }
}

/// Delete `path`, logging instead of failing.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_path_ignores_client_directories() {
        let layout = UploadLayout::new("/srv/uploads");
        let id = Uuid::nil();
        assert_eq!(
            layout.raw_path(id, "../../etc/passwd.MOV"),
            PathBuf::from(format!("/srv/uploads/raw/{id}.mov"))
        );
        assert_eq!(
            layout.raw_path(id, "lecture"),
            PathBuf::from(format!("/srv/uploads/raw/{id}.mp4"))
        );
        assert_eq!(
            layout.raw_path(id, "x.m$4"),
            PathBuf::from(format!("/srv/uploads/raw/{id}.mp4"))
        );
    }

    #[tokio::test]
    async fn ensure_dirs_creates_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = UploadLayout::new(dir.path().join("uploads"));
        layout.ensure_dirs().await.expect("create");
        assert!(layout.raw_dir().is_dir());
        assert!(layout.processed_dir().is_dir());
        // Idempotent.
        layout.ensure_dirs().await.expect("create again");
    }
}
