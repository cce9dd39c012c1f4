use std::path::Path;

/// Remove a downloaded file. A missing file is fine; other failures are
/// logged and otherwise ignored. Returns whether a file was removed.
pub async fn discard_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}
