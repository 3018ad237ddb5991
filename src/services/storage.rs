use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

/// Local directory store for downloaded artifacts.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write artifact bytes and return the saved path.
    ///
    /// Files are named `{descriptor}_{timestamp}_{job}_{index}.{ext}`, the
    /// extension detected from the bytes when the mime type does not settle it.
    pub async fn upload(
        &self,
        descriptor_id: &str,
        job_id: Uuid,
        index: usize,
        data: &[u8],
        mime_type: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })?;

        let job_short = job_id.simple().to_string();
        let filename = format!(
            "{}_{}_{}_{}.{}",
            sanitize_filename(descriptor_id),
            Utc::now().format("%Y%m%d_%H%M%S"),
            &job_short[..8],
            index + 1,
            extension_for(data, mime_type),
        );
        let path = self.root.join(filename);

        tokio::fs::write(&path, data)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Remove a stored artifact. Missing files are not an error.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Best-effort removal of every path, used to discard a partial result.
    pub async fn discard(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = self.delete(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to discard partial artifact");
            }
        }
    }
}

/// Replace anything that is not safe in a file name.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned: String = cleaned.chars().take(80).collect();
    if cleaned.trim_matches('_').is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

fn extension_for(data: &[u8], mime_type: Option<&str>) -> &'static str {
    if let Some(mime) = mime_type {
        if mime.starts_with("video/") {
            return "mp4";
        }
    }
    image::guess_format(data)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("png")
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Artifact store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
