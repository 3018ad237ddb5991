use std::path::{Path, PathBuf};

use garde::Validate;
use tokio::io::AsyncReadExt;

use crate::models::descriptor::JobDescriptor;

/// Source image extensions the providers accept.
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Bytes read from the source image to sniff its format.
const HEADER_LEN: usize = 64;

/// Check a descriptor before anything is sent to a provider.
///
/// Performs:
/// - Field constraints (non-empty strings, `num_outputs` in range)
/// - Enabled flag
/// - Source image existence and readability
/// - Extension and magic-byte check on the source image
pub async fn validate_descriptor(descriptor: &JobDescriptor) -> Result<(), ValidationError> {
    descriptor.validate().map_err(ValidationError::Fields)?;

    if !descriptor.enabled {
        return Err(ValidationError::Disabled);
    }

    let path = descriptor.source_image_path.as_path();
    check_extension(path)?;

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| ValidationError::SourceMissing(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(ValidationError::SourceMissing(path.to_path_buf()));
    }

    let header = read_header(path)
        .await
        .map_err(|source| ValidationError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

    image::guess_format(&header)
        .map_err(|_| ValidationError::UnrecognizedImage(path.to_path_buf()))?;

    Ok(())
}

fn check_extension(path: &Path) -> Result<(), ValidationError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedExtension(path.to_path_buf()))
    }
}

async fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut header).await?;
    Ok(header)
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Descriptor fields invalid: {0}")]
    Fields(garde::Report),

    #[error("Descriptor is disabled")]
    Disabled,

    #[error("Source image not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Source image {path} is not readable: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported source image extension: {0}")]
    UnsupportedExtension(PathBuf),

    #[error("Source file is not a recognised image: {0}")]
    UnrecognizedImage(PathBuf),
}
