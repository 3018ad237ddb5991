use std::collections::HashSet;
use std::path::{Path, PathBuf};

use garde::Validate;
use serde::{Deserialize, Serialize};

/// Upper bound on artifacts a single descriptor may request.
pub const MAX_OUTPUTS: u32 = 10;

/// Immutable configuration for one product-to-image request.
///
/// Created once from the batch file and never mutated; a re-run is a fresh
/// Job built from the same descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct JobDescriptor {
    #[garde(length(min = 1, max = 200))]
    pub id: String,

    #[garde(skip)]
    pub source_image_path: PathBuf,

    #[garde(length(min = 1, max = 200))]
    pub product_type: String,

    #[garde(length(min = 1, max = 200))]
    pub template_key: String,

    #[garde(length(min = 1, max = 100))]
    pub quality_preset: String,

    #[serde(default = "default_num_outputs")]
    #[garde(range(min = 1, max = MAX_OUTPUTS))]
    pub num_outputs: u32,

    #[serde(default = "default_enabled")]
    #[garde(skip)]
    pub enabled: bool,
}

fn default_num_outputs() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// On-disk batch file: either `{"jobs": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Wrapped { jobs: Vec<JobDescriptor> },
    Bare(Vec<JobDescriptor>),
}

/// Load and check every descriptor in a JSON batch file.
///
/// Problems here are configuration-level and abort the batch before any
/// job starts. Disabled descriptors are kept; the dispatcher filters them.
pub async fn load_batch(path: &Path) -> Result<Vec<JobDescriptor>, BatchError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BatchError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    parse_batch(&raw)
}

/// Parse a batch document already held in memory.
pub fn parse_batch(raw: &str) -> Result<Vec<JobDescriptor>, BatchError> {
    let descriptors = match serde_json::from_str::<BatchFile>(raw).map_err(BatchError::Parse)? {
        BatchFile::Wrapped { jobs } => jobs,
        BatchFile::Bare(jobs) => jobs,
    };

    let mut seen = HashSet::new();
    for descriptor in &descriptors {
        if !seen.insert(descriptor.id.as_str()) {
            return Err(BatchError::DuplicateId(descriptor.id.clone()));
        }
        if descriptor.id.trim().is_empty() {
            return Err(BatchError::Invalid {
                id: descriptor.id.clone(),
                reason: "id must not be blank".to_string(),
            });
        }
    }

    Ok(descriptors)
}

/// Keep only the descriptors that should become Jobs, preserving order.
pub fn enabled_only(descriptors: Vec<JobDescriptor>) -> Vec<JobDescriptor> {
    descriptors.into_iter().filter(|d| d.enabled).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Failed to read batch file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse batch file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate descriptor id in batch: {0}")]
    DuplicateId(String),

    #[error("Invalid descriptor {id:?}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("Batch contains no enabled descriptors")]
    EmptyBatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_with_defaults() {
        let raw = r#"{"jobs": [{
            "id": "shoe-01",
            "source_image_path": "upload_images/shoe.png",
            "product_type": "Shoes",
            "template_key": "cafe",
            "quality_preset": "standard"
        }]}"#;

        let jobs = parse_batch(raw).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].num_outputs, 1);
        assert!(jobs[0].enabled);
    }

    #[test]
    fn test_parse_bare_array() {
        let raw = r#"[
            {"id": "a", "source_image_path": "a.png", "product_type": "Bags",
             "template_key": "street", "quality_preset": "hd", "num_outputs": 2},
            {"id": "b", "source_image_path": "b.png", "product_type": "Hat",
             "template_key": "studio", "quality_preset": "hd", "enabled": false}
        ]"#;

        let jobs = parse_batch(raw).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].num_outputs, 2);
        assert!(!jobs[1].enabled);
        assert_eq!(enabled_only(jobs).len(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let raw = r#"[
            {"id": "a", "source_image_path": "a.png", "product_type": "Bags",
             "template_key": "street", "quality_preset": "hd"},
            {"id": "a", "source_image_path": "b.png", "product_type": "Bags",
             "template_key": "street", "quality_preset": "hd"}
        ]"#;

        assert!(matches!(parse_batch(raw), Err(BatchError::DuplicateId(id)) if id == "a"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(parse_batch("{\"jobs\": 3}"), Err(BatchError::Parse(_))));
    }
}
