//! Test fixtures: descriptors backed by real files in a temp directory

use std::path::{Path, PathBuf};

use product_visualizer::models::descriptor::JobDescriptor;

/// Smallest header `image::guess_format` recognises as PNG.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

/// Write a PNG-looking source image and return its path.
pub fn write_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.png"));
    std::fs::write(&path, PNG_BYTES).expect("write source image");
    path
}

/// Enabled descriptor whose source image exists under `dir`.
pub fn descriptor(dir: &Path, id: &str) -> JobDescriptor {
    JobDescriptor {
        id: id.to_string(),
        source_image_path: write_source(dir, id),
        product_type: "Running Shoes".to_string(),
        template_key: "street".to_string(),
        quality_preset: "standard".to_string(),
        num_outputs: 1,
        enabled: true,
    }
}

/// Descriptor pointing at a file that does not exist.
pub fn missing_source(dir: &Path, id: &str) -> JobDescriptor {
    JobDescriptor {
        source_image_path: dir.join("does-not-exist.png"),
        ..descriptor_without_file(id)
    }
}

pub fn disabled(dir: &Path, id: &str) -> JobDescriptor {
    JobDescriptor {
        enabled: false,
        ..descriptor(dir, id)
    }
}

pub fn with_outputs(dir: &Path, id: &str, num_outputs: u32) -> JobDescriptor {
    JobDescriptor {
        num_outputs,
        ..descriptor(dir, id)
    }
}

/// `count` descriptors named `{prefix}-{n}`.
pub fn batch(dir: &Path, prefix: &str, count: usize) -> Vec<JobDescriptor> {
    (0..count)
        .map(|n| descriptor(dir, &format!("{prefix}-{n}")))
        .collect()
}

fn descriptor_without_file(id: &str) -> JobDescriptor {
    JobDescriptor {
        id: id.to_string(),
        source_image_path: PathBuf::new(),
        product_type: "Running Shoes".to_string(),
        template_key: "street".to_string(),
        quality_preset: "standard".to_string(),
        num_outputs: 1,
        enabled: true,
    }
}
