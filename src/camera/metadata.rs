//! Camera metafiles.
//!
//! A metafile is a small TOML document:
//!
//! ```toml
//! depth_scale = 0.001          # depth streams only
//! camera2world_pose = [         # optional, row-major; identity when absent
//!     [1.0, 0.0, 0.0, 0.0],
//!     [0.0, 1.0, 0.0, 0.0],
//!     [0.0, 0.0, 1.0, 0.0],
//!     [0.0, 0.0, 0.0, 1.0],
//! ]
//!
//! [intrinsics]
//! fu = 921.77
//! fv = 920.55
//! ppu = 654.91
//! ppv = 350.66
//! width = 1280
//! height = 720
//!
//! [sequence]                   # optional; switches the camera to file replay
//! directory = "color"          # relative to the metafile
//! prefix = "scene_"
//! leading_zeros = 6
//! extension = "png"
//! ```

use anyhow::{anyhow, Result};
use nalgebra::Matrix4;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::replay::SequenceSpec;
use super::Intrinsics;

#[derive(Debug, Deserialize, Default)]
struct CameraMetafile {
    intrinsics: Option<Intrinsics>,
    depth_scale: Option<f32>,
    camera2world_pose: Option<[[f32; 4]; 4]>,
    sequence: Option<SequenceFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SequenceFile {
    directory: Option<PathBuf>,
    prefix: Option<String>,
    suffix: Option<String>,
    leading_zeros: Option<usize>,
    extension: Option<String>,
    start_index: Option<u64>,
    count: Option<u64>,
    wrap: Option<bool>,
}

/// Parsed contents of a camera metafile.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraMetadata {
    pub intrinsics: Intrinsics,
    pub depth_scale: Option<f32>,
    pub camera2world_pose: Option<Matrix4<f32>>,
    pub sequence: Option<SequenceSpec>,
}

/// Read a metafile. Intrinsics are required; everything else is optional.
pub fn load_metafile(path: &Path) -> Result<CameraMetadata> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read camera metafile {}: {}", path.display(), e))?;
    let file: CameraMetafile = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid camera metafile {}: {}", path.display(), e))?;

    let intrinsics = file.intrinsics.ok_or_else(|| {
        anyhow!(
            "camera metafile {} is missing the [intrinsics] table",
            path.display()
        )
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let sequence = file.sequence.map(|seq| sequence_from_file(seq, base));

    Ok(CameraMetadata {
        intrinsics,
        depth_scale: file.depth_scale,
        camera2world_pose: file
            .camera2world_pose
            .map(|rows| Matrix4::from_fn(|r, c| rows[r][c])),
        sequence,
    })
}

fn sequence_from_file(file: SequenceFile, base: &Path) -> SequenceSpec {
    let directory = match file.directory {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => base.join(dir),
        None => base.to_path_buf(),
    };
    let mut spec = SequenceSpec::new(directory);
    if let Some(prefix) = file.prefix {
        spec.prefix = prefix;
    }
    if let Some(suffix) = file.suffix {
        spec.suffix = suffix;
    }
    if let Some(extension) = file.extension {
        spec = spec.with_extension(&extension);
    }
    spec.leading_zeros = file.leading_zeros.unwrap_or(0);
    spec.start_index = file.start_index.unwrap_or(0);
    spec.count = file.count;
    spec.wrap = file.wrap.unwrap_or(false);
    spec
}
