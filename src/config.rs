use anyhow::{anyhow, Result};
use nalgebra::Matrix4;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::camera::replay::SequenceSpec;
use crate::camera::{ExternalCamera, Intrinsics, StreamKind};
use crate::control::{AcquisitionPolicy, LoopConfig, DEFAULT_RATE_HZ};

const DEFAULT_MEASUREMENT_PATH: &str = "measurements/offline_meas.csv";
const DEFAULT_BODY_NAME: &str = "body";
const DEFAULT_FEED_PREFIX: &str = "scene_";
const DEFAULT_FEED_LEADING_ZEROS: usize = 6;
const DEFAULT_COLOR_INTRINSICS: Intrinsics = Intrinsics {
    fu: 921.768_5,
    fv: 920.545_5,
    ppu: 654.914_55,
    ppv: 350.659_85,
    width: 1280,
    height: 720,
};

#[derive(Debug, Deserialize, Default)]
struct RunConfigFile {
    rate_hz: Option<u32>,
    max_iterations: Option<u64>,
    acquisition: Option<String>,
    measurement: Option<MeasurementConfigFile>,
    color_camera: Option<CameraConfigFile>,
    depth_camera: Option<CameraConfigFile>,
    body: Option<BodyConfigFile>,
    push_feed: Option<PushFeedConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MeasurementConfigFile {
    enabled: Option<bool>,
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    metafile: Option<PathBuf>,
    intrinsics: Option<Intrinsics>,
    depth_scale: Option<f32>,
    /// Row-major 4x4 camera-to-world transform.
    camera2world_pose: Option<[[f32; 4]; 4]>,
}

#[derive(Debug, Deserialize, Default)]
struct BodyConfigFile {
    name: Option<String>,
    /// Row-major 4x4 body-to-world transform.
    pose: Option<[[f32; 4]; 4]>,
}

#[derive(Debug, Deserialize, Default)]
struct PushFeedConfigFile {
    directory: Option<PathBuf>,
    prefix: Option<String>,
    leading_zeros: Option<usize>,
    extension: Option<String>,
    rate_hz: Option<u32>,
    wrap: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub loop_config: LoopConfig,
    pub measurement_path: Option<PathBuf>,
    pub color_camera: Option<CameraSettings>,
    pub depth_camera: Option<CameraSettings>,
    pub body_name: String,
    pub initial_pose: Matrix4<f32>,
    pub push_feed: Option<PushFeedSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub metafile: Option<PathBuf>,
    pub intrinsics: Option<Intrinsics>,
    pub depth_scale: Option<f32>,
    pub camera2world_pose: Option<Matrix4<f32>>,
}

/// Image files pushed into the color camera by a producer thread. The rate defaults to
/// the loop rate after environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFeedSettings {
    pub sequence: SequenceSpec,
    pub rate_hz: u32,
}

impl CameraSettings {
    /// Build the camera. A metafile takes precedence over inline values at setup time.
    pub fn build(&self, name: &str, kind: StreamKind) -> ExternalCamera {
        let mut camera = match &self.metafile {
            Some(path) => ExternalCamera::from_metafile(name, kind, path),
            None => ExternalCamera::new(name, kind),
        };
        if let Some(intrinsics) = self.intrinsics {
            camera = camera.with_intrinsics(intrinsics);
        }
        if let Some(scale) = self.depth_scale {
            camera = camera.with_depth_scale(scale);
        }
        if let Some(pose) = self.camera2world_pose {
            camera = camera.with_camera2world_pose(pose);
        }
        camera
    }
}

impl RunConfig {
    /// Load from the file named by `POSE_LOOP_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("POSE_LOOP_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RunConfigFile::default(),
        };
        let feed_rate_hz = file_cfg.push_feed.as_ref().and_then(|feed| feed.rate_hz);
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        if let Some(feed) = &mut cfg.push_feed {
            feed.rate_hz = feed_rate_hz.unwrap_or(cfg.loop_config.rate_hz);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RunConfigFile) -> Result<Self> {
        let acquisition = match file.acquisition.as_deref() {
            Some(policy) => policy.parse()?,
            None => AcquisitionPolicy::default(),
        };
        let loop_config = LoopConfig {
            rate_hz: file.rate_hz.unwrap_or(DEFAULT_RATE_HZ),
            max_iterations: file.max_iterations,
            acquisition,
            log_measurements: file
                .measurement
                .as_ref()
                .and_then(|m| m.enabled)
                .unwrap_or(true),
        };
        let measurement_path = if loop_config.log_measurements {
            Some(
                file.measurement
                    .and_then(|m| m.path)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MEASUREMENT_PATH)),
            )
        } else {
            None
        };
        let color_camera = Some(match file.color_camera {
            Some(camera) => camera_settings(camera),
            None => CameraSettings {
                metafile: None,
                intrinsics: Some(DEFAULT_COLOR_INTRINSICS),
                depth_scale: None,
                camera2world_pose: None,
            },
        });
        let depth_camera = file.depth_camera.map(camera_settings);
        let body_name = file
            .body
            .as_ref()
            .and_then(|body| body.name.clone())
            .unwrap_or_else(|| DEFAULT_BODY_NAME.to_string());
        let initial_pose = file
            .body
            .and_then(|body| body.pose)
            .map(|rows| Matrix4::from_fn(|r, c| rows[r][c]))
            .unwrap_or_else(Matrix4::identity);
        let push_feed = match file.push_feed {
            Some(feed) => Some(push_feed_settings(feed)?),
            None => None,
        };
        Ok(Self {
            loop_config,
            measurement_path,
            color_camera,
            depth_camera,
            body_name,
            initial_pose,
            push_feed,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(rate) = std::env::var("POSE_LOOP_RATE_HZ") {
            self.loop_config.rate_hz = rate
                .trim()
                .parse()
                .map_err(|_| anyhow!("POSE_LOOP_RATE_HZ must be an integer number of hertz"))?;
        }
        if let Ok(path) = std::env::var("POSE_LOOP_MEASUREMENT_PATH") {
            if !path.trim().is_empty() {
                self.measurement_path = Some(PathBuf::from(path));
                self.loop_config.log_measurements = true;
            }
        }
        if let Ok(policy) = std::env::var("POSE_LOOP_ACQUISITION") {
            self.loop_config.acquisition = policy.parse()?;
        }
        if let Ok(max) = std::env::var("POSE_LOOP_MAX_ITERATIONS") {
            let max: u64 = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("POSE_LOOP_MAX_ITERATIONS must be an integer"))?;
            self.loop_config.max_iterations = Some(max);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.loop_config.rate_hz == 0 {
            return Err(anyhow!("rate_hz must be greater than zero"));
        }
        for (label, camera) in [
            ("color_camera", &self.color_camera),
            ("depth_camera", &self.depth_camera),
        ] {
            if let Some(camera) = camera {
                if camera.metafile.is_none() && camera.intrinsics.is_none() {
                    return Err(anyhow!("{} needs a metafile or intrinsics", label));
                }
            }
        }
        if let Some(feed) = &self.push_feed {
            if feed.rate_hz == 0 {
                return Err(anyhow!("push_feed.rate_hz must be greater than zero"));
            }
        }
        Ok(())
    }
}

fn camera_settings(file: CameraConfigFile) -> CameraSettings {
    CameraSettings {
        metafile: file.metafile,
        intrinsics: file.intrinsics,
        depth_scale: file.depth_scale,
        camera2world_pose: file
            .camera2world_pose
            .map(|rows| Matrix4::from_fn(|r, c| rows[r][c])),
    }
}

fn push_feed_settings(file: PushFeedConfigFile) -> Result<PushFeedSettings> {
    let directory = file
        .directory
        .ok_or_else(|| anyhow!("push_feed.directory is required"))?;
    let mut sequence = SequenceSpec::new(directory)
        .with_prefix(file.prefix.as_deref().unwrap_or(DEFAULT_FEED_PREFIX))
        .with_leading_zeros(file.leading_zeros.unwrap_or(DEFAULT_FEED_LEADING_ZEROS))
        .with_wrap(file.wrap.unwrap_or(true));
    if let Some(extension) = file.extension {
        sequence = sequence.with_extension(&extension);
    }
    Ok(PushFeedSettings {
        sequence,
        rate_hz: file.rate_hz.unwrap_or(DEFAULT_RATE_HZ),
    })
}

fn read_config_file(path: &Path) -> Result<RunConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
