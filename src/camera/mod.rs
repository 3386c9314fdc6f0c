//! External camera adapters.
//!
//! `ExternalCamera` presents one stream (color or depth) to the control loop as a
//! "current frame", regardless of how frames arrive:
//! - Push-fed: an external producer (driver callback, message-bus subscriber) publishes
//!   frames through a `FramePublisher`. The camera never fetches anything itself.
//! - Replay: frames are loaded from a numbered file sequence, one per `update`.
//!
//! Lifecycle: Uninitialized -> Ready (via `setup`) -> Ready on every `update`.
//! Changing intrinsics or depth scale drops the camera back to Uninitialized.

pub mod metadata;
pub mod replay;

use anyhow::{anyhow, Context, Result};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::frame::{Frame, FramePublisher, ImageSlot, PixelFormat};
use replay::{ReplaySource, SequenceCursor, SequenceSpec};

/// Which channel of a camera a stream carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Color,
    Depth,
}

impl StreamKind {
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            StreamKind::Color => PixelFormat::Rgb8,
            StreamKind::Depth => PixelFormat::Depth16,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
        }
    }
}

/// Pinhole intrinsics of the camera that produced the frames.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fu: f32,
    pub fv: f32,
    pub ppu: f32,
    pub ppv: f32,
    pub width: u32,
    pub height: u32,
}

impl Intrinsics {
    pub fn new(fu: f32, fv: f32, ppu: f32, ppv: f32, width: u32, height: u32) -> Self {
        Self {
            fu,
            fv,
            ppu,
            ppv,
            width,
            height,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.fu.is_finite() && self.fu > 0.0 && self.fv.is_finite() && self.fv > 0.0) {
            return Err(anyhow!(
                "focal lengths must be positive (fu={}, fv={})",
                self.fu,
                self.fv
            ));
        }
        if !(self.ppu.is_finite() && self.ppv.is_finite()) {
            return Err(anyhow!("principal point must be finite"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "resolution must be non-zero ({}x{})",
                self.width,
                self.height
            ));
        }
        Ok(())
    }
}

enum CameraBackend {
    Push,
    Replay(ReplaySource),
}

/// Camera stream fed from outside the tracking loop.
pub struct ExternalCamera {
    name: String,
    kind: StreamKind,
    intrinsics: Option<Intrinsics>,
    depth_scale: Option<f32>,
    camera2world_pose: Matrix4<f32>,
    world2camera_pose: Matrix4<f32>,
    metafile: Option<PathBuf>,
    sequence: Option<SequenceSpec>,
    backend: CameraBackend,
    slot: Arc<ImageSlot>,
    set_up: bool,
}

impl ExternalCamera {
    /// Push-fed camera with no intrinsics yet.
    pub fn new(name: &str, kind: StreamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            intrinsics: None,
            depth_scale: None,
            camera2world_pose: Matrix4::identity(),
            world2camera_pose: Matrix4::identity(),
            metafile: None,
            sequence: None,
            backend: CameraBackend::Push,
            slot: Arc::new(ImageSlot::new()),
            set_up: false,
        }
    }

    /// Camera configured from a metafile, read during `setup`.
    pub fn from_metafile(name: &str, kind: StreamKind, metafile: impl Into<PathBuf>) -> Self {
        let mut camera = Self::new(name, kind);
        camera.metafile = Some(metafile.into());
        camera
    }

    pub fn with_intrinsics(mut self, intrinsics: Intrinsics) -> Self {
        self.intrinsics = Some(intrinsics);
        self
    }

    pub fn with_depth_scale(mut self, depth_scale: f32) -> Self {
        self.depth_scale = Some(depth_scale);
        self
    }

    /// Camera placement in the world frame. Validated during `setup`.
    pub fn with_camera2world_pose(mut self, pose: Matrix4<f32>) -> Self {
        self.camera2world_pose = pose;
        self
    }

    /// Replay frames from a file sequence instead of waiting for pushes.
    pub fn with_sequence(mut self, sequence: SequenceSpec) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Validate configuration and make a first frame available.
    ///
    /// Push-fed cameras publish a zero-filled placeholder if nothing arrived yet. Replay
    /// cameras load the frame at the sequence start. The camera stays not-ready on error.
    pub fn setup(&mut self) -> Result<()> {
        self.set_up = false;

        if let Some(path) = &self.metafile {
            let meta = metadata::load_metafile(path)
                .with_context(|| format!("set up camera {}", self.name))?;
            self.intrinsics = Some(meta.intrinsics);
            if meta.depth_scale.is_some() {
                self.depth_scale = meta.depth_scale;
            }
            if meta.sequence.is_some() {
                self.sequence = meta.sequence;
            }
            if let Some(pose) = meta.camera2world_pose {
                self.camera2world_pose = pose;
            }
        }

        self.world2camera_pose = self.camera2world_pose.try_inverse().ok_or_else(|| {
            anyhow!("camera {}: camera2world_pose is not invertible", self.name)
        })?;

        let intrinsics = self
            .intrinsics
            .ok_or_else(|| anyhow!("camera {}: intrinsics not set", self.name))?;
        intrinsics
            .validate()
            .with_context(|| format!("camera {}: invalid intrinsics", self.name))?;
        if self.kind == StreamKind::Depth {
            match self.depth_scale {
                Some(scale) if scale.is_finite() && scale > 0.0 => {}
                _ => {
                    return Err(anyhow!(
                        "camera {}: depth streams need a positive depth scale",
                        self.name
                    ))
                }
            }
        }

        match &self.sequence {
            Some(spec) => {
                let source = ReplaySource::open(spec.clone())
                    .with_context(|| format!("camera {}: open sequence", self.name))?;
                let first = source
                    .load_start(self.kind)
                    .with_context(|| format!("camera {}: load first frame", self.name))?;
                self.slot.publish(first);
                self.backend = CameraBackend::Replay(source);
            }
            None => {
                // Real frames are kept; a placeholder follows the current intrinsics.
                let stale = match self.slot.snapshot() {
                    None => true,
                    Some(frame) => {
                        frame.is_placeholder()
                            && (frame.width() != intrinsics.width
                                || frame.height() != intrinsics.height
                                || frame.format() != self.kind.pixel_format())
                    }
                };
                if stale {
                    self.slot.publish(Frame::placeholder(
                        self.kind.pixel_format(),
                        intrinsics.width,
                        intrinsics.height,
                    ));
                }
                self.backend = CameraBackend::Push;
            }
        }

        if self.slot.snapshot().is_none() {
            return Err(anyhow!("camera {}: no frame available", self.name));
        }
        self.set_up = true;
        log::info!(
            "camera {} ({}) ready: {}x{} {}",
            self.name,
            self.kind.label(),
            intrinsics.width,
            intrinsics.height,
            if self.is_replay() { "replay" } else { "push-fed" }
        );
        Ok(())
    }

    /// Bring the current frame up to date.
    ///
    /// Push-fed cameras always succeed; the producer is external. Replay cameras load the
    /// next file. `synchronized` is accepted for interface parity with blocking drivers;
    /// neither backend waits.
    pub fn update(&mut self, _synchronized: bool) -> Result<()> {
        if !self.set_up {
            return Err(anyhow!("set up camera {} first", self.name));
        }
        match &mut self.backend {
            CameraBackend::Push => Ok(()),
            CameraBackend::Replay(source) => {
                let frame = source
                    .load_next(self.kind)
                    .with_context(|| format!("camera {}", self.name))?;
                self.slot.publish(frame);
                Ok(())
            }
        }
    }

    /// Producer entry point. Frames whose pixel format does not match the stream are
    /// rejected.
    pub fn inject(&self, frame: Frame) -> Result<()> {
        self.publisher()
            .publish(frame)
            .with_context(|| format!("camera {}", self.name))
    }

    /// Handle for a producer thread. Stays valid across `setup` calls.
    pub fn publisher(&self) -> FramePublisher {
        FramePublisher::new(self.slot.clone(), self.kind.pixel_format())
    }

    pub fn snapshot(&self) -> Option<Frame> {
        self.slot.snapshot()
    }

    pub fn set_intrinsics(&mut self, intrinsics: Intrinsics) {
        self.intrinsics = Some(intrinsics);
        self.set_up = false;
    }

    pub fn set_depth_scale(&mut self, depth_scale: f32) {
        self.depth_scale = Some(depth_scale);
        self.set_up = false;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn intrinsics(&self) -> Option<Intrinsics> {
        self.intrinsics
    }

    pub fn depth_scale(&self) -> Option<f32> {
        self.depth_scale
    }

    pub fn camera2world_pose(&self) -> Matrix4<f32> {
        self.camera2world_pose
    }

    /// Inverse of `camera2world_pose`, refreshed by `setup`.
    pub fn world2camera_pose(&self) -> Matrix4<f32> {
        self.world2camera_pose
    }

    pub fn is_set_up(&self) -> bool {
        self.set_up
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.backend, CameraBackend::Replay(_))
    }

    /// Load index of the frame currently held, if the producer tagged one.
    pub fn load_index(&self) -> Option<u64> {
        self.slot.snapshot().and_then(|frame| frame.source_index())
    }

    /// Replay position, for replay cameras that are set up.
    pub fn sequence_cursor(&self) -> Option<SequenceCursor> {
        match &self.backend {
            CameraBackend::Replay(source) => Some(source.cursor()),
            CameraBackend::Push => None,
        }
    }

    /// True when a non-wrapping replay has handed out every file.
    pub fn is_exhausted(&self) -> bool {
        match &self.backend {
            CameraBackend::Replay(source) => source.is_exhausted(),
            CameraBackend::Push => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
