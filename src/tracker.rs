//! Collaborators of the control loop.
//!
//! The pose estimation itself lives in an external tracking engine. The loop only needs:
//! - `TrackingEngine`: set up once, then one `step` per iteration
//! - `PoseProvider`: the current body pose, for the measurement log
//! - `Viewer`: optional per-iteration display hook
//!
//! `StaticPoseEngine` holds a fixed initial pose and performs no optimization. It stands in
//! for a real engine in the driver binary and in tests.

use anyhow::{anyhow, Result};
use nalgebra::Matrix4;

use crate::frame::Frame;

/// Frames consumed by one iteration. `None` when the stream is not attached or has
/// nothing published yet.
#[derive(Clone, Debug, Default)]
pub struct FrameSet {
    pub color: Option<Frame>,
    pub depth: Option<Frame>,
}

impl FrameSet {
    pub fn color_load_index(&self) -> Option<u64> {
        self.color.as_ref().and_then(Frame::source_index)
    }

    pub fn depth_load_index(&self) -> Option<u64> {
        self.depth.as_ref().and_then(Frame::source_index)
    }
}

/// Read access to a tracked body's pose.
pub trait PoseProvider {
    /// Body-to-world transform, homogeneous, row-major when logged.
    fn body2world_pose(&self) -> Matrix4<f32>;
}

/// External pose tracker driven by the control loop.
pub trait TrackingEngine {
    fn name(&self) -> &str;

    /// One-time setup. Called by `prepare` before the first step.
    fn set_up(&mut self) -> Result<()>;

    /// Run one tracking iteration. May block (rendering, optimization). An error stops
    /// the loop.
    fn step(&mut self, iteration: u64, frames: &FrameSet) -> Result<()>;

    /// Optional error metrics logged alongside the pose.
    fn error_terms(&self) -> [Option<f32>; 4] {
        [None; 4]
    }
}

/// Per-iteration display hook. Failures are logged, never fatal.
pub trait Viewer {
    fn name(&self) -> &str;

    fn update_viewer(
        &mut self,
        iteration: u64,
        frames: &FrameSet,
        pose: &Matrix4<f32>,
    ) -> Result<()>;
}

/// A named rigid body and its current pose.
#[derive(Clone, Debug, PartialEq)]
pub struct Body {
    name: String,
    body2world_pose: Matrix4<f32>,
}

impl Body {
    pub fn new(name: &str, body2world_pose: Matrix4<f32>) -> Self {
        Self {
            name: name.to_string(),
            body2world_pose,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PoseProvider for Body {
    fn body2world_pose(&self) -> Matrix4<f32> {
        self.body2world_pose
    }
}

/// Engine that keeps a body at a fixed pose.
///
/// Steps fail only when `require_color` is set and the iteration has no real color frame,
/// which exercises the loop's fatal-step path.
pub struct StaticPoseEngine {
    name: String,
    body: Body,
    require_color: bool,
    set_up: bool,
    steps: u64,
}

impl StaticPoseEngine {
    pub fn new(name: &str, body: Body) -> Self {
        Self {
            name: name.to_string(),
            body,
            require_color: false,
            set_up: false,
            steps: 0,
        }
    }

    pub fn with_required_color(mut self, require_color: bool) -> Self {
        self.require_color = require_color;
        self
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl TrackingEngine for StaticPoseEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_up(&mut self) -> Result<()> {
        if !is_rigid_transform(&self.body.body2world_pose) {
            return Err(anyhow!(
                "engine {}: initial pose of {} is not a rigid transform",
                self.name,
                self.body.name()
            ));
        }
        self.set_up = true;
        Ok(())
    }

    fn step(&mut self, iteration: u64, frames: &FrameSet) -> Result<()> {
        if !self.set_up {
            return Err(anyhow!("set up engine {} first", self.name));
        }
        if self.require_color {
            match &frames.color {
                Some(frame) if !frame.is_placeholder() => {}
                _ => {
                    return Err(anyhow!(
                        "engine {}: no color frame for iteration {}",
                        self.name,
                        iteration
                    ))
                }
            }
        }
        self.steps += 1;
        Ok(())
    }
}

impl PoseProvider for StaticPoseEngine {
    fn body2world_pose(&self) -> Matrix4<f32> {
        self.body.body2world_pose()
    }
}

/// Orthonormal rotation block, bottom row `0 0 0 1`.
pub fn is_rigid_transform(pose: &Matrix4<f32>) -> bool {
    const TOLERANCE: f32 = 1e-3;
    let bottom_ok = pose.fixed_view::<1, 3>(3, 0).iter().all(|v| v.abs() < TOLERANCE)
        && (pose[(3, 3)] - 1.0).abs() < TOLERANCE;
    let rotation = pose.fixed_view::<3, 3>(0, 0).into_owned();
    let orthonormal = (rotation.transpose() * rotation - nalgebra::Matrix3::identity())
        .iter()
        .all(|v| v.abs() < TOLERANCE);
    bottom_ok && orthonormal && rotation.determinant() > 0.0
}
