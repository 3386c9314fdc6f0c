//! Pose Loop
//!
//! Fixed-rate driver for an external pose tracking engine fed by live or recorded cameras.
//!
//! # Architecture
//!
//! Frames flow in one direction:
//!
//! 1. A producer (driver callback, message-bus subscriber, file replay) publishes frames
//!    into an `ImageSlot`. The slot holds only the latest frame.
//! 2. `ExternalCamera` presents that slot to the loop as a camera with intrinsics.
//! 3. `ControlLoop` snapshots every camera, steps the `TrackingEngine`, and appends the
//!    resulting body pose to the `MeasurementSink`.
//!
//! # Module Structure
//!
//! - `frame`: Frames and the latest-frame slot shared with producers
//! - `camera`: External camera adapter, metafiles, file-sequence replay
//! - `measurement`: Append-only CSV log of per-iteration poses
//! - `tracker`: Engine, pose provider and viewer seams
//! - `control`: Pacing and the batch/continuous control loop
//! - `config`: Run configuration (JSON file + environment)

pub mod camera;
pub mod config;
pub mod control;
pub mod frame;
pub mod measurement;
pub mod tracker;

pub use camera::replay::{SequenceCursor, SequenceSpec};
pub use camera::{ExternalCamera, Intrinsics, StreamKind};
pub use config::{CameraSettings, PushFeedSettings, RunConfig};
pub use control::{
    AcquisitionPolicy, BatchEnd, BatchSummary, ControlLoop, LoopConfig, PaceOutcome, Pacer,
    StepReport, StopHandle, DEFAULT_RATE_HZ,
};
pub use frame::{Frame, FramePublisher, ImageSlot, PixelFormat};
pub use measurement::{read_measurements, IterationRecord, MeasurementSink, MEASUREMENT_HEADER};
pub use tracker::{Body, FrameSet, PoseProvider, StaticPoseEngine, TrackingEngine, Viewer};
