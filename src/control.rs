//! Fixed-rate tracking control loop.
//!
//! Each iteration:
//! 1. Bring every attached camera up to date and snapshot its current frame
//! 2. Run one step of the tracking engine
//! 3. Update viewers and append the pose to the measurement log
//! 4. Sleep out the rest of the period
//!
//! Pacing is best-effort. An iteration that overruns its period starts the next one
//! immediately; the lost time is never made up and frames are never skipped to catch up.
//!
//! Two ways to drive it:
//! - Batch: `run()` loops until the input is exhausted, an iteration limit is reached, or
//!   the `StopHandle` fires.
//! - Continuous: the host calls `prepare()` once and `step(iteration)` on its own schedule,
//!   using `Pacer` for timing. The loop reads no stop signal in this mode.

use anyhow::{anyhow, Context, Result};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::camera::{ExternalCamera, StreamKind};
use crate::frame::Frame;
use crate::measurement::{IterationRecord, MeasurementSink};
use crate::tracker::{FrameSet, PoseProvider, TrackingEngine, Viewer};

/// Default loop rate.
pub const DEFAULT_RATE_HZ: u32 = 30;

/// What to do when a camera has no usable frame for an iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcquisitionPolicy {
    /// Log it and step anyway with the stale or empty input. The engine decides.
    #[default]
    Proceed,
    /// Log it and skip the engine step and the measurement for this iteration.
    SkipIteration,
}

impl FromStr for AcquisitionPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proceed" => Ok(Self::Proceed),
            "skip" | "skip_iteration" => Ok(Self::SkipIteration),
            other => Err(anyhow!(
                "unknown acquisition policy '{}' (expected proceed|skip)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopConfig {
    pub rate_hz: u32,
    /// Batch mode stops after this many iterations.
    pub max_iterations: Option<u64>,
    pub acquisition: AcquisitionPolicy,
    /// Append a measurement row per iteration when a sink is attached.
    pub log_measurements: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_RATE_HZ,
            max_iterations: None,
            acquisition: AcquisitionPolicy::Proceed,
            log_measurements: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Pacer
// ----------------------------------------------------------------------------

/// Measure-elapsed / sleep-remainder pacing. No debt carries across iterations.
#[derive(Clone, Debug)]
pub struct Pacer {
    period: Duration,
    started: Instant,
}

/// Timing of one paced iteration.
#[derive(Clone, Copy, Debug)]
pub struct PaceOutcome {
    pub elapsed: Duration,
    pub slept: Duration,
}

impl PaceOutcome {
    pub fn overran(&self) -> bool {
        self.slept.is_zero()
    }
}

impl Pacer {
    pub fn new(rate_hz: u32) -> Result<Self> {
        if rate_hz == 0 {
            return Err(anyhow!("loop rate must be at least 1 Hz"));
        }
        Ok(Self {
            period: Duration::from_micros(1_000_000 / rate_hz as u64),
            started: Instant::now(),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Mark the start of an iteration.
    pub fn start(&mut self) {
        self.started = Instant::now();
    }

    /// Sleep until one period after `start`, or return at once if that already passed.
    pub fn finish(&self) -> PaceOutcome {
        let elapsed = self.started.elapsed();
        match self.period.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                std::thread::sleep(remaining);
                PaceOutcome {
                    elapsed,
                    slept: remaining,
                }
            }
            _ => PaceOutcome {
                elapsed,
                slept: Duration::ZERO,
            },
        }
    }
}

// ----------------------------------------------------------------------------
// StopHandle
// ----------------------------------------------------------------------------

/// External stop signal for batch mode. Clone it into signal handlers.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

/// Outcome of one `step`.
#[derive(Clone, Debug)]
pub struct StepReport {
    pub iteration: u64,
    pub frames: FrameSet,
    /// Streams that had no usable frame this iteration.
    pub acquisition_failures: u32,
    /// False when the iteration was skipped by `AcquisitionPolicy::SkipIteration`.
    pub stepped: bool,
    pub recorded: bool,
}

/// Why a batch run ended normally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchEnd {
    #[default]
    InputExhausted,
    IterationLimit,
    Stopped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub iterations: u64,
    pub skipped: u64,
    pub overruns: u64,
    pub acquisition_failures: u64,
    pub record_failures: u64,
    pub end: BatchEnd,
}

// ----------------------------------------------------------------------------
// ControlLoop
// ----------------------------------------------------------------------------

/// Owns the cameras, the engine and the measurement sink for one tracking session.
pub struct ControlLoop<E> {
    name: String,
    engine: E,
    config: LoopConfig,
    color: Option<ExternalCamera>,
    depth: Option<ExternalCamera>,
    sink: Option<MeasurementSink>,
    viewers: Vec<Box<dyn Viewer>>,
    stop: StopHandle,
    prepared: bool,
}

impl<E: TrackingEngine + PoseProvider> ControlLoop<E> {
    pub fn new(name: &str, engine: E, config: LoopConfig) -> Self {
        Self {
            name: name.to_string(),
            engine,
            config,
            color: None,
            depth: None,
            sink: None,
            viewers: Vec::new(),
            stop: StopHandle::new(),
            prepared: false,
        }
    }

    /// Attach a camera to the stream matching its kind, replacing any previous one.
    pub fn with_camera(mut self, camera: ExternalCamera) -> Self {
        match camera.kind() {
            StreamKind::Color => self.color = Some(camera),
            StreamKind::Depth => self.depth = Some(camera),
        }
        self.prepared = false;
        self
    }

    pub fn with_measurement_sink(mut self, sink: MeasurementSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the loop's stop handle, e.g. with one already wired to a signal handler.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_viewer(mut self, viewer: Box<dyn Viewer>) -> Self {
        self.viewers.push(viewer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn camera(&self, kind: StreamKind) -> Option<&ExternalCamera> {
        match kind {
            StreamKind::Color => self.color.as_ref(),
            StreamKind::Depth => self.depth.as_ref(),
        }
    }

    pub fn measurement_sink(&self) -> Option<&MeasurementSink> {
        self.sink.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Set up cameras and engine. Safe to call repeatedly; a prepared loop returns at once.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        for camera in self.color.iter_mut().chain(self.depth.iter_mut()) {
            camera
                .setup()
                .with_context(|| format!("tracker {}: camera setup", self.name))?;
        }
        self.engine
            .set_up()
            .with_context(|| format!("tracker {}: engine {} setup", self.name, self.engine.name()))?;
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.status() {
                log::warn!(
                    "tracker {}: measurements will not be recorded: {:#}",
                    self.name,
                    err
                );
            }
        }
        self.prepared = true;
        log::info!(
            "tracker {} prepared at {} Hz (color={}, depth={}, measurements={})",
            self.name,
            self.config.rate_hz,
            self.color.is_some(),
            self.depth.is_some(),
            self.sink.is_some() && self.config.log_measurements
        );
        Ok(())
    }

    /// Run one iteration without pacing. Only an engine failure is an error.
    pub fn step(&mut self, iteration: u64) -> Result<StepReport> {
        if !self.prepared {
            return Err(anyhow!("prepare tracker {} before stepping", self.name));
        }

        let mut acquisition_failures = 0u32;
        let frames = FrameSet {
            color: acquire(self.color.as_mut(), &mut acquisition_failures),
            depth: acquire(self.depth.as_mut(), &mut acquisition_failures),
        };

        if acquisition_failures > 0 && self.config.acquisition == AcquisitionPolicy::SkipIteration
        {
            log::warn!(
                "tracker {}: skipping iteration {} ({} stream(s) without a frame)",
                self.name,
                iteration,
                acquisition_failures
            );
            return Ok(StepReport {
                iteration,
                frames,
                acquisition_failures,
                stepped: false,
                recorded: false,
            });
        }

        self.engine.step(iteration, &frames).with_context(|| {
            format!(
                "tracker {}: engine {} failed at iteration {}",
                self.name,
                self.engine.name(),
                iteration
            )
        })?;

        let pose = self.engine.body2world_pose();
        for viewer in self.viewers.iter_mut() {
            if let Err(err) = viewer.update_viewer(iteration, &frames, &pose) {
                log::warn!("viewer {}: {:#}", viewer.name(), err);
            }
        }

        let recorded = self.record(iteration, &frames);
        log::debug!(
            "tracker {}: iteration {} color={:?} depth={:?}",
            self.name,
            iteration,
            frames.color_load_index(),
            frames.depth_load_index()
        );

        Ok(StepReport {
            iteration,
            frames,
            acquisition_failures,
            stepped: true,
            recorded,
        })
    }

    /// Batch mode: prepare, then iterate at the configured rate until the input runs out,
    /// `max_iterations` is reached, or the stop handle fires. Engine errors end the run.
    pub fn run(&mut self) -> Result<BatchSummary> {
        self.prepare()?;
        let mut pacer = Pacer::new(self.config.rate_hz)?;
        let mut summary = BatchSummary::default();
        let mut iteration = 0u64;

        summary.end = loop {
            if self.stop.is_stopped() {
                break BatchEnd::Stopped;
            }
            if matches!(self.config.max_iterations, Some(max) if iteration >= max) {
                break BatchEnd::IterationLimit;
            }
            if self.input_exhausted() {
                break BatchEnd::InputExhausted;
            }

            pacer.start();
            let report = self.step(iteration)?;
            summary.acquisition_failures += report.acquisition_failures as u64;
            if !report.stepped {
                summary.skipped += 1;
            } else if self.sink.is_some() && self.config.log_measurements && !report.recorded {
                summary.record_failures += 1;
            }
            if pacer.finish().overran() {
                summary.overruns += 1;
            }
            iteration += 1;
        };
        summary.iterations = iteration;

        log::info!(
            "tracker {} finished ({:?}): {} iterations, {} skipped, {} overruns, {} record failures",
            self.name,
            summary.end,
            summary.iterations,
            summary.skipped,
            summary.overruns,
            summary.record_failures
        );
        Ok(summary)
    }

    /// True once any non-wrapping replay camera has handed out its last file.
    fn input_exhausted(&self) -> bool {
        self.color
            .iter()
            .chain(self.depth.iter())
            .any(ExternalCamera::is_exhausted)
    }

    fn record(&self, iteration: u64, frames: &FrameSet) -> bool {
        if !self.config.log_measurements {
            return false;
        }
        let Some(sink) = &self.sink else {
            return false;
        };
        let record = IterationRecord {
            iteration,
            rgb_load_index: frames.color_load_index(),
            depth_load_index: frames.depth_load_index(),
            pose: self.engine.body2world_pose(),
            errors: self.engine.error_terms(),
        };
        match sink.record(&record) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "tracker {}: measurement for iteration {} not recorded: {:#}",
                    self.name,
                    iteration,
                    err
                );
                false
            }
        }
    }
}

/// Update and snapshot one stream. Failures are logged and counted, never returned.
fn acquire(camera: Option<&mut ExternalCamera>, failures: &mut u32) -> Option<Frame> {
    let camera = camera?;
    if let Err(err) = camera.update(true) {
        log::warn!("acquisition: {:#}", err);
        *failures += 1;
        return camera.snapshot();
    }
    match camera.snapshot() {
        Some(frame) if frame.is_placeholder() => {
            log::warn!(
                "acquisition: camera {} has not received a frame yet",
                camera.name()
            );
            *failures += 1;
            Some(frame)
        }
        Some(frame) => Some(frame),
        None => {
            log::warn!("acquisition: camera {} has no frame", camera.name());
            *failures += 1;
            None
        }
    }
}
