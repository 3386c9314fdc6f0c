use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use nalgebra::Matrix4;

use pose_loop::{
    read_measurements, AcquisitionPolicy, BatchEnd, Body, ControlLoop, ExternalCamera, Frame,
    FrameSet, Intrinsics, LoopConfig, MeasurementSink, PoseProvider, SequenceSpec,
    StaticPoseEngine, StreamKind, TrackingEngine, Viewer,
};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 3;

fn intrinsics() -> Intrinsics {
    Intrinsics::new(921.8, 920.5, 1.5, 1.0, WIDTH, HEIGHT)
}

fn write_color_sequence(dir: &Path, count: u8) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        let image: RgbImage = ImageBuffer::from_pixel(WIDTH, HEIGHT, Rgb([i * 10, 0, 255 - i]));
        image
            .save(dir.join(format!("scene_{:06}.png", i)))
            .unwrap();
    }
}

fn write_depth_sequence(dir: &Path, count: u16) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        let image: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_pixel(WIDTH, HEIGHT, Luma([1000 + i]));
        image
            .save(dir.join(format!("scene_{:06}.png", i)))
            .unwrap();
    }
}

fn replay_camera(name: &str, kind: StreamKind, dir: &Path, wrap: bool) -> ExternalCamera {
    let sequence = SequenceSpec::new(dir)
        .with_prefix("scene_")
        .with_leading_zeros(6)
        .with_wrap(wrap);
    let camera = ExternalCamera::new(name, kind)
        .with_intrinsics(intrinsics())
        .with_sequence(sequence);
    match kind {
        StreamKind::Depth => camera.with_depth_scale(0.001),
        StreamKind::Color => camera,
    }
}

fn push_camera() -> ExternalCamera {
    ExternalCamera::new("color_camera", StreamKind::Color).with_intrinsics(intrinsics())
}

fn static_engine() -> StaticPoseEngine {
    StaticPoseEngine::new("static", Body::new("body", Matrix4::identity()))
}

fn fast_config(max_iterations: Option<u64>) -> LoopConfig {
    LoopConfig {
        rate_hz: 1000,
        max_iterations,
        ..LoopConfig::default()
    }
}

/// Engine with a fixed step duration that counts setup calls.
struct ScriptedEngine {
    body: Body,
    step_time: Duration,
    set_up_calls: u32,
    steps: u64,
    errors: [Option<f32>; 4],
}

impl ScriptedEngine {
    fn new(step_time: Duration) -> Self {
        let pose = Matrix4::new_translation(&nalgebra::Vector3::new(0.1, 0.2, 0.3));
        Self {
            body: Body::new("body", pose),
            step_time,
            set_up_calls: 0,
            steps: 0,
            errors: [None; 4],
        }
    }
}

impl TrackingEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn set_up(&mut self) -> Result<()> {
        self.set_up_calls += 1;
        Ok(())
    }

    fn step(&mut self, _iteration: u64, _frames: &FrameSet) -> Result<()> {
        std::thread::sleep(self.step_time);
        self.steps += 1;
        Ok(())
    }

    fn error_terms(&self) -> [Option<f32>; 4] {
        self.errors
    }
}

impl PoseProvider for ScriptedEngine {
    fn body2world_pose(&self) -> Matrix4<f32> {
        self.body.body2world_pose()
    }
}

struct FailingViewer;

impl Viewer for FailingViewer {
    fn name(&self) -> &str {
        "failing"
    }

    fn update_viewer(&mut self, _: u64, _: &FrameSet, _: &Matrix4<f32>) -> Result<()> {
        Err(anyhow!("window closed"))
    }
}

#[test]
fn fast_steps_are_paced_to_the_rate() -> Result<()> {
    let config = LoopConfig {
        rate_hz: 30,
        max_iterations: Some(6),
        ..LoopConfig::default()
    };
    let mut tracker = ControlLoop::new(
        "paced",
        ScriptedEngine::new(Duration::from_millis(10)),
        config,
    );

    let start = Instant::now();
    let summary = tracker.run()?;
    let elapsed = start.elapsed();

    assert_eq!(summary.iterations, 6);
    assert_eq!(summary.end, BatchEnd::IterationLimit);
    assert_eq!(tracker.engine().steps, 6);
    // Six periods of 33.3 ms each.
    assert!(elapsed >= Duration::from_millis(195), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
    Ok(())
}

#[test]
fn slow_steps_overrun_without_sleeping() -> Result<()> {
    let config = LoopConfig {
        rate_hz: 30,
        max_iterations: Some(4),
        ..LoopConfig::default()
    };
    let mut tracker = ControlLoop::new(
        "overrun",
        ScriptedEngine::new(Duration::from_millis(50)),
        config,
    );

    let start = Instant::now();
    let summary = tracker.run()?;
    let elapsed = start.elapsed();

    assert_eq!(summary.overruns, 4);
    assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
    // No catch-up sleeps: roughly 4 x 50 ms, not 4 x 83 ms.
    assert!(elapsed < Duration::from_millis(320), "{:?}", elapsed);
    Ok(())
}

#[test]
fn replay_wraps_and_logs_load_indices() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_color_sequence(&dir.path().join("color"), 5);
    write_depth_sequence(&dir.path().join("depth"), 5);
    let log_path = dir.path().join("measurements/offline_meas.csv");

    let mut tracker = ControlLoop::new("replay", static_engine(), fast_config(Some(12)))
        .with_camera(replay_camera(
            "color_camera",
            StreamKind::Color,
            &dir.path().join("color"),
            true,
        ))
        .with_camera(replay_camera(
            "depth_camera",
            StreamKind::Depth,
            &dir.path().join("depth"),
            true,
        ))
        .with_measurement_sink(MeasurementSink::create(&log_path));

    let summary = tracker.run()?;
    assert_eq!(summary.iterations, 12);
    assert_eq!(summary.end, BatchEnd::IterationLimit);
    assert_eq!(summary.acquisition_failures, 0);
    assert_eq!(summary.record_failures, 0);
    assert_eq!(tracker.engine().steps(), 12);

    let records = read_measurements(&log_path)?;
    assert_eq!(records.len(), 12);
    for (i, record) in records.iter().enumerate() {
        let i = i as u64;
        assert_eq!(record.iteration, i);
        assert_eq!(record.rgb_load_index, Some(i % 5));
        assert_eq!(record.depth_load_index, Some(i % 5));
        assert_eq!(record.pose, Matrix4::identity());
    }

    let cursor = tracker
        .camera(StreamKind::Color)
        .and_then(ExternalCamera::sequence_cursor)
        .expect("replay cursor");
    assert_eq!(cursor.len(), 5);
    // Twelve updates: the next file handed out is 12 % 5.
    assert_eq!(cursor.index(), 2);
    assert!(!cursor.is_empty());

    let depth = tracker
        .camera(StreamKind::Depth)
        .and_then(ExternalCamera::snapshot)
        .expect("depth frame");
    // Iteration 11 consumed file 1.
    assert_eq!(depth.depth_at(0, 0), Some(1001));
    Ok(())
}

#[test]
fn replay_without_wrap_ends_when_input_runs_out() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_color_sequence(dir.path(), 3);

    let mut tracker = ControlLoop::new("once", static_engine(), fast_config(None)).with_camera(
        replay_camera("color_camera", StreamKind::Color, dir.path(), false),
    );

    let summary = tracker.run()?;
    assert_eq!(summary.end, BatchEnd::InputExhausted);
    assert_eq!(summary.iterations, 3);
    let cursor = tracker
        .camera(StreamKind::Color)
        .and_then(ExternalCamera::sequence_cursor)
        .expect("replay cursor");
    assert_eq!(cursor.index(), 3);
    assert!(cursor.is_exhausted());
    assert_eq!(summary.acquisition_failures, 0);
    Ok(())
}

#[test]
fn proceed_policy_steps_on_placeholder_input() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("meas.csv");
    let mut tracker = ControlLoop::new("proceed", static_engine(), fast_config(Some(3)))
        .with_camera(push_camera())
        .with_measurement_sink(MeasurementSink::create(&log_path));

    let summary = tracker.run()?;
    assert_eq!(summary.acquisition_failures, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(tracker.engine().steps(), 3);

    let records = read_measurements(&log_path)?;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.rgb_load_index.is_none()));
    Ok(())
}

#[test]
fn skip_policy_skips_step_and_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("meas.csv");
    let config = LoopConfig {
        acquisition: AcquisitionPolicy::SkipIteration,
        ..fast_config(Some(3))
    };
    let mut tracker = ControlLoop::new("skip", static_engine(), config)
        .with_camera(push_camera())
        .with_measurement_sink(MeasurementSink::create(&log_path));

    let summary = tracker.run()?;
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.skipped, 3);
    assert_eq!(tracker.engine().steps(), 0);
    assert!(read_measurements(&log_path)?.is_empty());
    Ok(())
}

#[test]
fn engine_failure_ends_the_run() {
    let engine = static_engine().with_required_color(true);
    let mut tracker =
        ControlLoop::new("strict", engine, fast_config(Some(5))).with_camera(push_camera());

    let err = tracker.run().unwrap_err();
    assert!(
        err.to_string().contains("failed at iteration 0"),
        "{:#}",
        err
    );
}

#[test]
fn degraded_sink_does_not_stop_the_loop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, b"file")?;

    let sink = MeasurementSink::create(blocker.join("meas.csv"));
    assert!(sink.is_degraded());
    let mut tracker = ControlLoop::new("degraded", static_engine(), fast_config(Some(4)))
        .with_measurement_sink(sink)
        .with_viewer(Box::new(FailingViewer));

    let summary = tracker.run()?;
    assert_eq!(summary.iterations, 4);
    assert_eq!(summary.record_failures, 4);
    assert_eq!(tracker.engine().steps(), 4);
    Ok(())
}

#[test]
fn stop_handle_ends_batch_run() -> Result<()> {
    let mut tracker = ControlLoop::new("stopped", static_engine(), fast_config(None));
    tracker.stop_handle().stop();

    let summary = tracker.run()?;
    assert_eq!(summary.end, BatchEnd::Stopped);
    assert_eq!(summary.iterations, 0);
    Ok(())
}

#[test]
fn step_requires_prepare_and_prepare_is_idempotent() -> Result<()> {
    let mut tracker = ControlLoop::new(
        "continuous",
        ScriptedEngine::new(Duration::ZERO),
        fast_config(None),
    )
    .with_camera(push_camera());

    assert!(tracker.step(0).is_err());
    assert!(tracker.measurement_sink().is_none());
    tracker.prepare()?;
    assert!(tracker
        .camera(StreamKind::Color)
        .and_then(ExternalCamera::sequence_cursor)
        .is_none());
    tracker.prepare()?;
    assert!(tracker.is_prepared());
    assert_eq!(tracker.engine().set_up_calls, 1);
    tracker.step(0)?;
    Ok(())
}

#[test]
fn continuous_steps_consume_latest_pushed_frame() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("meas.csv");
    let mut engine = ScriptedEngine::new(Duration::ZERO);
    engine.errors = [Some(0.5), None, None, None];
    let mut tracker = ControlLoop::new("continuous", engine, fast_config(None))
        .with_camera(push_camera())
        .with_measurement_sink(MeasurementSink::create(&log_path));
    tracker.prepare()?;

    let publisher = tracker
        .camera(StreamKind::Color)
        .map(ExternalCamera::publisher)
        .expect("color camera");
    let frame = |value: u8, index: u64| {
        Frame::rgb(WIDTH, HEIGHT, vec![value; (WIDTH * HEIGHT * 3) as usize])
            .unwrap()
            .with_source_index(index)
    };

    publisher.publish(frame(1, 40))?;
    let first = tracker.step(0)?;
    assert_eq!(first.acquisition_failures, 0);
    assert_eq!(first.frames.color_load_index(), Some(40));

    publisher.publish(frame(2, 41))?;
    publisher.publish(frame(3, 42))?;
    let second = tracker.step(1)?;
    assert_eq!(second.frames.color_load_index(), Some(42));
    assert!(second.recorded);

    // Nothing new: the previous frame is reused.
    let third = tracker.step(2)?;
    assert_eq!(third.frames.color_load_index(), Some(42));

    let sink_path = tracker.measurement_sink().map(|sink| sink.path().to_path_buf());
    assert_eq!(sink_path.as_deref(), Some(log_path.as_path()));
    let records = read_measurements(&log_path)?;
    let indices: Vec<_> = records.iter().map(|r| r.rgb_load_index).collect();
    assert_eq!(indices, vec![Some(40), Some(42), Some(42)]);
    assert_eq!(records[0].errors, [Some(0.5), None, None, None]);
    assert!((records[0].pose[(2, 3)] - 0.3).abs() < 1e-6);
    Ok(())
}
