//! pose_loop - drive a tracking engine at a fixed rate from external cameras
//!
//! Two modes:
//! 1. Batch (`ros_style` = 0): replay or push-fed cameras, runs until the input is
//!    exhausted, `max_iterations` is reached, or Ctrl-C. A batch with no replay camera,
//!    no push feed and no iteration limit is refused.
//! 2. Continuous (`ros_style` != 0): prepares once, then a producer thread pushes frames
//!    into the color camera while this thread steps the loop until Ctrl-C
//!
//! Exit code is -1 on bad arguments or any setup/step failure.

use anyhow::{anyhow, Result};
use clap::Parser;
use nalgebra::Matrix4;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::thread::JoinHandle;

use pose_loop::camera::replay::load_frame;
use pose_loop::{
    Body, ControlLoop, FramePublisher, FrameSet, MeasurementSink, Pacer, PushFeedSettings,
    RunConfig, SequenceCursor, StaticPoseEngine, StopHandle, StreamKind, Viewer,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Attach a console viewer that logs the pose every iteration (0 = off).
    add_viewer: u8,
    /// Continuous mode: prepare once, then step until Ctrl-C (0 = batch mode).
    ros_style: u8,
    /// Path to a JSON run configuration.
    #[arg(long, env = "POSE_LOOP_CONFIG")]
    config: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let _ = err.print();
            std::process::exit(-1);
        }
    };

    if let Err(err) = run(args) {
        log::error!("{:#}", err);
        std::process::exit(-1);
    }
}

fn run(args: Args) -> Result<()> {
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        RunConfig::load_from(args.config.as_deref())?
    };

    let stop = StopHandle::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.stop())
            .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let mut tracker = build_loop(&cfg, args.add_viewer != 0, &stop);

    if args.ros_style != 0 {
        run_continuous(&cfg, &mut tracker, &stop, &ui)
    } else {
        run_batch(&cfg, &mut tracker, &stop, &ui)
    }
}

fn build_loop(
    cfg: &RunConfig,
    add_viewer: bool,
    stop: &StopHandle,
) -> ControlLoop<StaticPoseEngine> {
    let body = Body::new(&cfg.body_name, cfg.initial_pose);
    let engine = StaticPoseEngine::new("static_pose", body);
    let mut tracker = ControlLoop::new("tracker", engine, cfg.loop_config.clone());

    // Batch mode reads the loop's own handle; share the one the signal handler sets.
    tracker = tracker.with_stop_handle(stop.clone());
    if let Some(settings) = &cfg.color_camera {
        tracker = tracker.with_camera(settings.build("color_camera", StreamKind::Color));
    }
    if let Some(settings) = &cfg.depth_camera {
        tracker = tracker.with_camera(settings.build("depth_camera", StreamKind::Depth));
    }
    if cfg.loop_config.log_measurements {
        if let Some(path) = &cfg.measurement_path {
            tracker = tracker.with_measurement_sink(MeasurementSink::create(path));
        }
    }
    if add_viewer {
        tracker = tracker.with_viewer(Box::new(ConsoleViewer));
    }
    tracker
}

fn run_batch(
    cfg: &RunConfig,
    tracker: &mut ControlLoop<StaticPoseEngine>,
    stop: &StopHandle,
    ui: &ui::Ui,
) -> Result<()> {
    {
        let _stage = ui.stage("Prepare tracker");
        tracker.prepare()?;
    }
    let has_replay = [StreamKind::Color, StreamKind::Depth]
        .into_iter()
        .filter_map(|kind| tracker.camera(kind))
        .any(|camera| camera.is_replay());
    check_batch_input(
        has_replay,
        cfg.push_feed.is_some(),
        tracker.config().max_iterations,
    )?;

    let producer = start_push_feed(cfg, tracker, stop)?;
    let result = {
        let _stage = ui.stage("Run tracker");
        tracker.run()
    };
    stop.stop();
    join_push_feed(producer);
    let summary = result?;
    if summary.acquisition_failures > 0 {
        log::warn!(
            "{} acquisition failures during the run",
            summary.acquisition_failures
        );
    }
    Ok(())
}

fn run_continuous(
    cfg: &RunConfig,
    tracker: &mut ControlLoop<StaticPoseEngine>,
    stop: &StopHandle,
    ui: &ui::Ui,
) -> Result<()> {
    {
        let _stage = ui.stage("Prepare tracker");
        tracker.prepare()?;
    }
    log::info!("Tracker process PREPARED");

    let producer = start_push_feed(cfg, tracker, stop)?;

    let mut pacer = Pacer::new(tracker.config().rate_hz)?;
    let counter = ui.loop_counter(tracker.name(), tracker.config().rate_hz);
    let mut iteration = 0u64;
    let mut result = Ok(());
    while !stop.is_stopped() {
        pacer.start();
        if let Err(err) = tracker.step(iteration) {
            result = Err(err);
            break;
        }
        counter.tick(iteration);
        pacer.finish();
        iteration += 1;
    }
    stop.stop();
    counter.finish(&format!("✔ {} iterations", iteration));

    join_push_feed(producer);
    if result.is_ok() {
        log::info!("shutdown signal received, tracker stopped");
    }
    result
}

/// Batch mode needs something that ends the run or feeds it frames.
fn check_batch_input(
    has_replay: bool,
    has_push_feed: bool,
    max_iterations: Option<u64>,
) -> Result<()> {
    if has_replay || has_push_feed || max_iterations.is_some() {
        return Ok(());
    }
    Err(anyhow!(
        "batch mode needs a replay camera, a push_feed or max_iterations; \
         use continuous mode for externally pushed frames"
    ))
}

fn start_push_feed(
    cfg: &RunConfig,
    tracker: &ControlLoop<StaticPoseEngine>,
    stop: &StopHandle,
) -> Result<Option<JoinHandle<()>>> {
    match (&cfg.push_feed, tracker.camera(StreamKind::Color)) {
        (Some(feed), Some(camera)) => Ok(Some(spawn_push_feed(
            feed.clone(),
            camera.publisher(),
            stop.clone(),
        )?)),
        (Some(_), None) => {
            log::warn!("push_feed configured but no color camera attached");
            Ok(None)
        }
        (None, _) => {
            log::info!("no push_feed configured; cameras are fed by their own sources");
            Ok(None)
        }
    }
}

fn join_push_feed(producer: Option<JoinHandle<()>>) {
    if let Some(handle) = producer {
        if handle.join().is_err() {
            log::warn!("push feed thread panicked");
        }
    }
}

/// Publish files from the feed sequence into the color camera at the feed rate.
fn spawn_push_feed(
    feed: PushFeedSettings,
    publisher: FramePublisher,
    stop: StopHandle,
) -> Result<JoinHandle<()>> {
    let len = feed.sequence.resolve_len()?;
    if len == 0 {
        return Err(anyhow!(
            "push feed directory {} has no {} files",
            feed.sequence.directory.display(),
            feed.sequence.extension
        ));
    }
    let mut cursor = SequenceCursor::new(feed.sequence.start_index, len, feed.sequence.wrap);
    let mut pacer = Pacer::new(feed.rate_hz)?;
    log::info!(
        "push feed: {} files from {} at {} Hz",
        len,
        feed.sequence.directory.display(),
        feed.rate_hz
    );

    let handle = std::thread::Builder::new()
        .name("push_feed".to_string())
        .spawn(move || {
            while !stop.is_stopped() {
                pacer.start();
                let Some(index) = cursor.advance() else {
                    log::info!("push feed exhausted after {} files", cursor.len());
                    break;
                };
                let path = feed.sequence.path_for(index);
                let published = load_frame(&path, StreamKind::Color)
                    .and_then(|frame| publisher.publish(frame.with_source_index(index)));
                if let Err(err) = published {
                    log::warn!("push feed: {:#}", err);
                }
                pacer.finish();
            }
        })?;
    Ok(handle)
}

/// Logs the body position. Stands in for a rendering window.
struct ConsoleViewer;

impl Viewer for ConsoleViewer {
    fn name(&self) -> &str {
        "console"
    }

    fn update_viewer(
        &mut self,
        iteration: u64,
        frames: &FrameSet,
        pose: &Matrix4<f32>,
    ) -> Result<()> {
        log::info!(
            "iteration {}: color={:?} depth={:?} position=[{:.4}, {:.4}, {:.4}]",
            iteration,
            frames.color_load_index(),
            frames.depth_load_index(),
            pose[(0, 3)],
            pose[(1, 3)],
            pose[(2, 3)]
        );
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_push_only_batch_is_refused() {
        let err = check_batch_input(false, false, None).unwrap_err();
        assert!(err.to_string().contains("batch mode"));
    }

    #[test]
    fn batch_accepts_any_input_or_bound() {
        assert!(check_batch_input(true, false, None).is_ok());
        assert!(check_batch_input(false, true, None).is_ok());
        assert!(check_batch_input(false, false, Some(10)).is_ok());
    }
}
