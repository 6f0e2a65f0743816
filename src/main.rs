//! Pi-cam-monitor binary: headless stream and segmented recording.

use pi_cam_monitor::traits::Result;
use pi_cam_monitor::{
    CameraError, FrameSource, MockSource, MonitorConfig, SessionController, V4L2Source,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "Usage: pi-cam-monitor [--config FILE] [--device N] [--interval SECS] \
                     [--output DIR] [--no-stream] [--no-record] [--mock]";

struct Args {
    config: Option<PathBuf>,
    device: Option<usize>,
    interval: Option<u64>,
    output: Option<PathBuf>,
    stream: bool,
    record: bool,
    mock: bool,
}

fn main() {
    pi_cam_monitor::init_logging();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        println!("{USAGE}");
        return Ok(());
    };

    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };
    if let Some(device) = args.device {
        config.camera.device = device;
    }
    if let Some(interval) = args.interval {
        config.recording.interval_secs = interval;
    }
    if let Some(output) = &args.output {
        config.recording.output_dir.clone_from(output);
    }
    config.validate()?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::Release))
            .map_err(|err| CameraError::Config(format!("cannot install Ctrl-C handler: {err}")))?;
    }

    if args.mock {
        let source = MockSource::open(config.resolution(), config.camera.frame_rate)?;
        monitor(Arc::new(source), &config, &args, &running)
    } else {
        let source = Arc::new(V4L2Source::open(
            config.camera.device,
            config.resolution(),
            config.camera.frame_rate,
            config.fourcc()?,
        )?);
        monitor(Arc::clone(&source), &config, &args, &running)?;
        let dropped = source.dropped_frames();
        if dropped > 0 {
            log::warn!("{dropped} frames dropped by lagging consumers");
        }
        Ok(())
    }
}

fn monitor<S: FrameSource>(
    source: Arc<S>,
    config: &MonitorConfig,
    args: &Args,
    running: &AtomicBool,
) -> Result<()> {
    let controller = SessionController::new(source, config)?;

    if args.stream {
        controller.start_stream()?;
    }
    if args.record {
        controller.start_record(controller.default_interval())?;
    }

    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_secs(1));

        let stream = controller.stream_status();
        let record = controller.record_status();
        let latest = controller
            .read_latest_frame()
            .map(|frame| format!("frame {} ({} bytes)", frame.metadata.sequence, frame.data.len()));
        log::info!(
            "{} {} | {} {} segments, {} frames",
            stream.notification(),
            latest.as_deref().unwrap_or("-"),
            record.notification(),
            record.progress.segments_closed,
            record.progress.frames_written
        );
    }

    let report = controller.shutdown();
    if let Some(recording) = &report.recording {
        log::info!(
            "Recorded {} segments ({} frames, {} decode errors)",
            recording.segments.len(),
            recording.frames_written(),
            recording.decode_errors
        );
    }
    Ok(())
}

/// Returns `None` when help was requested.
fn parse_args<I>(mut args: I) -> Result<Option<Args>>
where
    I: Iterator<Item = String>,
{
    let mut parsed = Args {
        config: None,
        device: None,
        interval: None,
        output: None,
        stream: true,
        record: true,
        mock: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(value(&mut args, &arg)?)),
            "--device" => parsed.device = Some(number(&value(&mut args, &arg)?, &arg)?),
            "--interval" => parsed.interval = Some(number(&value(&mut args, &arg)?, &arg)?),
            "--output" => parsed.output = Some(PathBuf::from(value(&mut args, &arg)?)),
            "--no-stream" => parsed.stream = false,
            "--no-record" => parsed.record = false,
            "--mock" => parsed.mock = true,
            "-h" | "--help" => return Ok(None),
            other => {
                return Err(CameraError::Config(format!("unknown argument {other}\n{USAGE}")));
            }
        }
    }
    Ok(Some(parsed))
}

fn value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String> {
    args.next()
        .ok_or_else(|| CameraError::Config(format!("{flag} needs a value")))
}

fn number<T: std::str::FromStr>(text: &str, flag: &str) -> Result<T> {
    text.parse()
        .map_err(|_| CameraError::Config(format!("{flag} expects a number, got {text}")))
}
