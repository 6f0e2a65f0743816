//! Session controller: the two toggles, status readers and shutdown.
//!
//! Each activity sits behind its own lock so a slow stop of one never
//! blocks the other. Status and latest-frame reads go through the shared
//! cells and never take those locks.

use crate::config::MonitorConfig;
use crate::finalize::{Finalize, FinalizeSnapshot, FinalizeStats, FinalizerPool, Mp4BoxFinalizer};
use crate::recorder::{
    RecordPhase, RecordProgress, RecordProgressSnapshot, RecordSettings, RecordSummary, Recorder,
};
use crate::streamer::{StreamSettings, StreamShared, StreamStatus, Streamer};
use crate::traits::{CameraError, Frame, FrameSource, Port, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Notification shown while a recording session is active.
pub const RECORDING_NOTIFICATION: &str = "Recording...";

/// Recording status for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStatus {
    /// Recorder progress.
    pub progress: RecordProgressSnapshot,
    /// Finalization counters.
    pub finalize: FinalizeSnapshot,
}

impl RecordStatus {
    /// Whether a recording session is active.
    pub fn is_recording(&self) -> bool {
        self.progress.phase != RecordPhase::Idle
    }

    /// Text shown next to the record toggle.
    pub fn notification(&self) -> &str {
        if self.is_recording() {
            RECORDING_NOTIFICATION
        } else {
            self.finalize.last_failure.as_deref().unwrap_or("")
        }
    }
}

/// What `shutdown` did.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Summary of the recording session that was running, if any.
    pub recording: Option<RecordSummary>,
    /// Finalization counters after the queue drained.
    pub finalize: FinalizeSnapshot,
    /// Whether this shutdown released the source.
    pub source_closed: bool,
}

/// Owns the shared source, the streamer, the recorder and the finalizer pool.
pub struct SessionController<S: FrameSource> {
    source: Arc<S>,
    streamer: Mutex<Streamer<S>>,
    recorder: Mutex<Recorder<S>>,
    finalizer: Mutex<FinalizerPool>,
    stream_shared: Arc<StreamShared>,
    record_progress: Arc<RecordProgress>,
    finalize_stats: Arc<FinalizeStats>,
    default_interval: Duration,
    shut_down: AtomicBool,
    report: Mutex<Option<ShutdownReport>>,
}

impl<S: FrameSource> SessionController<S> {
    /// Build a controller finalizing segments with the configured MP4Box.
    pub fn new(source: Arc<S>, config: &MonitorConfig) -> Result<Self> {
        let finalizer = Arc::new(Mp4BoxFinalizer::new(&config.recording.mp4box));
        Self::with_finalizer(source, config, finalizer)
    }

    /// Build a controller with a custom finalizer.
    pub fn with_finalizer(
        source: Arc<S>,
        config: &MonitorConfig,
        finalizer: Arc<dyn Finalize>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = FinalizerPool::new(
            finalizer,
            config.recording.finalize_workers,
            config.recording.finalize_queue,
        )?;
        let dispatcher = pool
            .dispatcher()
            .ok_or_else(|| CameraError::Finalization("finalizer pool is closed".to_owned()))?;

        let streamer = Streamer::new(
            Arc::clone(&source),
            StreamSettings {
                port: Port::PREVIEW,
                warmup: config.warmup(),
            },
        );
        let recorder = Recorder::new(
            Arc::clone(&source),
            RecordSettings {
                port: Port::RECORD,
                output_dir: config.recording.output_dir.clone(),
            },
            dispatcher,
        );

        Ok(Self {
            stream_shared: streamer.shared(),
            record_progress: recorder.progress(),
            finalize_stats: pool.stats(),
            source,
            streamer: Mutex::new(streamer),
            recorder: Mutex::new(recorder),
            finalizer: Mutex::new(pool),
            default_interval: config.interval(),
            shut_down: AtomicBool::new(false),
            report: Mutex::new(None),
        })
    }

    /// The shared frame source.
    pub const fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Rotation interval used when the caller has no preference.
    pub const fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Turn the live stream on.
    pub fn start_stream(&self) -> Result<()> {
        let mut streamer = self.streamer.lock();
        self.ensure_open()?;
        streamer.start()
    }

    /// Ask the live stream to stop. Returns before the loop has drained.
    pub fn stop_stream(&self) -> Result<()> {
        self.streamer.lock().stop()
    }

    /// Start recording, rotating segments every `interval`.
    pub fn start_record(&self, interval: Duration) -> Result<()> {
        let mut recorder = self.recorder.lock();
        self.ensure_open()?;
        recorder.start(interval)
    }

    /// Ask the recorder to close its segment and stop. Returns before it has.
    pub fn stop_record(&self) -> Result<()> {
        self.recorder.lock().stop()
    }

    /// Most recent frame of the live stream.
    pub fn read_latest_frame(&self) -> Option<Arc<Frame>> {
        self.stream_shared.latest()
    }

    /// Live stream status.
    pub fn stream_status(&self) -> StreamStatus {
        self.stream_shared.status()
    }

    /// Recording status.
    pub fn record_status(&self) -> RecordStatus {
        RecordStatus {
            progress: self.record_progress.snapshot(),
            finalize: self.finalize_stats.snapshot(),
        }
    }

    /// Stop both activities, release the source and drain finalization.
    ///
    /// Safe to call more than once, from any thread. A call made while
    /// another is in progress waits for it and returns the same report.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut slot = self.report.lock();
        if let Some(report) = slot.as_ref() {
            return report.clone();
        }
        self.shut_down.store(true, Ordering::Release);
        log::info!("Shutting down");

        {
            let mut streamer = self.streamer.lock();
            let _ = streamer.stop();
            streamer.teardown();
        }

        let recording = {
            let mut recorder = self.recorder.lock();
            let _ = recorder.stop();
            let summary = recorder.teardown();
            recorder.detach_finalizer();
            summary
        };

        let source_closed = match self.source.close() {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Closing source failed: {err}");
                false
            }
        };

        let finalize = self.finalizer.lock().shutdown();
        log::info!(
            "Shutdown complete: {} finalized, {} failed, {} rejected",
            finalize.completed,
            finalize.failed,
            finalize.rejected
        );

        let report = ShutdownReport {
            recording,
            finalize,
            source_closed,
        };
        *slot = Some(report.clone());
        report
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(CameraError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl<S: FrameSource> Drop for SessionController<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::FinalizeJob;
    use crate::mock::MockSource;
    use crate::streamer::StreamState;
    use crate::traits::Resolution;
    use std::time::Instant;
    use tempfile::tempdir;

    struct NoopFinalizer;

    impl Finalize for NoopFinalizer {
        fn finalize(&self, _job: &FinalizeJob) -> Result<()> {
            Ok(())
        }
    }

    fn controller(dir: &std::path::Path) -> (Arc<MockSource>, SessionController<MockSource>) {
        let source = Arc::new(
            MockSource::builder(Resolution::new(32, 24), 100)
                .frame_interval(Duration::from_millis(2))
                .open()
                .expect("mock source"),
        );
        let mut config = MonitorConfig::default();
        config.camera.warmup_secs = 0;
        config.recording.output_dir = dir.to_path_buf();
        let controller =
            SessionController::with_finalizer(Arc::clone(&source), &config, Arc::new(NoopFinalizer))
                .expect("controller");
        (source, controller)
    }

    fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(5) {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_initial_status() {
        let dir = tempdir().expect("tempdir");
        let (_source, controller) = controller(dir.path());
        assert_eq!(controller.stream_status().state, StreamState::Idle);
        assert_eq!(controller.stream_status().notification(), "Stream off.");
        assert!(!controller.record_status().is_recording());
        assert_eq!(controller.record_status().notification(), "");
        assert!(controller.read_latest_frame().is_none());
        assert_eq!(controller.default_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_toggles_run_independently() {
        let dir = tempdir().expect("tempdir");
        let (source, controller) = controller(dir.path());

        controller.start_stream().expect("start stream");
        controller
            .start_record(controller.default_interval())
            .expect("start record");
        assert!(wait_until(|| controller.stream_status().state == StreamState::Running));
        assert_eq!(controller.record_status().notification(), "Recording...");
        assert!(wait_until(|| controller.read_latest_frame().is_some()));

        controller.stop_stream().expect("stop stream");
        assert!(wait_until(|| controller.stream_status().state == StreamState::Idle));
        assert!(controller.record_status().is_recording());
        assert_eq!(source.open_port_count(), 1);

        controller.stop_record().expect("stop record");
        assert!(matches!(controller.stop_record(), Err(CameraError::NotRunning)));
        assert!(wait_until(|| !controller.record_status().is_recording()));
    }

    #[test]
    fn test_shutdown_once() {
        let dir = tempdir().expect("tempdir");
        let (source, controller) = controller(dir.path());
        controller.start_stream().expect("start stream");
        controller
            .start_record(controller.default_interval())
            .expect("start record");
        std::thread::sleep(Duration::from_millis(20));

        let report = controller.shutdown();
        assert!(report.source_closed);
        assert_eq!(report.recording.map(|summary| summary.segments.len()), Some(1));
        assert_eq!(report.finalize.completed, 1);
        assert_eq!(source.close_calls(), 1);
        assert_eq!(source.ports_open_at_close(), 0);

        let again = controller.shutdown();
        assert!(again.source_closed);
        assert_eq!(source.close_calls(), 1);

        assert!(matches!(controller.start_stream(), Err(CameraError::ShutDown)));
        assert!(matches!(
            controller.start_record(Duration::from_secs(1)),
            Err(CameraError::ShutDown)
        ));
    }

    #[test]
    fn test_drop_shuts_down() {
        let dir = tempdir().expect("tempdir");
        let (source, controller) = controller(dir.path());
        controller.start_stream().expect("start stream");
        drop(controller);
        assert_eq!(source.close_calls(), 1);
        assert_eq!(source.ports_open_at_close(), 0);
    }
}
