//! Segmented recording with fixed-interval rotation.
//!
//! The loop writes every encoded frame it reads to the active segment. Once
//! the segment has been open for the rotation interval it is closed and the
//! next one is opened before another frame is read, so no frame falls
//! between segments. Closed segments go to the finalizer queue without
//! waiting for the conversion itself.

use crate::finalize::{FinalizeDispatcher, FinalizeJob};
use crate::segment::{current_overlay_text, SegmentNamer, SegmentRecord, SegmentWriter};
use crate::traits::{CameraError, CaptureChannel, CaptureMode, FrameSource, Port, Result};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default rotation interval: one hour.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

/// Where the recording loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPhase {
    /// No session.
    Idle,
    /// Writing the active segment.
    Recording,
    /// Closing one segment and opening the next.
    Rotating,
    /// Closing the final segment.
    Finishing,
}

/// Fixed recorder settings.
#[derive(Debug, Clone)]
pub struct RecordSettings {
    /// Port the recorder reads from.
    pub port: Port,
    /// Directory receiving segment files.
    pub output_dir: PathBuf,
}

impl Default for RecordSettings {
    fn default() -> Self {
        Self {
            port: Port::RECORD,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Progress shared between the recorder loop and status readers.
#[derive(Debug)]
pub struct RecordProgress {
    inner: RwLock<ProgressInner>,
}

#[derive(Debug, Clone)]
struct ProgressInner {
    phase: RecordPhase,
    current_segment: Option<PathBuf>,
    segments_closed: u64,
    frames_written: u64,
    decode_errors: u64,
    interval: Duration,
}

impl Default for RecordProgress {
    fn default() -> Self {
        Self {
            inner: RwLock::new(ProgressInner {
                phase: RecordPhase::Idle,
                current_segment: None,
                segments_closed: 0,
                frames_written: 0,
                decode_errors: 0,
                interval: DEFAULT_INTERVAL,
            }),
        }
    }
}

impl RecordProgress {
    /// Current phase.
    pub fn phase(&self) -> RecordPhase {
        self.inner.read().phase
    }

    /// Status snapshot for the UI.
    pub fn snapshot(&self) -> RecordProgressSnapshot {
        let inner = self.inner.read();
        RecordProgressSnapshot {
            phase: inner.phase,
            current_segment: inner.current_segment.clone(),
            segments_closed: inner.segments_closed,
            frames_written: inner.frames_written,
            decode_errors: inner.decode_errors,
            interval: inner.interval,
        }
    }

    fn reset(&self, interval: Duration, segment: PathBuf) {
        *self.inner.write() = ProgressInner {
            phase: RecordPhase::Recording,
            current_segment: Some(segment),
            segments_closed: 0,
            frames_written: 0,
            decode_errors: 0,
            interval,
        };
    }

    fn set_phase(&self, phase: RecordPhase) {
        self.inner.write().phase = phase;
    }
}

/// Copy of the recorder progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordProgressSnapshot {
    /// Current phase.
    pub phase: RecordPhase,
    /// Raw file being written.
    pub current_segment: Option<PathBuf>,
    /// Segments closed in this session.
    pub segments_closed: u64,
    /// Frames written in this session.
    pub frames_written: u64,
    /// Frames skipped due to transient read errors.
    pub decode_errors: u64,
    /// Rotation interval of this session.
    pub interval: Duration,
}

/// What a finished recording session produced.
#[derive(Debug, Clone, Default)]
pub struct RecordSummary {
    /// Every segment closed by the session, in order.
    pub segments: Vec<SegmentRecord>,
    /// Frames skipped due to transient read errors.
    pub decode_errors: u64,
    /// Error that ended the session, if it did not end by request.
    pub failure: Option<String>,
}

impl RecordSummary {
    /// Total frames written across all segments.
    pub fn frames_written(&self) -> u64 {
        self.segments.iter().map(|segment| segment.frames).sum()
    }

    /// Number of rotations performed (segments closed before the final one).
    pub fn rotations(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }
}

struct RecordSession {
    stop_requested: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    worker: JoinHandle<RecordSummary>,
}

/// Records an encoded port of a shared source into rotating segments.
pub struct Recorder<S: FrameSource> {
    source: Arc<S>,
    settings: RecordSettings,
    dispatcher: Option<FinalizeDispatcher>,
    progress: Arc<RecordProgress>,
    session: Option<RecordSession>,
    last_summary: Option<RecordSummary>,
}

impl<S: FrameSource> Recorder<S> {
    /// Create an idle recorder handing closed segments to `dispatcher`.
    pub fn new(source: Arc<S>, settings: RecordSettings, dispatcher: FinalizeDispatcher) -> Self {
        Self {
            source,
            settings,
            dispatcher: Some(dispatcher),
            progress: Arc::new(RecordProgress::default()),
            session: None,
            last_summary: None,
        }
    }

    /// Handle for lock-free status reads.
    pub fn progress(&self) -> Arc<RecordProgress> {
        Arc::clone(&self.progress)
    }

    /// Begin recording with the given rotation interval.
    pub fn start(&mut self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(CameraError::Config("rotation interval must be non-zero".to_owned()));
        }
        if let Some(session) = &self.session {
            let stopping = session.stop_requested.load(Ordering::Acquire);
            if !stopping && !session.finished.load(Ordering::Acquire) {
                return Err(CameraError::AlreadyRunning);
            }
        }
        if let Some(summary) = self.teardown() {
            if let Some(failure) = &summary.failure {
                log::warn!("Previous recording session ended with: {failure}");
            }
            self.last_summary = Some(summary);
        }

        let dispatcher = self
            .dispatcher
            .clone()
            .ok_or_else(|| CameraError::Finalization("finalizer detached".to_owned()))?;

        let channel = self
            .source
            .capture_continuous(self.settings.port, CaptureMode::Encoded)?;

        std::fs::create_dir_all(&self.settings.output_dir)?;
        let mut namer = SegmentNamer::new(&self.settings.output_dir);
        let first = SegmentWriter::create(&self.settings.output_dir, namer.next_name())?;
        self.progress.reset(interval, first.raw_path().to_path_buf());

        let stop_requested = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let ctx = RecordLoop {
            source: Arc::clone(&self.source),
            output_dir: self.settings.output_dir.clone(),
            interval,
            frame_rate: self.source.frame_rate(),
            dispatcher,
            progress: Arc::clone(&self.progress),
            stop_requested: Arc::clone(&stop_requested),
            finished: Arc::clone(&finished),
        };

        let worker = std::thread::Builder::new()
            .name("record-loop".to_owned())
            .spawn(move || ctx.run(channel, namer, first))
            .inspect_err(|_| self.progress.set_phase(RecordPhase::Idle))?;

        log::info!(
            "Recording started in {} (rotating every {:?})",
            self.settings.output_dir.display(),
            interval
        );
        self.session = Some(RecordSession {
            stop_requested,
            finished,
            worker,
        });
        Ok(())
    }

    /// Ask the loop to close its segment and exit at the next tick. Does not wait.
    pub fn stop(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(CameraError::NotRunning)?;
        if session.stop_requested.load(Ordering::Acquire)
            || session.finished.load(Ordering::Acquire)
        {
            return Err(CameraError::NotRunning);
        }
        session.stop_requested.store(true, Ordering::Release);
        log::info!("Recording stop requested");
        Ok(())
    }

    /// Whether a stop has been requested (not necessarily completed).
    pub fn is_stopped(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |session| session.stop_requested.load(Ordering::Acquire))
    }

    /// Whether the loop has exited and its final segment is closed.
    pub fn is_finished(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |session| session.finished.load(Ordering::Acquire))
    }

    /// Wait for the current session's loop to exit and return what it recorded.
    ///
    /// Only meaningful after `stop`, or after the loop ended on its own.
    pub fn teardown(&mut self) -> Option<RecordSummary> {
        let session = self.session.take()?;
        match session.worker.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                log::error!("Record loop panicked");
                self.progress.set_phase(RecordPhase::Idle);
                None
            }
        }
    }

    /// Summary of the session that `start` tore down before opening a new one.
    pub const fn last_summary(&self) -> Option<&RecordSummary> {
        self.last_summary.as_ref()
    }

    /// Drop the finalizer handle so the pool can drain and exit. Later starts fail.
    pub fn detach_finalizer(&mut self) {
        self.dispatcher = None;
    }
}

struct RecordLoop<S> {
    source: Arc<S>,
    output_dir: PathBuf,
    interval: Duration,
    frame_rate: u32,
    dispatcher: FinalizeDispatcher,
    progress: Arc<RecordProgress>,
    stop_requested: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl<S: FrameSource> RecordLoop<S> {
    fn run(
        self,
        mut channel: S::Channel,
        mut namer: SegmentNamer,
        first: SegmentWriter,
    ) -> RecordSummary {
        let mut summary = RecordSummary::default();
        let mut active = first;

        loop {
            match channel.next_frame() {
                Ok(frame) => {
                    if let Err(err) = active.write_frame(&frame) {
                        log::error!("Writing {} failed: {err}", active.raw_path().display());
                        summary.failure = Some(err.to_string());
                        break;
                    }
                    self.progress.inner.write().frames_written += 1;
                }
                Err(err) if err.is_transient() => {
                    summary.decode_errors += 1;
                    self.progress.inner.write().decode_errors += 1;
                    log::debug!("Skipping frame: {err}");
                }
                Err(err) => {
                    log::warn!("Record capture ended: {err}");
                    summary.failure = Some(err.to_string());
                    break;
                }
            }

            self.source.set_overlay_text(&current_overlay_text());

            if active.elapsed() >= self.interval {
                self.progress.set_phase(RecordPhase::Rotating);
                let next_name = namer.next_name();
                match self.rotate(active, next_name, &mut summary) {
                    Ok(next) => {
                        let mut progress = self.progress.inner.write();
                        progress.phase = RecordPhase::Recording;
                        progress.current_segment = Some(next.raw_path().to_path_buf());
                        drop(progress);
                        active = next;
                    }
                    Err(err) => {
                        log::error!("Segment rotation failed: {err}");
                        summary.failure = Some(err.to_string());
                        self.finish_session(None);
                        return summary;
                    }
                }
            }

            if self.stop_requested.load(Ordering::Acquire) {
                break;
            }
        }

        self.finish_session(Some((active, &mut summary)));
        summary
    }

    /// Close `active`, queue it, and open the segment named `next_name`.
    fn rotate(
        &self,
        active: SegmentWriter,
        next_name: String,
        summary: &mut RecordSummary,
    ) -> Result<SegmentWriter> {
        let closed = active.finish()?;
        self.hand_off(closed, summary);
        let next = SegmentWriter::create(&self.output_dir, next_name)?;
        log::info!("Rotated to segment {}", next.base_name());
        Ok(next)
    }

    fn hand_off(&self, closed: SegmentRecord, summary: &mut RecordSummary) {
        let job = FinalizeJob::for_segment(&closed, self.frame_rate);
        // Rejections are logged and counted by the dispatcher; the raw file stays.
        let _ = self.dispatcher.dispatch(job);
        self.progress.inner.write().segments_closed += 1;
        summary.segments.push(closed);
    }

    fn finish_session(&self, active: Option<(SegmentWriter, &mut RecordSummary)>) {
        self.progress.set_phase(RecordPhase::Finishing);
        if let Some((writer, summary)) = active {
            match writer.finish() {
                Ok(closed) => self.hand_off(closed, summary),
                Err(err) => {
                    log::error!("Closing final segment failed: {err}");
                    summary.failure.get_or_insert_with(|| err.to_string());
                }
            }
        }
        {
            let mut progress = self.progress.inner.write();
            progress.phase = RecordPhase::Idle;
            progress.current_segment = None;
        }
        self.finished.store(true, Ordering::Release);
        log::info!("Recording stopped");
    }
}
