//! Live frame feed: a background loop publishing the most recent frame.

use crate::segment::current_overlay_text;
use crate::traits::{CameraError, CaptureChannel, CaptureMode, Frame, FrameSource, Port, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lifecycle of the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No session.
    Idle,
    /// Session started, camera warming up.
    Starting,
    /// Frames are being published.
    Running,
    /// Stop requested, loop draining.
    Stopping,
}

impl StreamState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Running | Self::Stopping)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Idle)
        )
    }

    /// Text shown next to the stream toggle.
    #[must_use]
    pub const fn notification(self) -> &'static str {
        match self {
            Self::Idle => "Stream off.",
            Self::Starting => "Warming up camera...",
            Self::Running => "Streaming",
            Self::Stopping => "Stopping stream...",
        }
    }
}

/// State holder that only accepts legal transitions.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<StreamState>,
}

impl StateCell {
    /// A cell in `Idle`.
    pub const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(StreamState::Idle),
        }
    }

    /// Current state.
    pub fn get(&self) -> StreamState {
        *self.state.lock()
    }

    /// Move to `next` if legal from the current state, returning the previous
    /// state. An illegal request leaves the state untouched and returns it as
    /// the error.
    pub fn advance(&self, next: StreamState) -> std::result::Result<StreamState, StreamState> {
        let mut state = self.state.lock();
        let current = *state;
        if current.can_advance_to(next) {
            *state = next;
            log::debug!("Stream state {current:?} -> {next:?}");
            Ok(current)
        } else {
            Err(current)
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Tuning for the stream loop.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Port the stream reads from.
    pub port: Port,
    /// Minimum time between start and `Running`.
    pub warmup: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            port: Port::PREVIEW,
            warmup: Duration::from_secs(3),
        }
    }
}

/// State shared between the streamer, its loop and status readers.
///
/// Lives as long as the [`Streamer`]; the latest-frame slot is cleared at the
/// start of each session.
#[derive(Debug, Default)]
pub struct StreamShared {
    state: StateCell,
    latest: RwLock<Option<Arc<Frame>>>,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
}

impl StreamShared {
    /// Most recent frame, if any has arrived in this session.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.read().clone()
    }

    /// Current stream state.
    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    /// Status snapshot for the UI.
    pub fn status(&self) -> StreamStatus {
        let state = self.state.get();
        StreamStatus {
            state,
            frames_received: self.frames_received.load(Ordering::Acquire),
            decode_errors: self.decode_errors.load(Ordering::Acquire),
            last_sequence: self.latest().map(|frame| frame.metadata.sequence),
        }
    }
}

/// Stream status for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    /// Current state.
    pub state: StreamState,
    /// Frames published in the current or last session.
    pub frames_received: u64,
    /// Frames skipped due to transient read errors.
    pub decode_errors: u64,
    /// Sequence number of the latest frame.
    pub last_sequence: Option<u64>,
}

impl StreamStatus {
    /// Text shown next to the stream toggle.
    pub const fn notification(&self) -> &'static str {
        self.state.notification()
    }
}

struct StreamSession {
    stop_requested: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Runs the live feed on its own port of a shared source.
pub struct Streamer<S: FrameSource> {
    source: Arc<S>,
    settings: StreamSettings,
    shared: Arc<StreamShared>,
    session: Option<StreamSession>,
}

impl<S: FrameSource> Streamer<S> {
    /// Create an idle streamer.
    pub fn new(source: Arc<S>, settings: StreamSettings) -> Self {
        Self {
            source,
            settings,
            shared: Arc::new(StreamShared::default()),
            session: None,
        }
    }

    /// Handle for lock-free status and frame reads.
    pub fn shared(&self) -> Arc<StreamShared> {
        Arc::clone(&self.shared)
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Begin streaming. Fails with `AlreadyRunning` unless idle; a session
    /// that was asked to stop is torn down first.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.state() == StreamState::Stopping {
            self.teardown();
        }
        if self.shared.state() != StreamState::Idle {
            return Err(CameraError::AlreadyRunning);
        }
        self.teardown();

        let channel = self
            .source
            .capture_continuous(self.settings.port, CaptureMode::Raw)?;

        *self.shared.latest.write() = None;
        self.shared.frames_received.store(0, Ordering::Release);
        self.shared.decode_errors.store(0, Ordering::Release);
        if let Err(state) = self.shared.state.advance(StreamState::Starting) {
            log::warn!("Stream start raced with state {state:?}");
            return Err(CameraError::AlreadyRunning);
        }

        let stop_requested = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let ctx = LoopContext {
            source: Arc::clone(&self.source),
            shared: Arc::clone(&self.shared),
            stop_requested: Arc::clone(&stop_requested),
            finished: Arc::clone(&finished),
            warmup: self.settings.warmup,
        };

        let spawned = std::thread::Builder::new()
            .name("stream-loop".to_owned())
            .spawn(move || stream_loop(channel, &ctx));
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                let _ = self.shared.state.advance(StreamState::Stopping);
                let _ = self.shared.state.advance(StreamState::Idle);
                return Err(err.into());
            }
        };

        log::info!("Streaming started on port {}", self.settings.port);
        self.session = Some(StreamSession {
            stop_requested,
            finished,
            worker,
        });
        Ok(())
    }

    /// Ask the loop to stop at its next iteration boundary. Does not wait.
    pub fn stop(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(CameraError::NotRunning)?;
        if session.stop_requested.load(Ordering::Acquire)
            || session.finished.load(Ordering::Acquire)
        {
            return Err(CameraError::NotRunning);
        }
        session.stop_requested.store(true, Ordering::Release);
        // The loop may already be on its way out after a capture failure.
        let _ = self.shared.state.advance(StreamState::Stopping);
        log::info!("Stream stop requested");
        Ok(())
    }

    /// Whether a stop has been requested (not necessarily completed).
    pub fn is_stopped(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |session| session.stop_requested.load(Ordering::Acquire))
    }

    /// Whether the background loop has exited and released its channel.
    pub fn is_finished(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |session| session.finished.load(Ordering::Acquire))
    }

    /// Wait for the current session's loop to exit and discard the session.
    ///
    /// Only meaningful after `stop`, or after the loop ended on its own;
    /// returns immediately when there is no session.
    pub fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            if session.worker.join().is_err() {
                log::error!("Stream loop panicked");
                let _ = self.shared.state.advance(StreamState::Stopping);
                let _ = self.shared.state.advance(StreamState::Idle);
            }
        }
    }
}

struct LoopContext<S> {
    source: Arc<S>,
    shared: Arc<StreamShared>,
    stop_requested: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    warmup: Duration,
}

fn stream_loop<S: FrameSource>(mut channel: S::Channel, ctx: &LoopContext<S>) {
    let started = Instant::now();

    loop {
        match channel.next_frame() {
            Ok(frame) => {
                ctx.source.set_overlay_text(&current_overlay_text());
                *ctx.shared.latest.write() = Some(Arc::new(frame));
                ctx.shared.frames_received.fetch_add(1, Ordering::AcqRel);

                if ctx.shared.state.get() == StreamState::Starting && started.elapsed() >= ctx.warmup
                {
                    let _ = ctx.shared.state.advance(StreamState::Running);
                }
            }
            Err(err) if err.is_transient() => {
                ctx.shared.decode_errors.fetch_add(1, Ordering::AcqRel);
                log::debug!("Skipping frame: {err}");
            }
            Err(err) => {
                log::warn!("Stream capture ended: {err}");
                break;
            }
        }

        if ctx.stop_requested.load(Ordering::Acquire) {
            break;
        }
    }

    drop(channel);
    // Self-terminated loops never saw `stop`, so move through Stopping here.
    let _ = ctx.shared.state.advance(StreamState::Stopping);
    let _ = ctx.shared.state.advance(StreamState::Idle);
    ctx.finished.store(true, Ordering::Release);
    log::info!("Streaming stopped");
}
