//! V4L2 frame source using the v4l crate.
//!
//! A single pump thread owns the mmap stream and fans every dequeued buffer
//! out to the channels currently subscribed, one bounded queue per port. A
//! slow consumer loses frames on its own port only.

use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    CameraError, CaptureChannel, CaptureMode, FourCC, Frame, FrameMetadata, FrameSource, Port,
    Resolution, Result,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Driver buffers requested for the mmap stream.
const BUFFER_COUNT: u32 = 4;
/// Frames queued per port before the pump starts dropping for that port.
const CHANNEL_DEPTH: usize = 8;
/// How long a dequeue may block before the pump rechecks its stop flag.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a consumer waits for a frame before reporting a timeout.
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
/// Consecutive dequeue failures after which the pump gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;
/// How long `open` waits for the stream to come up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Identification reported by the driver.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Driver name.
    pub driver: String,
    /// Card name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
}

#[derive(Debug, Default)]
struct PumpShared {
    subscribers: Mutex<HashMap<Port, Sender<Frame>>>,
    overlay: RwLock<Option<String>>,
    stop: AtomicBool,
    running: AtomicBool,
    dropped: AtomicU64,
}

impl PumpShared {
    fn fan_out(&self, frame: &Frame) {
        self.subscribers
            .lock()
            .retain(|port, tx| match tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Port {port} lagging, dropped frame {}", frame.metadata.sequence);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }
}

/// Camera opened through V4L2, shareable between a streamer and a recorder.
pub struct V4L2Source {
    info: DeviceInfo,
    resolution: Resolution,
    frame_rate: u32,
    fourcc: FourCC,
    shared: Arc<PumpShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl V4L2Source {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0) and start capturing.
    ///
    /// Any failure to find, configure or start the device is reported as
    /// `HardwareUnavailable`, except a format the driver refuses, which is
    /// `FormatNotSupported`.
    pub fn open(index: usize, resolution: Resolution, frame_rate: u32, fourcc: FourCC) -> Result<Self> {
        let unavailable = |err: std::io::Error| CameraError::HardwareUnavailable(err.to_string());

        let device = Device::new(index).map_err(unavailable)?;
        let caps = device.query_caps().map_err(unavailable)?;
        let can_capture = caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE);
        let can_stream = caps.capabilities.contains(v4l::capability::Flags::STREAMING);
        if !can_capture || !can_stream {
            return Err(CameraError::HardwareUnavailable(format!(
                "{} does not support streaming capture",
                caps.card
            )));
        }
        let info = DeviceInfo {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
        };

        let requested = v4l::Format::new(resolution.width, resolution.height, fourcc.into());
        let actual = device
            .set_format(&requested)
            .map_err(|err| CameraError::FormatNotSupported(err.to_string()))?;
        if FourCC::from(actual.fourcc) != fourcc {
            return Err(CameraError::FormatNotSupported(format!(
                "{} offered {} instead of {fourcc}",
                info.card,
                FourCC::from(actual.fourcc)
            )));
        }
        let resolution = Resolution::new(actual.width, actual.height);

        let params = device
            .set_params(&Parameters::with_fps(frame_rate))
            .map_err(unavailable)?;
        let frame_rate = match (params.interval.numerator, params.interval.denominator) {
            (0, _) | (_, 0) => frame_rate,
            (num, den) => (den / num).max(1),
        };

        let shared = Arc::new(PumpShared::default());
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let pump = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("v4l2-pump".to_owned())
                .spawn(move || run_pump(&device, &shared, fourcc, &ready_tx))?
        };

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = pump.join();
                return Err(err);
            }
            Err(_) => {
                shared.stop.store(true, Ordering::Release);
                let _ = pump.join();
                return Err(CameraError::HardwareUnavailable(
                    "capture stream did not start".to_owned(),
                ));
            }
        }

        log::info!(
            "Opened {} ({}) at {resolution} {fourcc} {frame_rate}fps",
            info.card,
            info.driver
        );

        Ok(Self {
            info,
            resolution,
            frame_rate,
            fourcc,
            shared,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    /// Driver identification.
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Negotiated pixel format.
    pub const fn fourcc(&self) -> FourCC {
        self.fourcc
    }

    /// Frames dropped because a consumer's queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSource for V4L2Source {
    type Channel = V4L2Channel;

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn capture_continuous(&self, port: Port, mode: CaptureMode) -> Result<V4L2Channel> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CameraError::SourceClosed);
        }
        if mode == CaptureMode::Encoded && !self.fourcc.is_encoded() {
            return Err(CameraError::FormatNotSupported(format!(
                "encoded capture needs H264, device delivers {}",
                self.fourcc
            )));
        }
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(CameraError::HardwareUnavailable(
                "capture pump has stopped".to_owned(),
            ));
        }

        let mut subscribers = self.shared.subscribers.lock();
        if subscribers.contains_key(&port) {
            return Err(CameraError::PortInUse(port));
        }
        let (tx, rx) = crossbeam_channel::bounded(CHANNEL_DEPTH);
        subscribers.insert(port, tx);
        log::debug!("Port {port} subscribed ({mode:?})");

        Ok(V4L2Channel {
            port,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    fn set_overlay_text(&self, text: &str) {
        let mut overlay = self.shared.overlay.write();
        if overlay.as_deref() != Some(text) {
            *overlay = Some(text.to_owned());
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CameraError::SourceClosed);
        }
        self.shared.stop.store(true, Ordering::Release);
        if let Some(pump) = self.pump.lock().take() {
            if pump.join().is_err() {
                log::error!("Capture pump panicked");
            }
        }
        self.shared.subscribers.lock().clear();
        log::info!("Closed {}", self.info.card);
        Ok(())
    }
}

impl Drop for V4L2Source {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

fn run_pump(device: &Device, shared: &PumpShared, fourcc: FourCC, ready: &Sender<Result<()>>) {
    let mut stream = match Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(CameraError::HardwareUnavailable(err.to_string())));
            return;
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);
    shared.running.store(true, Ordering::Release);
    let _ = ready.send(Ok(()));

    let mut failures = 0u32;
    while !shared.stop.load(Ordering::Acquire) {
        match stream.next() {
            Ok((buf, meta)) => {
                failures = 0;
                let len = usize::try_from(meta.bytesused).unwrap_or(buf.len());
                let data = buf.get(..len).unwrap_or(buf).to_vec();

                // Safe conversions: V4L2 timestamps are always non-negative in practice
                #[allow(clippy::cast_sign_loss)]
                let secs = meta.timestamp.sec.max(0) as u64;
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

                let frame = Frame {
                    data,
                    metadata: FrameMetadata {
                        sequence: u64::from(meta.sequence),
                        timestamp: Duration::new(secs, nanos),
                        bytes_used: meta.bytesused,
                        fourcc,
                        overlay: shared.overlay.read().clone(),
                    },
                };
                shared.fan_out(&frame);
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                log::debug!("Dequeue timed out");
            }
            Err(err) => {
                failures += 1;
                log::warn!("Dequeue failed ({failures}/{MAX_CONSECUTIVE_FAILURES}): {err}");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    log::error!("Capture pump giving up");
                    break;
                }
            }
        }
    }

    shared.running.store(false, Ordering::Release);
    // Dropping the senders ends every channel with StreamClosed.
    shared.subscribers.lock().clear();
}

/// One port's view of a `V4L2Source`.
pub struct V4L2Channel {
    port: Port,
    rx: Receiver<Frame>,
    shared: Arc<PumpShared>,
}

impl CaptureChannel for V4L2Channel {
    fn next_frame(&mut self) -> Result<Frame> {
        self.rx.recv_timeout(FRAME_TIMEOUT).map_err(|err| match err {
            RecvTimeoutError::Timeout => CameraError::Timeout,
            RecvTimeoutError::Disconnected => CameraError::StreamClosed,
        })
    }
}

impl Drop for V4L2Channel {
    fn drop(&mut self) {
        self.shared.subscribers.lock().remove(&self.port);
        log::debug!("Port {} released", self.port);
    }
}
