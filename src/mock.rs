//! Mock frame source for testing and demos without hardware.

use crate::traits::{
    CameraError, CaptureChannel, CaptureMode, FourCC, Frame, FrameMetadata, FrameSource, Port,
    Resolution, Result,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

struct MockShared {
    resolution: Resolution,
    frame_rate: u32,
    frame_interval: Duration,
    pattern: TestPattern,
    decode_failure_every: Option<u64>,
    unavailable_ports: HashSet<Port>,
    overlay: Mutex<Option<String>>,
    open_ports: Mutex<HashSet<Port>>,
    emitted: Mutex<HashMap<Port, u64>>,
    closed: AtomicBool,
    close_calls: AtomicU64,
    ports_open_at_close: AtomicU64,
    epoch: Instant,
}

/// Synthetic frame source paced at a fixed frame interval.
pub struct MockSource {
    shared: Arc<MockShared>,
}

/// Builder for [`MockSource`].
pub struct MockSourceBuilder {
    resolution: Resolution,
    frame_rate: u32,
    frame_interval: Option<Duration>,
    pattern: TestPattern,
    decode_failure_every: Option<u64>,
    unavailable_ports: HashSet<Port>,
}

impl MockSourceBuilder {
    /// Deliver frames at `interval` instead of `1 / frame_rate`.
    #[must_use]
    pub const fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Set the test pattern for raw frames.
    #[must_use]
    pub const fn pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Fail every `n`th frame read with a decode error.
    #[must_use]
    pub const fn decode_failure_every(mut self, n: u64) -> Self {
        self.decode_failure_every = Some(n);
        self
    }

    /// Make `capture_continuous` on `port` fail as if the hardware were busy.
    #[must_use]
    pub fn unavailable_port(mut self, port: Port) -> Self {
        self.unavailable_ports.insert(port);
        self
    }

    /// Open the mock source.
    pub fn open(self) -> Result<MockSource> {
        if self.frame_rate == 0 {
            return Err(CameraError::Config("frame rate must be non-zero".to_owned()));
        }
        let frame_interval = self
            .frame_interval
            .unwrap_or_else(|| Duration::from_secs(1) / self.frame_rate);

        Ok(MockSource {
            shared: Arc::new(MockShared {
                resolution: self.resolution,
                frame_rate: self.frame_rate,
                frame_interval,
                pattern: self.pattern,
                decode_failure_every: self.decode_failure_every,
                unavailable_ports: self.unavailable_ports,
                overlay: Mutex::new(None),
                open_ports: Mutex::new(HashSet::new()),
                emitted: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                close_calls: AtomicU64::new(0),
                ports_open_at_close: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        })
    }
}

impl MockSource {
    /// Start building a mock source with the given resolution and frame rate.
    #[must_use]
    pub fn builder(resolution: Resolution, frame_rate: u32) -> MockSourceBuilder {
        MockSourceBuilder {
            resolution,
            frame_rate,
            frame_interval: None,
            pattern: TestPattern::ColorBars,
            decode_failure_every: None,
            unavailable_ports: HashSet::new(),
        }
    }

    /// Open a mock source with default settings.
    pub fn open(resolution: Resolution, frame_rate: u32) -> Result<Self> {
        Self::builder(resolution, frame_rate).open()
    }

    /// Frames successfully delivered on `port` so far.
    pub fn emitted(&self, port: Port) -> u64 {
        self.shared.emitted.lock().get(&port).copied().unwrap_or(0)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of times `close` has been called.
    pub fn close_calls(&self) -> u64 {
        self.shared.close_calls.load(Ordering::Acquire)
    }

    /// Ports that were still claimed when the first `close` ran.
    pub fn ports_open_at_close(&self) -> u64 {
        self.shared.ports_open_at_close.load(Ordering::Acquire)
    }

    /// Ports currently claimed by a channel.
    pub fn open_port_count(&self) -> usize {
        self.shared.open_ports.lock().len()
    }

    /// Current overlay text.
    pub fn overlay_text(&self) -> Option<String> {
        self.shared.overlay.lock().clone()
    }
}

impl FrameSource for MockSource {
    type Channel = MockChannel;

    fn resolution(&self) -> Resolution {
        self.shared.resolution
    }

    fn frame_rate(&self) -> u32 {
        self.shared.frame_rate
    }

    fn capture_continuous(&self, port: Port, mode: CaptureMode) -> Result<Self::Channel> {
        if self.is_closed() {
            return Err(CameraError::SourceClosed);
        }
        if self.shared.unavailable_ports.contains(&port) {
            return Err(CameraError::HardwareUnavailable(format!(
                "mock port {port} is unavailable"
            )));
        }
        if !self.shared.open_ports.lock().insert(port) {
            return Err(CameraError::PortInUse(port));
        }

        Ok(MockChannel {
            shared: Arc::clone(&self.shared),
            port,
            mode,
            sequence: 0,
            next_deadline: Instant::now(),
        })
    }

    fn set_overlay_text(&self, text: &str) {
        *self.shared.overlay.lock() = Some(text.to_owned());
    }

    fn close(&self) -> Result<()> {
        self.shared.close_calls.fetch_add(1, Ordering::AcqRel);
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(CameraError::SourceClosed);
        }
        let open = self.shared.open_ports.lock().len() as u64;
        self.shared.ports_open_at_close.store(open, Ordering::Release);
        Ok(())
    }
}

/// Mock capture channel for testing.
pub struct MockChannel {
    shared: Arc<MockShared>,
    port: Port,
    mode: CaptureMode,
    sequence: u64,
    next_deadline: Instant,
}

impl CaptureChannel for MockChannel {
    fn next_frame(&mut self) -> Result<Frame> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CameraError::StreamClosed);
        }

        let now = Instant::now();
        if self.next_deadline > now {
            std::thread::sleep(self.next_deadline - now);
        }
        self.next_deadline += self.shared.frame_interval;

        let seq = self.sequence;
        self.sequence += 1;

        if let Some(every) = self.shared.decode_failure_every {
            if every > 0 && (seq + 1) % every == 0 {
                return Err(CameraError::FrameDecode(format!("mock failure at {seq}")));
            }
        }

        let (data, fourcc) = match self.mode {
            CaptureMode::Raw => (
                generate_test_frame(self.shared.resolution, self.shared.pattern),
                FourCC::YUYV,
            ),
            CaptureMode::Encoded => (generate_access_unit(seq), FourCC::H264),
        };

        *self.shared.emitted.lock().entry(self.port).or_insert(0) += 1;

        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = data.len() as u32;
        Ok(Frame {
            data,
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: self.shared.epoch.elapsed(),
                bytes_used,
                fourcc,
                overlay: self.shared.overlay.lock().clone(),
            },
        })
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.shared.open_ports.lock().remove(&self.port);
    }
}

/// Build a small Annex-B access unit carrying the sequence number.
fn generate_access_unit(seq: u64) -> Vec<u8> {
    // IDR every 30 frames, non-IDR slice otherwise
    let nal_header = if seq % 30 == 0 { 0x65 } else { 0x41 };
    let mut data = vec![0, 0, 0, 1, nal_header];
    data.extend_from_slice(&seq.to_be_bytes());
    data
}

/// Generate test frame data based on pattern.
fn generate_test_frame(resolution: Resolution, pattern: TestPattern) -> Vec<u8> {
    let size = (resolution.width * resolution.height * 2) as usize; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, resolution.width);
        }
        TestPattern::Solid(y, u, v) => {
            fill_pixels(&mut data, |_| (y, u, v));
        }
    }

    data
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let bar_width = (width / 8).max(1);
    fill_pixels(data, |pair| {
        #[allow(clippy::cast_possible_truncation)]
        let x = ((pair * 2) % width as usize) as u32;
        let bar_idx = (x / bar_width).min(7) as usize;
        BARS.get(bar_idx).copied().unwrap_or((16, 128, 128))
    });
}

/// Write `[Y0 U Y1 V]` for every pixel pair, coloured by `color(pair_index)`.
fn fill_pixels<F>(data: &mut [u8], color: F)
where
    F: Fn(usize) -> (u8, u8, u8),
{
    for (pair, chunk) in data.chunks_exact_mut(4).enumerate() {
        let (y, u, v) = color(pair);
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Resolution {
        Resolution::new(64, 48)
    }

    #[test]
    fn test_mock_source_creation() {
        let source = MockSource::open(small(), 30).expect("open should succeed");
        assert_eq!(source.resolution(), small());
        assert_eq!(source.frame_rate(), 30);
        assert!(!source.is_closed());
    }

    #[test]
    fn test_zero_frame_rate_rejected() {
        assert!(matches!(
            MockSource::open(small(), 0),
            Err(CameraError::Config(_))
        ));
    }

    #[test]
    fn test_mock_channel_capture() {
        let source = MockSource::builder(small(), 30)
            .frame_interval(Duration::from_millis(1))
            .open()
            .expect("open should succeed");
        let mut channel = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture should succeed");

        let frame1 = channel.next_frame().expect("next_frame should succeed");
        assert_eq!(frame1.metadata.sequence, 0);
        assert_eq!(frame1.data.len(), 64 * 48 * 2);
        assert_eq!(frame1.metadata.fourcc, FourCC::YUYV);

        let frame2 = channel.next_frame().expect("next_frame should succeed");
        assert_eq!(frame2.metadata.sequence, 1);
        assert_eq!(source.emitted(Port::PREVIEW), 2);
    }

    #[test]
    fn test_encoded_frames_are_annex_b() {
        let source = MockSource::builder(small(), 30)
            .frame_interval(Duration::from_millis(1))
            .open()
            .expect("open should succeed");
        let mut channel = source
            .capture_continuous(Port::RECORD, CaptureMode::Encoded)
            .expect("capture should succeed");
        let frame = channel.next_frame().expect("next_frame should succeed");
        assert!(frame.data.starts_with(&[0, 0, 0, 1, 0x65]));
        assert_eq!(frame.metadata.fourcc, FourCC::H264);
    }

    #[test]
    fn test_port_exclusive_until_dropped() {
        let source = MockSource::open(small(), 30).expect("open should succeed");
        let channel = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture should succeed");
        assert!(matches!(
            source.capture_continuous(Port::PREVIEW, CaptureMode::Raw),
            Err(CameraError::PortInUse(Port::PREVIEW))
        ));
        assert!(source
            .capture_continuous(Port::RECORD, CaptureMode::Encoded)
            .is_ok());

        drop(channel);
        assert!(source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .is_ok());
    }

    #[test]
    fn test_overlay_attached_to_frames() {
        let source = MockSource::builder(small(), 30)
            .frame_interval(Duration::from_millis(1))
            .open()
            .expect("open should succeed");
        let mut channel = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture should succeed");
        source.set_overlay_text("2017-07-12 10:00:00");
        let frame = channel.next_frame().expect("next_frame should succeed");
        assert_eq!(frame.metadata.overlay.as_deref(), Some("2017-07-12 10:00:00"));
    }

    #[test]
    fn test_decode_failures_injected() {
        let source = MockSource::builder(small(), 30)
            .frame_interval(Duration::from_millis(1))
            .decode_failure_every(3)
            .open()
            .expect("open should succeed");
        let mut channel = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture should succeed");
        assert!(channel.next_frame().is_ok());
        assert!(channel.next_frame().is_ok());
        let err = channel.next_frame().expect_err("third read should fail");
        assert!(err.is_transient());
        assert_eq!(source.emitted(Port::PREVIEW), 2);
    }

    #[test]
    fn test_close_once() {
        let source = MockSource::open(small(), 30).expect("open should succeed");
        let mut channel = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture should succeed");
        assert!(source.close().is_ok());
        assert_eq!(source.ports_open_at_close(), 1);
        assert!(matches!(source.close(), Err(CameraError::SourceClosed)));
        assert_eq!(source.close_calls(), 2);
        assert!(matches!(
            channel.next_frame(),
            Err(CameraError::StreamClosed)
        ));
    }

    #[test]
    fn test_color_bars_pattern() {
        let data = generate_test_frame(Resolution::new(640, 480), TestPattern::ColorBars);
        assert_eq!(data.len(), 640 * 480 * 2);
        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
        // Last pixel pair of the first row falls in the black bar
        assert_eq!(data[638 * 2], 16);
    }

    #[test]
    fn test_solid_pattern() {
        let data = generate_test_frame(Resolution::new(64, 64), TestPattern::Solid(128, 64, 192));
        assert_eq!(data[0], 128);
        assert_eq!(data[2], 128);
        assert_eq!(data[1], 64);
        assert_eq!(data[3], 192);
    }
}
