//! Core traits and types for the frame source abstraction.

use std::fmt;
use std::time::Duration;

/// Pixel format representation (e.g., YUYV, MJPG, H264).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// H.264 elementary stream (Annex B).
    pub const H264: Self = Self::new(b"H264");

    /// Parse a four-character code such as `"H264"`.
    pub fn parse(code: &str) -> Result<Self> {
        let bytes: [u8; 4] = code
            .as_bytes()
            .try_into()
            .map_err(|_| CameraError::FormatNotSupported(format!("invalid fourcc {code:?}")))?;
        Ok(Self(bytes))
    }

    /// Whether frames in this format are an encoded bitstream.
    #[must_use]
    pub fn is_encoded(self) -> bool {
        self == Self::H264
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Capture resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Logical capture channel on a shared source.
///
/// Each consumer reads from its own port so that the streamer and the
/// recorder never contend for the same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port(pub u8);

impl Port {
    /// Port used by the live stream.
    pub const PREVIEW: Self = Self(0);
    /// Port used by the segment recorder.
    pub const RECORD: Self = Self(1);
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output selection for a capture channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Frames as delivered by the driver, for display.
    Raw,
    /// Encoded bitstream suitable for writing straight to a segment file.
    Encoded,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
    /// Pixel format of `data`.
    pub fourcc: FourCC,
    /// Annotation text in effect when the frame was captured.
    pub overlay: Option<String>,
}

/// A captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Error type for camera, session and recording operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The device is missing, busy or lacks streaming capture.
    #[error("camera hardware unavailable: {0}")]
    HardwareUnavailable(String),
    /// Another consumer already holds this port.
    #[error("capture port {0} is already in use")]
    PortInUse(Port),
    /// Requested format or mode is not supported by the source.
    #[error("format not supported: {0}")]
    FormatNotSupported(String),
    /// A single frame could not be dequeued or decoded.
    #[error("frame decode error: {0}")]
    FrameDecode(String),
    /// Error during streaming operation.
    #[error("stream error: {0}")]
    StreamError(String),
    /// The channel's source stopped delivering frames.
    #[error("capture stream closed")]
    StreamClosed,
    /// The frame source has already been closed.
    #[error("frame source already closed")]
    SourceClosed,
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// A start was requested while the activity is running.
    #[error("session is already running")]
    AlreadyRunning,
    /// A stop was requested while the activity is not running.
    #[error("session is not running")]
    NotRunning,
    /// Converting a raw segment into its container failed.
    #[error("segment finalization failed: {0}")]
    Finalization(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The controller has been shut down.
    #[error("session controller is shut down")]
    ShutDown,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Per-frame errors that a capture loop skips over.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::FrameDecode(_) | Self::Timeout)
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// A camera that can feed several independent consumers.
pub trait FrameSource: Send + Sync + 'static {
    /// The channel type returned by `capture_continuous`.
    type Channel: CaptureChannel + Send + 'static;

    /// Negotiated capture resolution.
    fn resolution(&self) -> Resolution;

    /// Negotiated frame rate in frames per second.
    fn frame_rate(&self) -> u32;

    /// Open a continuous capture on `port`. The port stays claimed until the
    /// returned channel is dropped.
    fn capture_continuous(&self, port: Port, mode: CaptureMode) -> Result<Self::Channel>;

    /// Set the annotation attached to subsequent frames.
    fn set_overlay_text(&self, text: &str);

    /// Release the hardware. Must be called exactly once.
    fn close(&self) -> Result<()>;
}

/// Abstraction over capture stream operations.
pub trait CaptureChannel {
    /// Capture the next frame from the stream.
    fn next_frame(&mut self) -> Result<Frame>;
}
