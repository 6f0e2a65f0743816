//! Pi-Cam-Monitor: camera monitoring for Raspberry Pi
//!
//! One camera feeds two independent activities: a live stream that keeps
//! the most recent frame available for display, and a recorder that writes
//! the encoded feed into fixed-interval segments and hands each closed
//! segment to an external tool for container conversion.
//!
//! Hardware access goes through the [`FrameSource`] trait, implemented by
//! [`V4L2Source`] for real devices and [`MockSource`] for tests and demos.

pub mod config;
pub mod controller;
pub mod device;
pub mod finalize;
pub mod mock;
pub mod recorder;
pub mod segment;
pub mod streamer;
pub mod traits;
pub mod validation;

pub use config::MonitorConfig;
pub use controller::{RecordStatus, SessionController, ShutdownReport};
pub use device::V4L2Source;
pub use finalize::{Finalize, FinalizeJob, FinalizeSnapshot, Mp4BoxFinalizer};
pub use mock::MockSource;
pub use recorder::{RecordPhase, RecordSummary};
pub use segment::SegmentRecord;
pub use streamer::{StreamState, StreamStatus};
pub use traits::{
    CameraError, CaptureChannel, CaptureMode, FourCC, Frame, FrameMetadata, FrameSource, Port,
    Resolution,
};

/// Initialise `env_logger` with `pi_cam_monitor=info` unless `RUST_LOG` says otherwise.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("pi_cam_monitor=info");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
