//! Segment finalization: wrapping raw segments into a playable container.
//!
//! Completed segments are handed to a [`FinalizerPool`], a fixed set of
//! worker threads draining a bounded queue. Dispatch never blocks the
//! capture loop; a failed or panicking job only affects its own segment,
//! whose raw file is then kept on disk for manual recovery.

use crate::segment::{container_path, SegmentRecord};
use crate::traits::{CameraError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// One raw segment waiting to be finalized.
#[derive(Debug, Clone)]
pub struct FinalizeJob {
    /// Raw encoded input.
    pub raw_path: PathBuf,
    /// Container to produce.
    pub output_path: PathBuf,
    /// Declared frame rate of the raw stream.
    pub frame_rate: u32,
}

impl FinalizeJob {
    /// Job for a closed segment, writing the container next to the raw file.
    pub fn for_segment(segment: &SegmentRecord, frame_rate: u32) -> Self {
        let dir = segment
            .raw_path
            .parent()
            .map_or_else(PathBuf::new, std::path::Path::to_path_buf);
        Self {
            raw_path: segment.raw_path.clone(),
            output_path: container_path(&dir, &segment.base_name),
            frame_rate,
        }
    }
}

/// Converts a raw segment into its container.
pub trait Finalize: Send + Sync + 'static {
    /// Produce `job.output_path` from `job.raw_path`. Must not remove the raw
    /// file; the pool does that after success.
    fn finalize(&self, job: &FinalizeJob) -> Result<()>;
}

/// Finalizer invoking the `MP4Box` command-line tool.
#[derive(Debug, Clone)]
pub struct Mp4BoxFinalizer {
    program: PathBuf,
}

impl Mp4BoxFinalizer {
    /// Use `program` as the `MP4Box` executable.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Mp4BoxFinalizer {
    fn default() -> Self {
        Self::new("MP4Box")
    }
}

impl Finalize for Mp4BoxFinalizer {
    fn finalize(&self, job: &FinalizeJob) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("-add")
            .arg(format!("{}:fps={}", job.raw_path.display(), job.frame_rate))
            .arg("-new")
            .arg(&job.output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| {
                CameraError::Finalization(format!(
                    "failed to run {}: {err}",
                    self.program.display()
                ))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CameraError::Finalization(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Counters shared by the pool workers and the status readers.
#[derive(Debug, Default)]
pub struct FinalizeStats {
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl FinalizeStats {
    fn record_failure(&self, message: String) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        *self.last_failure.lock() = Some(message);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> FinalizeSnapshot {
        FinalizeSnapshot {
            completed: self.completed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Acquire),
            last_failure: self.last_failure.lock().clone(),
        }
    }
}

/// Finalization outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeSnapshot {
    /// Segments finalized and their raw file removed.
    pub completed: u64,
    /// Segments whose finalization failed (raw file kept).
    pub failed: u64,
    /// Segments not queued because the queue was full or closed (raw file kept).
    pub rejected: u64,
    /// Message of the most recent failure.
    pub last_failure: Option<String>,
}

/// Non-blocking handle used by the recorder to queue jobs.
#[derive(Clone)]
pub struct FinalizeDispatcher {
    tx: Sender<FinalizeJob>,
    stats: Arc<FinalizeStats>,
}

impl FinalizeDispatcher {
    /// Queue `job` without waiting. A rejected job leaves its raw file in place.
    pub fn dispatch(&self, job: FinalizeJob) -> Result<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => {
                self.stats.rejected.fetch_add(1, Ordering::AcqRel);
                let message = format!(
                    "finalization queue unavailable, keeping {}",
                    job.raw_path.display()
                );
                log::warn!("{message}");
                *self.stats.last_failure.lock() = Some(message.clone());
                Err(CameraError::Finalization(message))
            }
        }
    }
}

/// Bounded pool of finalization workers.
pub struct FinalizerPool {
    tx: Option<Sender<FinalizeJob>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<FinalizeStats>,
}

impl FinalizerPool {
    /// Spawn `workers` threads draining a queue of at most `capacity` jobs.
    pub fn new(finalizer: Arc<dyn Finalize>, workers: usize, capacity: usize) -> Result<Self> {
        if workers == 0 || capacity == 0 {
            return Err(CameraError::Config(
                "finalizer pool needs at least one worker and one queue slot".to_owned(),
            ));
        }

        let (tx, rx) = bounded::<FinalizeJob>(capacity);
        let stats = Arc::new(FinalizeStats::default());
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx = rx.clone();
            let finalizer = Arc::clone(&finalizer);
            let stats = Arc::clone(&stats);
            let handle = std::thread::Builder::new()
                .name(format!("finalize-{index}"))
                .spawn(move || worker_loop(&rx, finalizer.as_ref(), &stats))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
            stats,
        })
    }

    /// Handle for queueing jobs.
    pub fn dispatcher(&self) -> Option<FinalizeDispatcher> {
        self.tx.as_ref().map(|tx| FinalizeDispatcher {
            tx: tx.clone(),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<FinalizeStats> {
        Arc::clone(&self.stats)
    }

    /// Close the queue, let the workers drain it, and join them.
    ///
    /// Workers exit once every dispatcher clone has been dropped as well.
    pub fn shutdown(&mut self) -> FinalizeSnapshot {
        self.tx = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Finalizer worker panicked");
            }
        }
        self.stats.snapshot()
    }
}

impl Drop for FinalizerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

fn worker_loop(rx: &Receiver<FinalizeJob>, finalizer: &dyn Finalize, stats: &FinalizeStats) {
    for job in rx {
        log::info!(
            "Finalizing {} -> {}",
            job.raw_path.display(),
            job.output_path.display()
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| finalizer.finalize(&job)));
        match outcome {
            Ok(Ok(())) => {
                if let Err(err) = std::fs::remove_file(&job.raw_path) {
                    log::warn!(
                        "Finalized {} but could not remove raw file: {err}",
                        job.output_path.display()
                    );
                }
                stats.completed.fetch_add(1, Ordering::AcqRel);
            }
            Ok(Err(err)) => {
                log::error!(
                    "Finalization of {} failed, raw file kept: {err}",
                    job.raw_path.display()
                );
                stats.record_failure(err.to_string());
            }
            Err(_) => {
                log::error!(
                    "Finalizer panicked on {}, raw file kept",
                    job.raw_path.display()
                );
                stats.record_failure(format!("finalizer panicked on {}", job.raw_path.display()));
            }
        }
    }
}
