//! Segment files: naming, writing and the record kept for each closed segment.

use crate::traits::{Frame, Result};
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Prefix of every segment base name.
pub const SEGMENT_PREFIX: &str = "recording-";
/// Extension of the raw encoded segment.
pub const RAW_EXTENSION: &str = "h264";
/// Extension of the finalized container.
pub const CONTAINER_EXTENSION: &str = "mp4";

/// Overlay annotation for the given instant, e.g. `2017-07-12 10:04:59`.
pub fn overlay_text(now: &DateTime<Local>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Overlay annotation for the current local time.
pub fn current_overlay_text() -> String {
    overlay_text(&Local::now())
}

/// Segment base name for the given instant, e.g. `recording-2017-07-12-10_04_59`.
pub fn segment_base_name(now: &DateTime<Local>) -> String {
    format!("{SEGMENT_PREFIX}{}", now.format("%Y-%m-%d-%H_%M_%S"))
}

/// Hands out unique base names within one output directory.
///
/// Names carry one-second resolution, so rotations closer than a second
/// apart (or leftovers from an earlier run) get a `-N` suffix.
#[derive(Debug)]
pub struct SegmentNamer {
    output_dir: PathBuf,
    last_stem: Option<String>,
    suffix: u32,
}

impl SegmentNamer {
    /// Create a namer for `output_dir`.
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
            last_stem: None,
            suffix: 0,
        }
    }

    /// Next free base name for the current local time.
    pub fn next_name(&mut self) -> String {
        self.next_name_at(&Local::now())
    }

    /// Next free base name for `now`.
    pub fn next_name_at(&mut self, now: &DateTime<Local>) -> String {
        let stem = segment_base_name(now);
        if self.last_stem.as_deref() == Some(stem.as_str()) {
            self.suffix += 1;
        } else {
            self.last_stem = Some(stem.clone());
            self.suffix = 0;
        }

        loop {
            let candidate = if self.suffix == 0 {
                stem.clone()
            } else {
                format!("{stem}-{}", self.suffix)
            };
            if !self.is_taken(&candidate) {
                return candidate;
            }
            self.suffix += 1;
        }
    }

    fn is_taken(&self, base_name: &str) -> bool {
        raw_path(&self.output_dir, base_name).exists()
            || container_path(&self.output_dir, base_name).exists()
    }
}

/// Path of the raw segment for `base_name`.
pub fn raw_path(dir: &Path, base_name: &str) -> PathBuf {
    dir.join(format!("{base_name}.{RAW_EXTENSION}"))
}

/// Path of the finalized container for `base_name`.
pub fn container_path(dir: &Path, base_name: &str) -> PathBuf {
    dir.join(format!("{base_name}.{CONTAINER_EXTENSION}"))
}

/// A closed segment.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    /// Base name shared by the raw file and the container.
    pub base_name: String,
    /// Path of the raw encoded file.
    pub raw_path: PathBuf,
    /// Frames written to the segment.
    pub frames: u64,
    /// Sequence number of the first frame written.
    pub first_sequence: Option<u64>,
    /// Sequence number of the last frame written.
    pub last_sequence: Option<u64>,
    /// Bytes written to the raw file.
    pub bytes: u64,
    /// When the segment was opened.
    pub opened_at: Instant,
    /// When the segment was closed.
    pub closed_at: Instant,
}

impl SegmentRecord {
    /// Wall time the segment was open.
    pub fn duration(&self) -> Duration {
        self.closed_at.duration_since(self.opened_at)
    }
}

/// The active segment: frames are appended until `finish` closes it.
pub struct SegmentWriter {
    base_name: String,
    raw_path: PathBuf,
    file: BufWriter<File>,
    frames: u64,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
    bytes: u64,
    opened_at: Instant,
}

impl SegmentWriter {
    /// Create the raw file for `base_name` inside `dir`.
    pub fn create(dir: &Path, base_name: String) -> Result<Self> {
        let raw_path = raw_path(dir, &base_name);
        let file = File::create(&raw_path)?;
        log::debug!("Opened segment {}", raw_path.display());
        Ok(Self {
            base_name,
            raw_path,
            file: BufWriter::new(file),
            frames: 0,
            first_sequence: None,
            last_sequence: None,
            bytes: 0,
            opened_at: Instant::now(),
        })
    }

    /// Append one encoded frame.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.file.write_all(&frame.data)?;
        self.frames += 1;
        self.bytes += frame.data.len() as u64;
        self.first_sequence.get_or_insert(frame.metadata.sequence);
        self.last_sequence = Some(frame.metadata.sequence);
        Ok(())
    }

    /// Base name of this segment.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Path of the raw file being written.
    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    /// Time since the segment was opened.
    pub fn elapsed(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Flush and close the file.
    pub fn finish(mut self) -> Result<SegmentRecord> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        log::debug!(
            "Closed segment {} ({} frames, {} bytes)",
            self.raw_path.display(),
            self.frames,
            self.bytes
        );
        Ok(SegmentRecord {
            base_name: self.base_name,
            raw_path: self.raw_path,
            frames: self.frames,
            first_sequence: self.first_sequence,
            last_sequence: self.last_sequence,
            bytes: self.bytes,
            opened_at: self.opened_at,
            closed_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FourCC, FrameMetadata};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2017, 7, 12, h, m, s)
            .single()
            .expect("unambiguous local time")
    }

    fn frame(sequence: u64, data: &[u8]) -> Frame {
        Frame {
            data: data.to_vec(),
            metadata: FrameMetadata {
                sequence,
                timestamp: Duration::ZERO,
                bytes_used: 0,
                fourcc: FourCC::H264,
                overlay: None,
            },
        }
    }

    #[test]
    fn test_name_formats() {
        assert_eq!(segment_base_name(&at(9, 5, 7)), "recording-2017-07-12-09_05_07");
        assert_eq!(overlay_text(&at(23, 59, 1)), "2017-07-12 23:59:01");
    }

    #[test]
    fn test_namer_suffixes_same_second() {
        let dir = tempdir().expect("tempdir");
        let mut namer = SegmentNamer::new(dir.path());
        let now = at(10, 0, 0);
        assert_eq!(namer.next_name_at(&now), "recording-2017-07-12-10_00_00");
        assert_eq!(namer.next_name_at(&now), "recording-2017-07-12-10_00_00-1");
        assert_eq!(namer.next_name_at(&now), "recording-2017-07-12-10_00_00-2");
        assert_eq!(namer.next_name_at(&at(10, 0, 1)), "recording-2017-07-12-10_00_01");
    }

    #[test]
    fn test_namer_skips_existing_files() {
        let dir = tempdir().expect("tempdir");
        let now = at(10, 0, 0);
        std::fs::write(container_path(dir.path(), &segment_base_name(&now)), b"old")
            .expect("write");
        let mut namer = SegmentNamer::new(dir.path());
        assert_eq!(namer.next_name_at(&now), "recording-2017-07-12-10_00_00-1");
    }

    #[test]
    fn test_writer_records_frames() {
        let dir = tempdir().expect("tempdir");
        let mut writer =
            SegmentWriter::create(dir.path(), "recording-test".to_owned()).expect("create");
        writer.write_frame(&frame(7, &[0, 0, 0, 1, 0x65])).expect("write");
        writer.write_frame(&frame(8, &[0, 0, 0, 1, 0x41, 9])).expect("write");
        let record = writer.finish().expect("finish");

        assert_eq!(record.frames, 2);
        assert_eq!(record.bytes, 11);
        assert_eq!(record.first_sequence, Some(7));
        assert_eq!(record.last_sequence, Some(8));
        let contents = std::fs::read(&record.raw_path).expect("read segment");
        assert_eq!(contents.len(), 11);
        assert!(record.raw_path.ends_with("recording-test.h264"));
    }

    #[test]
    fn test_writer_fails_in_missing_dir() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert!(SegmentWriter::create(&missing, "recording-x".to_owned()).is_err());
    }
}
