//! Continuity checks for captured frames and recorded segments.
//!
//! Used by the integration suites to confirm that nothing was lost between
//! the source and the segment files.

use crate::segment::SegmentRecord;
use crate::traits::{CameraError, Frame, Result};

/// Annex-B start codes an encoded access unit may begin with.
const START_CODES: [&[u8]; 2] = [&[0, 0, 0, 1], &[0, 0, 1]];

/// Validates that a sequence of frames has incrementing sequence numbers.
///
/// # Errors
///
/// Returns `StreamError` if:
/// - The frames slice is empty
/// - Any sequence number doesn't increment by exactly 1 from the previous
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::StreamError(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.metadata.sequence + 1;
            let got = curr.metadata.sequence;
            if got != expected {
                return Err(CameraError::StreamError(format!(
                    "Frame sequence gap at index {}: expected {expected}, got {got}",
                    i + 1
                )));
            }
        }
    }

    Ok(())
}

/// Validates that consecutive segments cover an unbroken frame sequence.
///
/// Every segment must hold at least one frame, its own sequence range must
/// match its frame count, and each segment must start right after the
/// previous one ended.
///
/// # Errors
///
/// Returns `StreamError` describing the first break found.
pub fn validate_segment_continuity(segments: &[SegmentRecord]) -> Result<()> {
    let mut previous_last: Option<u64> = None;

    for segment in segments {
        let (Some(first), Some(last)) = (segment.first_sequence, segment.last_sequence) else {
            return Err(CameraError::StreamError(format!(
                "Segment {} holds no frames",
                segment.base_name
            )));
        };

        if last < first || last - first + 1 != segment.frames {
            return Err(CameraError::StreamError(format!(
                "Segment {} spans {first}..={last} but holds {} frames",
                segment.base_name, segment.frames
            )));
        }

        if let Some(prev) = previous_last {
            if first != prev + 1 {
                return Err(CameraError::StreamError(format!(
                    "Segment {} starts at {first}, previous segment ended at {prev}",
                    segment.base_name
                )));
            }
        }
        previous_last = Some(last);
    }

    Ok(())
}

/// Validates that an encoded payload (one frame or a whole raw segment)
/// begins with an Annex-B start code.
///
/// # Errors
///
/// Returns `FrameDecode` if the payload has no start code.
pub fn validate_annex_b(data: &[u8]) -> Result<()> {
    if START_CODES.iter().any(|code| data.starts_with(code)) {
        Ok(())
    } else {
        Err(CameraError::FrameDecode(format!(
            "{} bytes without an Annex-B start code",
            data.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSource;
    use crate::traits::{CaptureChannel, CaptureMode, FrameSource, Port, Resolution};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn mock() -> MockSource {
        MockSource::builder(Resolution::new(64, 48), 30)
            .frame_interval(Duration::from_millis(1))
            .open()
            .expect("mock source")
    }

    fn segment(name: &str, range: Option<(u64, u64)>, frames: u64) -> SegmentRecord {
        let now = Instant::now();
        SegmentRecord {
            base_name: name.to_owned(),
            raw_path: PathBuf::from(format!("{name}.h264")),
            frames,
            first_sequence: range.map(|(first, _)| first),
            last_sequence: range.map(|(_, last)| last),
            bytes: frames * 13,
            opened_at: now,
            closed_at: now,
        }
    }

    #[test]
    fn test_validate_frame_sequence_success() {
        let source = mock();
        let mut channel = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture");

        let frames: Vec<Frame> = (0..5)
            .map(|_| channel.next_frame().expect("next_frame failed"))
            .collect();

        let result = validate_frame_sequence(&frames);
        assert!(
            result.is_ok(),
            "Frame sequence validation should succeed: {result:?}"
        );
    }

    #[test]
    fn test_validate_frame_sequence_empty() {
        let frames: Vec<Frame> = vec![];
        assert!(validate_frame_sequence(&frames).is_err());
    }

    #[test]
    fn test_validate_frame_sequence_with_gap() {
        let source = mock();
        let mut channel = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture");

        let mut frames = vec![
            channel.next_frame().expect("next_frame failed"),
            channel.next_frame().expect("next_frame failed"),
        ];

        // Skip a frame to create a gap
        let _ = channel.next_frame().expect("next_frame failed");

        frames.push(channel.next_frame().expect("next_frame failed"));

        assert!(
            validate_frame_sequence(&frames).is_err(),
            "Frame sequence validation should fail with gap"
        );
    }

    #[test]
    fn test_segment_continuity() {
        let segments = [
            segment("a", Some((0, 9)), 10),
            segment("b", Some((10, 14)), 5),
            segment("c", Some((15, 15)), 1),
        ];
        assert!(validate_segment_continuity(&segments).is_ok());
        assert!(validate_segment_continuity(&[]).is_ok());
    }

    #[test]
    fn test_segment_continuity_gap() {
        let segments = [segment("a", Some((0, 9)), 10), segment("b", Some((11, 14)), 4)];
        assert!(validate_segment_continuity(&segments).is_err());
    }

    #[test]
    fn test_segment_continuity_count_mismatch() {
        let segments = [segment("a", Some((0, 9)), 9)];
        assert!(validate_segment_continuity(&segments).is_err());
    }

    #[test]
    fn test_segment_continuity_empty_segment() {
        let segments = [segment("a", None, 0)];
        assert!(validate_segment_continuity(&segments).is_err());
    }

    #[test]
    fn test_annex_b() {
        let source = mock();
        let mut channel = source
            .capture_continuous(Port::RECORD, CaptureMode::Encoded)
            .expect("capture");
        let frame = channel.next_frame().expect("next_frame failed");
        assert!(validate_annex_b(&frame.data).is_ok());

        let mut raw = source
            .capture_continuous(Port::PREVIEW, CaptureMode::Raw)
            .expect("capture");
        let mut frame = raw.next_frame().expect("next_frame failed");
        frame.data = vec![1, 2, 3, 4];
        assert!(validate_annex_b(&frame.data).is_err());
    }
}
