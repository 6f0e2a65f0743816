//! Property tests for the stream state machine and segment naming.

use chrono::{Local, TimeZone};
use pi_cam_monitor::mock::MockSource;
use pi_cam_monitor::segment::{segment_base_name, SegmentNamer};
use pi_cam_monitor::streamer::{StateCell, StreamSettings, Streamer};
use pi_cam_monitor::{CameraError, Port, Resolution, StreamState};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Toggle {
    Start,
    Stop,
    Teardown,
}

fn any_toggle() -> impl Strategy<Value = Toggle> {
    prop_oneof![Just(Toggle::Start), Just(Toggle::Stop), Just(Toggle::Teardown)]
}

/// States the loop can reach from `state` without a call on the streamer.
fn settles_to(state: StreamState) -> Vec<StreamState> {
    match state {
        StreamState::Starting => vec![StreamState::Starting, StreamState::Running],
        StreamState::Stopping => vec![StreamState::Stopping, StreamState::Idle],
        other => vec![other],
    }
}

fn any_state() -> impl Strategy<Value = StreamState> {
    prop_oneof![
        Just(StreamState::Idle),
        Just(StreamState::Starting),
        Just(StreamState::Running),
        Just(StreamState::Stopping),
    ]
}

proptest! {
    /// Whatever is requested, the cell only ever walks legal edges.
    #[test]
    fn state_cell_only_takes_legal_edges(requests in prop::collection::vec(any_state(), 0..64)) {
        let cell = StateCell::new();
        for next in requests {
            let before = cell.get();
            match cell.advance(next) {
                Ok(previous) => {
                    prop_assert_eq!(previous, before);
                    prop_assert!(before.can_advance_to(next));
                    prop_assert_eq!(cell.get(), next);
                }
                Err(current) => {
                    prop_assert_eq!(current, before);
                    prop_assert!(!before.can_advance_to(next));
                    prop_assert_eq!(cell.get(), before);
                }
            }
        }
    }

    /// Every state can get back to idle.
    #[test]
    fn every_state_drains_to_idle(start in any_state()) {
        let path = match start {
            StreamState::Idle => vec![],
            StreamState::Starting | StreamState::Running => {
                vec![StreamState::Stopping, StreamState::Idle]
            }
            StreamState::Stopping => vec![StreamState::Idle],
        };
        let mut state = start;
        for next in path {
            prop_assert!(state.can_advance_to(next));
            state = next;
        }
        prop_assert_eq!(state, StreamState::Idle);
        prop_assert!(!StreamState::Idle.can_advance_to(StreamState::Running));
    }

    /// Lexicographic order of names follows chronological order.
    #[test]
    fn names_sort_chronologically(a in 0i64..2_000_000_000, b in 0i64..2_000_000_000) {
        let (Some(ta), Some(tb)) = (
            Local.timestamp_opt(a, 0).single(),
            Local.timestamp_opt(b, 0).single(),
        ) else {
            return Ok(());
        };
        // DST fall-back repeats an hour of local wall time.
        prop_assume!(ta.naive_local().cmp(&tb.naive_local()) == ta.cmp(&tb));
        let (na, nb) = (segment_base_name(&ta), segment_base_name(&tb));
        prop_assert_eq!(na.cmp(&nb), ta.naive_local().cmp(&tb.naive_local()));
    }

    /// Names handed out within one directory never repeat.
    #[test]
    fn namer_names_are_unique(seconds in prop::collection::vec(0i64..5, 1..20)) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut namer = SegmentNamer::new(dir.path());
        let base = 1_500_000_000i64;
        let mut offsets = seconds;
        offsets.sort_unstable();

        let mut names = Vec::new();
        for offset in offsets {
            let Some(now) = Local.timestamp_opt(base + offset, 0).single() else {
                return Ok(());
            };
            names.push(namer.next_name_at(&now));
        }

        let unique: HashSet<&String> = names.iter().collect();
        prop_assert_eq!(unique.len(), names.len());
        for name in &names {
            prop_assert!(name.starts_with("recording-"));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Random toggling of a live streamer only ever shows legal states.
    #[test]
    fn streamer_toggles_follow_the_state_machine(
        toggles in prop::collection::vec(any_toggle(), 1..12),
        warmup_ms in 0u64..8,
    ) {
        let source = Arc::new(
            MockSource::builder(Resolution::new(16, 8), 500)
                .frame_interval(Duration::from_millis(1))
                .open()
                .expect("mock source"),
        );
        let mut streamer = Streamer::new(
            Arc::clone(&source),
            StreamSettings {
                port: Port::PREVIEW,
                warmup: Duration::from_millis(warmup_ms),
            },
        );

        for toggle in toggles {
            let before = streamer.state();
            match toggle {
                Toggle::Start => match streamer.start() {
                    Ok(()) => {
                        prop_assert!(matches!(before, StreamState::Idle | StreamState::Stopping));
                        let after = streamer.state();
                        prop_assert!(settles_to(StreamState::Starting).contains(&after), "{after:?}");
                    }
                    Err(CameraError::AlreadyRunning) => {
                        prop_assert!(matches!(before, StreamState::Starting | StreamState::Running));
                        let after = streamer.state();
                        prop_assert!(settles_to(before).contains(&after), "{before:?} -> {after:?}");
                    }
                    Err(err) => prop_assert!(false, "unexpected start error: {err}"),
                },
                Toggle::Stop => match streamer.stop() {
                    Ok(()) => {
                        prop_assert!(matches!(before, StreamState::Starting | StreamState::Running));
                        prop_assert!(streamer.is_stopped());
                        let after = streamer.state();
                        prop_assert!(settles_to(StreamState::Stopping).contains(&after), "{after:?}");
                    }
                    Err(CameraError::NotRunning) => {
                        prop_assert!(matches!(before, StreamState::Idle | StreamState::Stopping));
                        let after = streamer.state();
                        prop_assert!(settles_to(before).contains(&after), "{before:?} -> {after:?}");
                    }
                    Err(err) => prop_assert!(false, "unexpected stop error: {err}"),
                },
                // Joining a loop nobody asked to stop would never return.
                Toggle::Teardown => {
                    if streamer.is_stopped() {
                        streamer.teardown();
                        prop_assert_eq!(streamer.state(), StreamState::Idle);
                        prop_assert!(streamer.is_finished());
                    }
                }
            }
        }

        if !streamer.is_stopped() {
            streamer.stop().expect("final stop");
        }
        streamer.teardown();
        prop_assert_eq!(streamer.state(), StreamState::Idle);
        prop_assert_eq!(source.open_port_count(), 0);
    }
}
