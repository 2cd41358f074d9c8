//! SyncTest session integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::stubs::{ground_truth, grid_tick, scripted_frame, GridConfig, GridState, Move};
use lockstep_rollback::{Frame, InputSet, RollbackError, SessionBuilder};

#[test]
fn test_create_session() {
    assert!(SessionBuilder::<GridConfig>::new()
        .start_synctest_session(GridState::new(2), grid_tick)
        .is_ok());
}

#[test]
fn test_advance_frame_with_rollbacks() -> Result<(), RollbackError> {
    for check_distance in [1, 2, 7] {
        let mut sess = SessionBuilder::<GridConfig>::new()
            .with_num_players(3)?
            .with_check_distance(check_distance)?
            .start_synctest_session(GridState::new(3), grid_tick)?;

        for frame in 1..=200 {
            assert_eq!(sess.advance_frame(&scripted_frame(3, frame))?, Frame::new(frame));
        }
        assert_eq!(*sess.current_state(), ground_truth(3, 200));
    }
    Ok(())
}

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Drifts by one cell every 50 global ticks; a replay lands on a different count.
fn drifting_tick(state: &GridState, inputs: &InputSet<Move>) -> GridState {
    let mut next = grid_tick(state, inputs);
    if TICKS.fetch_add(1, Ordering::Relaxed) % 50 == 49 {
        next.positions[0].0 += 1;
    }
    next
}

#[test]
fn test_nondeterministic_tick_is_detected() {
    let mut sess = SessionBuilder::<GridConfig>::new()
        .with_check_distance(4)
        .unwrap()
        .start_synctest_session(GridState::new(2), drifting_tick)
        .unwrap();

    let mut mismatch = None;
    for frame in 1..=200 {
        match sess.advance_frame(&scripted_frame(2, frame)) {
            Ok(_) => {},
            Err(RollbackError::MismatchedChecksum {
                current_frame,
                mismatched_frames,
            }) => {
                mismatch = Some((current_frame, mismatched_frames));
                break;
            },
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    let (current_frame, mismatched_frames) = mismatch.expect("drift should be detected");
    assert!(!mismatched_frames.is_empty());
    assert!(mismatched_frames
        .iter()
        .all(|frame| *frame <= current_frame && *frame > current_frame - 4));
}

#[test]
fn test_missing_player_input() {
    let mut sess = SessionBuilder::<GridConfig>::new()
        .start_synctest_session(GridState::new(2), grid_tick)
        .unwrap();
    assert!(matches!(
        sess.advance_frame(&[Move::Up]),
        Err(RollbackError::InvalidRequest { .. })
    ));
}
