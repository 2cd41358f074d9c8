//! Invariant tests for the history and the sync layer.
//!
//! `InvariantChecker` is run after every step of scripted scenarios, and a collecting
//! observer confirms that a well-behaved session reports nothing.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use lockstep_rollback::__internal::{History, SyncLayer};
use lockstep_rollback::telemetry::{
    CollectingObserver, InvariantChecker, ViolationKind, ViolationObserver,
};
use lockstep_rollback::{
    assert_no_violations, Config, Frame, InputSet, PlayerHandle, RollbackError,
};

struct CountConfig;

impl Config for CountConfig {
    type Input = i8;
    type State = i64;
}

fn count(state: &i64, inputs: &InputSet<i8>) -> i64 {
    state + inputs.inputs().map(i64::from).sum::<i64>()
}

fn layer(observer: &Arc<CollectingObserver>) -> SyncLayer<CountConfig> {
    let observer: Arc<dyn ViolationObserver> = observer.clone();
    SyncLayer::new(0, 3, PlayerHandle::new(1), Arc::new(count)).with_observer(Some(observer))
}

#[test]
fn invariants_hold_through_speculation_and_resync() {
    let observer = Arc::new(CollectingObserver::new());
    let mut layer = layer(&observer);

    for round in 0..10i8 {
        for _ in 0..4 {
            layer.speculate_tick(round).unwrap();
            layer.check_invariants().unwrap();
        }
        let cursor = layer.last_frame_synced().as_i32();
        let sync_frame = layer.current_frame().as_i32() - 1;
        let frames: Vec<Vec<i8>> = (cursor + 1..=sync_frame)
            .map(|frame| {
                let local = layer
                    .record(Frame::new(frame))
                    .unwrap()
                    .inputs()
                    .input(PlayerHandle::new(1))
                    .unwrap();
                vec![-round, local, round % 3]
            })
            .collect();
        layer
            .sync(Frame::new(sync_frame), frames.len(), &frames)
            .unwrap();
        layer.check_invariants().unwrap();
    }
    assert_no_violations!(observer);
}

#[test]
fn history_rejects_out_of_sequence_appends() {
    let mut history: History<i8, i64> = History::new(0, 2);
    history
        .append(Frame::new(1), InputSet::confirmed([1, 1]), 2)
        .unwrap();

    assert_eq!(
        history.append(Frame::new(3), InputSet::confirmed([1, 1]), 4),
        Err(RollbackError::OutOfSequence {
            expected: Frame::new(2),
            actual: Frame::new(3),
        })
    );
    assert!(matches!(
        history.append(Frame::new(2), InputSet::confirmed([1]), 3),
        Err(RollbackError::InvalidRequest { .. })
    ));
    history.check_invariants().unwrap();
    assert_eq!(history.highest_frame(), Frame::new(1));
}

#[test]
fn history_truncation_keeps_frame_zero() {
    let mut history: History<i8, i64> = History::new(0, 1);
    for frame in 1..=5 {
        history
            .append(Frame::new(frame), InputSet::confirmed([1]), i64::from(frame))
            .unwrap();
    }
    assert!(matches!(
        history.truncate_from(Frame::ZERO),
        Err(RollbackError::InvalidFrame { .. })
    ));
    let discarded = history.truncate_from(Frame::new(3)).unwrap();
    assert_eq!(discarded.len(), 3);
    assert_eq!(discarded[0].frame(), Frame::new(3));
    assert_eq!(history.highest_frame(), Frame::new(2));
    assert_eq!(*history.latest().state(), 2);
    history.check_invariants().unwrap();
}

#[test]
fn contradicting_confirmed_frame_is_observed() {
    let observer = Arc::new(CollectingObserver::new());
    let mut layer = layer(&observer);
    layer
        .sync(Frame::new(2), 2, &[vec![1i8, 1, 1], vec![2, 2, 2]])
        .unwrap();
    layer
        .sync(Frame::new(3), 2, &[vec![9i8, 2, 2], vec![3, 3, 3]])
        .unwrap();

    assert_eq!(observer.len(), 1);
    let violation = &observer.violations()[0];
    assert_eq!(violation.kind, ViolationKind::Resync);
    assert_eq!(violation.frame, Some(Frame::new(2)));
    assert_eq!(*layer.current_state(), 3 + 6 + 9);
    layer.check_invariants().unwrap();
}
