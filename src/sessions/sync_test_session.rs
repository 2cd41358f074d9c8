use std::collections::BTreeMap;

use serde::Serialize;
use tracing::trace;

use crate::checksum::compute_checksum;
use crate::frame_info::FrameRecord;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{report_to_observer, Violation, ViolationKind, ViolationSeverity};
use crate::{Config, Frame, RollbackError, RollbackResult};

/// During a [`SyncTestSession`], every frame the last `check_distance` frames are simulated
/// again from the recorded state and inputs.
///
/// The re-simulated checksums are compared with the checksums of the first run; any
/// difference means the tick function is not deterministic and rollback would diverge.
/// Every player is local, so every frame is confirmed as soon as it is simulated.
pub struct SyncTestSession<T>
where
    T: Config,
{
    check_distance: usize,
    sync_layer: SyncLayer<T>,
    /// Checksum of every recent frame as first simulated.
    checksum_history: BTreeMap<Frame, u64>,
}

impl<T: Config> SyncTestSession<T> {
    pub(crate) fn new(sync_layer: SyncLayer<T>, check_distance: usize) -> Self {
        Self {
            check_distance,
            sync_layer,
            checksum_history: BTreeMap::new(),
        }
    }

    /// Returns the current frame of the session.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The state of the current frame.
    #[must_use]
    pub fn current_state(&self) -> &T::State {
        self.sync_layer.current_state()
    }

    /// The record of `frame`, if it was simulated.
    #[must_use]
    pub fn record(&self, frame: Frame) -> Option<&FrameRecord<T::Input, T::State>> {
        self.sync_layer.record(frame)
    }

    /// Returns the number of players this session was constructed with.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.sync_layer.num_players()
    }

    /// Returns the check distance set on creation, i.e. how many frames are re-simulated.
    #[must_use]
    pub fn check_distance(&self) -> usize {
        self.check_distance
    }
}

impl<T> SyncTestSession<T>
where
    T: Config,
    T::State: Serialize,
{
    /// Simulates the next frame with one input per player, then re-simulates the last
    /// `check_distance` frames and compares checksums. Returns the new frame.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::InvalidRequest`] if `inputs` does not hold one input per player.
    /// - [`RollbackError::MismatchedChecksum`] if a re-simulated frame differs from its first
    ///   run. The frame stays simulated; the session can keep going, but the tick function
    ///   needs fixing.
    /// - [`RollbackError::SerializationError`] if a state cannot be checksummed.
    pub fn advance_frame(&mut self, inputs: &[T::Input]) -> RollbackResult<Frame> {
        let frame = self.sync_layer.advance_confirmed(inputs)?;
        self.checksum_history
            .insert(frame, compute_checksum(self.sync_layer.current_state())?);

        let distance = i32::try_from(self.check_distance).unwrap_or(i32::MAX);
        if frame.as_i32() <= distance {
            return Ok(frame);
        }
        let oldest = frame - distance + 1;
        self.checksum_history.retain(|&k, _| k >= oldest);

        let mismatched_frames = self.resimulate(oldest, frame)?;
        if !mismatched_frames.is_empty() {
            let violation = Violation::new(
                ViolationSeverity::Critical,
                ViolationKind::Determinism,
                "re-simulation produced a different state",
                concat!(file!(), ":", line!()),
            )
            .with_frame(frame)
            .with_context("mismatched_frames", format!("{mismatched_frames:?}"));
            report_to_observer(self.sync_layer.observer(), &violation);
            return Err(RollbackError::MismatchedChecksum {
                current_frame: frame,
                mismatched_frames,
            });
        }
        trace!(
            frame = frame.as_i32(),
            oldest = oldest.as_i32(),
            "re-simulation matched"
        );
        Ok(frame)
    }

    /// Ticks `from..=to` again starting at the recorded state of `from - 1`, returning the
    /// frames whose checksum differs from the first run.
    fn resimulate(&self, from: Frame, to: Frame) -> RollbackResult<Vec<Frame>> {
        let missing = |frame: Frame| RollbackError::InternalError {
            context: format!("sync test lost the record of frame {frame}"),
        };
        let base = self.sync_layer.record(from - 1).ok_or_else(|| missing(from - 1))?;
        let simulation = self.sync_layer.simulation();

        let mut mismatched = Vec::new();
        let mut replayed: Option<T::State> = None;
        for k in from.as_i32()..=to.as_i32() {
            let frame = Frame::new(k);
            let record = self.sync_layer.record(frame).ok_or_else(|| missing(frame))?;
            let state = replayed.as_ref().unwrap_or_else(|| base.state());
            let next = simulation.tick(state, record.inputs());

            let first_run = match self.checksum_history.get(&frame) {
                Some(&checksum) => checksum,
                None => compute_checksum(record.state())?,
            };
            if compute_checksum(&next)? != first_run {
                mismatched.push(frame);
            }
            replayed = Some(next);
        }
        Ok(mismatched)
    }
}

impl<T: Config> std::fmt::Debug for SyncTestSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTestSession")
            .field("check_distance", &self.check_distance)
            .field("sync_layer", &self.sync_layer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::frame_info::InputSet;
    use crate::sync_layer::test_support::*;
    use crate::telemetry::CollectingObserver;
    use crate::SessionBuilder;

    #[test]
    fn deterministic_tick_passes() {
        let mut session = SessionBuilder::<SumConfig>::new()
            .with_check_distance(3)
            .unwrap()
            .start_synctest_session(0, weighted_sum)
            .unwrap();
        for k in 1..=20u8 {
            assert_eq!(session.advance_frame(&[k, k / 2]).unwrap(), i32::from(k));
        }
        assert!(session.checksum_history.len() <= 3);
        assert_eq!(session.check_distance(), 3);
    }

    #[test]
    fn hidden_state_is_caught() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let leaky = move |state: &u64, inputs: &InputSet<u8>| {
            weighted_sum(state, inputs) + counter.fetch_add(1, Ordering::Relaxed)
        };

        let observer = Arc::new(CollectingObserver::new());
        let mut session = SessionBuilder::<SumConfig>::new()
            .with_violation_observer(observer.clone())
            .start_synctest_session(0, leaky)
            .unwrap();

        session.advance_frame(&[1, 1]).unwrap();
        session.advance_frame(&[1, 1]).unwrap();
        match session.advance_frame(&[1, 1]) {
            Err(RollbackError::MismatchedChecksum {
                current_frame,
                mismatched_frames,
            }) => {
                assert_eq!(current_frame, Frame::new(3));
                assert_eq!(mismatched_frames, vec![Frame::new(2), Frame::new(3)]);
            },
            other => panic!("expected a checksum mismatch, got {other:?}"),
        }
        assert!(observer.has_violation(ViolationKind::Determinism));
        assert!(calls.load(Ordering::Relaxed) > 3);
    }

    #[test]
    fn every_player_needs_input() {
        let mut session = SessionBuilder::<SumConfig>::new()
            .with_num_players(3)
            .unwrap()
            .start_synctest_session(0, weighted_sum)
            .unwrap();
        assert!(matches!(
            session.advance_frame(&[1, 2]),
            Err(RollbackError::InvalidRequest { .. })
        ));
        assert_eq!(session.current_frame(), Frame::ZERO);
    }

    #[test]
    fn frames_are_confirmed_immediately() {
        let mut session = SessionBuilder::<SumConfig>::new()
            .start_synctest_session(5, weighted_sum)
            .unwrap();
        session.advance_frame(&[2, 3]).unwrap();
        let record = session.record(Frame::new(1)).unwrap();
        assert!(!record.inputs().has_predictions());
        assert_eq!(*session.current_state(), weighted_sum(&5, record.inputs()));
    }
}
