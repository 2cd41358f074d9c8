use tracing::{debug, trace};

use super::SyncLayer;
use crate::error::RollbackError;
use crate::network::messages::check_batch_shape;
use crate::frame_info::{FrameRecord, InputSet};
use crate::telemetry::{report_to_observer, Violation, ViolationKind, ViolationSeverity};
use crate::{Config, Frame, RollbackResult};

/// What a call to [`SyncLayer::sync`] did with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The batch ended before the cursor and was discarded without touching anything.
    Stale {
        /// The last frame covered by the batch.
        sync_frame: Frame,
        /// The cursor at the time the batch was discarded.
        last_frame_synced: Frame,
    },
    /// The batch was reconciled against the history.
    Applied(SyncReport),
}

impl SyncOutcome {
    /// Returns `true` if the batch was discarded as stale.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    /// The report of an applied batch.
    #[must_use]
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Applied(report) => Some(report),
            Self::Stale { .. } => None,
        }
    }
}

/// Details of an applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// The cursor after the batch.
    pub confirmed_frame: Frame,
    /// The earliest mismatching frame, if a rollback happened.
    pub rollback_frame: Option<Frame>,
    /// Frames that existed before the call and were simulated again.
    pub frames_resimulated: usize,
    /// Frames that did not exist before the call.
    pub frames_appended: usize,
}

impl<T: Config> SyncLayer<T> {
    /// Reconciles a batch of authoritative input sets covering
    /// `sync_frame - batch_size + 1 ..= sync_frame` with the history.
    ///
    /// The batch is validated completely before anything changes: either it is applied as
    /// a whole or the history and cursor are left untouched.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::InvalidRequest`] if the batch is malformed (empty, size mismatch,
    ///   too large, starts before frame 0, wrong number of inputs per frame).
    /// - [`RollbackError::Desync`] if the batch starts after `last_frame_synced + 1`. The
    ///   frames in between can never be confirmed, the session has to be restarted.
    pub fn sync<V>(
        &mut self,
        sync_frame: Frame,
        batch_size: usize,
        inputs: &[V],
    ) -> RollbackResult<SyncOutcome>
    where
        V: AsRef<[T::Input]>,
    {
        let first_frame = self.validate_batch(sync_frame, batch_size, inputs)?;
        let cursor = self.last_frame_synced;

        if sync_frame < cursor {
            debug!(
                sync_frame = sync_frame.as_i32(),
                last_frame_synced = cursor.as_i32(),
                "discarding stale batch"
            );
            return Ok(SyncOutcome::Stale {
                sync_frame,
                last_frame_synced: cursor,
            });
        }

        if first_frame > cursor + 1 {
            let first_missing = cursor + 1;
            let last_missing = first_frame - 1;
            debug!(
                first_missing = first_missing.as_i32(),
                last_missing = last_missing.as_i32(),
                sync_frame = sync_frame.as_i32(),
                "authoritative input gap"
            );
            return Err(RollbackError::Desync {
                first_missing,
                last_missing,
                sync_frame,
            });
        }

        let empty: &[T::Input] = &[];
        let authoritative = move |frame: Frame| {
            inputs
                .get((frame - first_frame) as usize)
                .map_or(empty, |set| set.as_ref())
        };

        self.report_confirmed_conflicts(first_frame, cursor, &authoritative);

        let highest = self.history.highest_frame();
        let rollback_frame = frame_range(cursor + 1, sync_frame.min(highest)).find(|&frame| {
            self.history
                .get(frame)
                .is_some_and(|record| !record.inputs().matches_confirmed(authoritative(frame)))
        });

        let report = match rollback_frame {
            Some(rollback_frame) => {
                let end = sync_frame.max(highest);
                debug!(
                    rollback_frame = rollback_frame.as_i32(),
                    to = end.as_i32(),
                    sync_frame = sync_frame.as_i32(),
                    "rolling back"
                );
                let discarded = self.history.truncate_from(rollback_frame)?;
                let replayed =
                    self.replay(rollback_frame, end, sync_frame, &discarded, &authoritative);
                if let Err(err) = replayed {
                    self.restore(rollback_frame, discarded);
                    return Err(err);
                }
                SyncReport {
                    confirmed_frame: sync_frame,
                    rollback_frame: Some(rollback_frame),
                    frames_resimulated: (highest - rollback_frame + 1) as usize,
                    frames_appended: (end - highest) as usize,
                }
            },
            None => {
                // every existing frame of the batch already matches, only a lagging
                // history needs the rest of the batch appended
                for frame in frame_range(highest + 1, sync_frame) {
                    let set = InputSet::confirmed(authoritative(frame).iter().copied());
                    self.simulate_next(set)?;
                }
                SyncReport {
                    confirmed_frame: sync_frame,
                    rollback_frame: None,
                    frames_resimulated: 0,
                    frames_appended: (sync_frame - highest).max(0) as usize,
                }
            },
        };

        self.last_frame_synced = sync_frame;
        trace!(
            last_frame_synced = sync_frame.as_i32(),
            current_frame = self.current_frame().as_i32(),
            "batch applied"
        );
        crate::debug_check_invariants!(self, self.observer.as_ref(), "after sync");
        Ok(SyncOutcome::Applied(report))
    }

    /// Checks the shape of a batch and returns its first frame.
    fn validate_batch<V>(
        &self,
        sync_frame: Frame,
        batch_size: usize,
        inputs: &[V],
    ) -> RollbackResult<Frame>
    where
        V: AsRef<[T::Input]>,
    {
        check_batch_shape::<T::Input, V>(
            sync_frame,
            batch_size,
            inputs,
            self.num_players(),
            self.max_batch_size,
        )
    }

    /// Frames at or below the cursor are immutable. A batch that disagrees with them is
    /// reported and otherwise ignored.
    fn report_confirmed_conflicts<'a>(
        &self,
        first_frame: Frame,
        cursor: Frame,
        authoritative: &impl Fn(Frame) -> &'a [T::Input],
    ) where
        T::Input: 'a,
    {
        // frame 0 is the agreed initial frame and is never part of the comparison
        let from = first_frame.max(Frame::new(1));
        for frame in frame_range(from, cursor) {
            let Some(record) = self.history.get(frame) else {
                continue;
            };
            if record.inputs().matches_confirmed(authoritative(frame)) {
                continue;
            }
            let violation = Violation::new(
                ViolationSeverity::Error,
                ViolationKind::Resync,
                "authoritative input contradicts an already confirmed frame",
                concat!(file!(), ":", line!()),
            )
            .with_frame(frame)
            .with_context("last_frame_synced", cursor.to_string())
            .with_context("stored", format!("{:?}", record.inputs().inputs().collect::<Vec<_>>()))
            .with_context("received", format!("{:?}", authoritative(frame)));
            report_to_observer(self.observer.as_ref(), &violation);
        }
    }

    /// Re-simulates `from..=to` on top of the truncated history.
    fn replay<'a>(
        &mut self,
        from: Frame,
        to: Frame,
        sync_frame: Frame,
        discarded: &[FrameRecord<T::Input, T::State>],
        authoritative: &impl Fn(Frame) -> &'a [T::Input],
    ) -> RollbackResult<()>
    where
        T::Input: 'a,
    {
        for frame in frame_range(from, to) {
            let inputs = if frame <= sync_frame {
                InputSet::confirmed(authoritative(frame).iter().copied())
            } else {
                // past the batch: keep what was real before the cut, predict the rest
                let previous = discarded
                    .get((frame - from) as usize)
                    .ok_or_else(|| RollbackError::InternalError {
                        context: format!("no discarded record for replayed frame {frame}"),
                    })?;
                let known: Vec<Option<T::Input>> = previous
                    .inputs()
                    .iter()
                    .map(|slot| slot.is_confirmed().then_some(slot.input))
                    .collect();
                self.predictor.fill(&self.history, frame, &known)
            };
            self.simulate_next(inputs)?;
        }
        Ok(())
    }

    /// Puts the records removed for a failed replay back in place.
    fn restore(&mut self, from: Frame, discarded: Vec<FrameRecord<T::Input, T::State>>) {
        if self.history.truncate_from(from).is_err() {
            return;
        }
        for record in discarded {
            let frame = record.frame();
            let (inputs, state) = record.into_parts();
            if self.history.append(frame, inputs, state).is_err() {
                crate::report_violation!(
                    self.observer.as_ref(),
                    ViolationSeverity::Critical,
                    ViolationKind::History,
                    "could not restore frame {} after a failed replay",
                    frame
                );
                return;
            }
        }
    }
}

/// Inclusive range of frames, empty when `to < from`.
fn frame_range(from: Frame, to: Frame) -> impl Iterator<Item = Frame> {
    (from.as_i32()..=to.as_i32()).map(Frame::new)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::*;
    use super::*;
    use crate::telemetry::{CollectingObserver, ViolationObserver};
    use crate::PlayerHandle;

    fn applied(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Applied(report) => report,
            SyncOutcome::Stale { .. } => panic!("batch unexpectedly stale"),
        }
    }

    #[test]
    fn mispredicted_remote_input_rolls_back_and_replays() {
        let mut layer = layer(2);
        for _ in 0..3 {
            layer.speculate_tick(1).unwrap();
        }
        let speculative = *layer.current_state();

        let batch = vec![vec![1u8, 4], vec![1, 4], vec![1, 4]];
        let report = applied(layer.sync(Frame::new(3), 3, &batch).unwrap());

        assert_eq!(report.rollback_frame, Some(Frame::new(1)));
        assert_eq!(report.frames_resimulated, 3);
        assert_eq!(report.frames_appended, 0);
        assert_eq!(layer.last_frame_synced(), Frame::new(3));
        assert_ne!(*layer.current_state(), speculative);
        assert_eq!(*layer.current_state(), from_scratch(&batch));
    }

    #[test]
    fn correct_guess_still_confirms_without_changing_state() {
        let mut layer = layer(2);
        layer.speculate_tick(1).unwrap();
        let before = *layer.current_state();

        // remote really idled: the prediction was right, only provenance changes
        let report = applied(layer.sync(Frame::new(1), 1, &[vec![1u8, 0]]).unwrap());
        assert_eq!(report.rollback_frame, Some(Frame::new(1)));
        assert_eq!(*layer.current_state(), before);
        assert!(!layer
            .record(Frame::new(1))
            .unwrap()
            .inputs()
            .has_predictions());
    }

    #[test]
    fn replay_beyond_batch_keeps_local_input_and_repredicts() {
        let mut layer = layer(2);
        for local in [1u8, 2, 3, 4] {
            layer.speculate_tick(local).unwrap();
        }
        let report = applied(layer.sync(Frame::new(2), 2, &[vec![1u8, 5], vec![2, 6]]).unwrap());
        assert_eq!(report.rollback_frame, Some(Frame::new(1)));
        assert_eq!(report.frames_resimulated, 4);
        assert_eq!(layer.current_frame(), Frame::new(4));

        for (frame, local) in [(3, 3u8), (4, 4u8)] {
            let inputs = layer.record(Frame::new(frame)).unwrap().inputs();
            let local_slot = inputs.slot(PlayerHandle::new(0)).unwrap();
            assert!(local_slot.is_confirmed());
            assert_eq!(local_slot.input, local);
            let remote_slot = inputs.slot(PlayerHandle::new(1)).unwrap();
            assert!(!remote_slot.is_confirmed());
            assert_eq!(remote_slot.input, 6);
        }
        assert_eq!(
            *layer.current_state(),
            from_scratch(&[vec![1, 5], vec![2, 6], vec![3, 6], vec![4, 6]])
        );
    }

    #[test]
    fn lagging_history_appends_without_rollback() {
        let mut layer = layer(2);
        let batch = vec![vec![0u8, 2], vec![0, 3]];
        let report = applied(layer.sync(Frame::new(2), 2, &batch).unwrap());
        assert_eq!(report.rollback_frame, None);
        assert_eq!(report.frames_appended, 2);
        assert_eq!(report.frames_resimulated, 0);
        assert_eq!(layer.current_frame(), Frame::new(2));
        assert_eq!(*layer.current_state(), from_scratch(&batch));
    }

    #[test]
    fn batch_partly_ahead_of_history_rolls_back_then_extends() {
        let mut layer = layer(2);
        layer.speculate_tick(1).unwrap();
        let batch = vec![vec![1u8, 1], vec![2, 2], vec![3, 3]];
        let report = applied(layer.sync(Frame::new(3), 3, &batch).unwrap());
        assert_eq!(report.rollback_frame, Some(Frame::new(1)));
        assert_eq!(report.frames_resimulated, 1);
        assert_eq!(report.frames_appended, 2);
        assert_eq!(*layer.current_state(), from_scratch(&batch));
    }

    #[test]
    fn matching_batch_is_cheap_and_idempotent() {
        let mut layer = layer(2);
        layer.speculate_tick(1).unwrap();
        layer.speculate_tick(1).unwrap();
        let batch = vec![vec![1u8, 7], vec![1, 7]];
        applied(layer.sync(Frame::new(2), 2, &batch).unwrap());
        let state = *layer.current_state();

        let report = applied(layer.sync(Frame::new(2), 2, &batch).unwrap());
        assert_eq!(report.rollback_frame, None);
        assert_eq!(report.frames_resimulated, 0);
        assert_eq!(report.frames_appended, 0);
        assert_eq!(*layer.current_state(), state);
        assert_eq!(layer.last_frame_synced(), Frame::new(2));
    }

    #[test]
    fn tick_runs_only_for_frames_that_need_it() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let counting = move |state: &u64, inputs: &InputSet<u8>| {
            counter.fetch_add(1, Ordering::Relaxed);
            weighted_sum(state, inputs)
        };
        let mut layer: SyncLayer<SumConfig> =
            SyncLayer::new(0, 2, PlayerHandle::new(0), Arc::new(counting));
        for _ in 0..3 {
            layer.speculate_tick(1).unwrap();
        }
        let batch = vec![vec![1u8, 7], vec![1, 7]];
        applied(layer.sync(Frame::new(2), 2, &batch).unwrap());
        let after_first_sync = ticks.load(Ordering::Relaxed);
        assert_eq!(after_first_sync, 3 + 3);

        // fully matching and already confirmed
        applied(layer.sync(Frame::new(2), 2, &batch).unwrap());
        assert_eq!(ticks.load(Ordering::Relaxed), after_first_sync);

        // overlaps the cursor; only the predicted frame 3 is recomputed
        let wider = vec![vec![1u8, 7], vec![1, 7], vec![1, 7]];
        let report = applied(layer.sync(Frame::new(3), 3, &wider).unwrap());
        assert_eq!(report.rollback_frame, Some(Frame::new(3)));
        assert_eq!(ticks.load(Ordering::Relaxed), after_first_sync + 1);

        // a lagging batch below the cursor never ticks
        assert!(layer.sync(Frame::new(1), 1, &[vec![1u8, 7]]).unwrap().is_stale());
        assert_eq!(ticks.load(Ordering::Relaxed), after_first_sync + 1);
    }

    #[test]
    fn stale_batch_is_ignored() {
        let mut layer = layer(2);
        layer.sync(Frame::new(3), 3, &[vec![0u8, 1], vec![0, 1], vec![0, 1]]).unwrap();
        let state = *layer.current_state();

        let outcome = layer.sync(Frame::new(2), 2, &[vec![9u8, 9], vec![9, 9]]).unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Stale {
                sync_frame: Frame::new(2),
                last_frame_synced: Frame::new(3),
            }
        );
        assert_eq!(*layer.current_state(), state);
    }

    #[test]
    fn gap_is_a_fatal_desync_and_changes_nothing() {
        let mut layer = layer(2);
        layer.speculate_tick(1).unwrap();
        layer.sync(Frame::new(1), 1, &[vec![1u8, 1]]).unwrap();
        layer.speculate_tick(1).unwrap();

        // cursor 1, batch starts at 4: frames 2 and 3 are lost
        let err = layer.sync(Frame::new(4), 1, &[vec![1u8, 1]]).unwrap_err();
        assert_eq!(
            err,
            RollbackError::Desync {
                first_missing: Frame::new(2),
                last_missing: Frame::new(3),
                sync_frame: Frame::new(4),
            }
        );
        assert_eq!(layer.last_frame_synced(), Frame::new(1));
        assert_eq!(layer.current_frame(), Frame::new(2));
    }

    #[test]
    fn malformed_batches_are_rejected_before_any_change() {
        let mut layer = layer(2);
        layer.speculate_tick(1).unwrap();
        let state = *layer.current_state();

        let empty: [Vec<u8>; 0] = [];
        assert!(layer.sync(Frame::new(1), 0, &empty).is_err());
        assert!(layer.sync(Frame::new(1), 2, &[vec![1u8, 1]]).is_err());
        assert!(layer.sync(Frame::new(0), 2, &[vec![1u8, 1], vec![1, 1]]).is_err());
        // second frame too narrow: the first frame must not be applied either
        assert!(layer.sync(Frame::new(2), 2, &[vec![1u8, 1], vec![1]]).is_err());

        let mut small = layer.with_max_batch_size(1);
        assert!(matches!(
            small.sync(Frame::new(2), 2, &[vec![1u8, 1], vec![1, 1]]),
            Err(RollbackError::InvalidRequest { .. })
        ));
        assert_eq!(*small.current_state(), state);
        assert_eq!(small.last_frame_synced(), Frame::ZERO);
    }

    #[test]
    fn contradicting_confirmed_frame_is_reported_and_ignored() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Arc<dyn ViolationObserver> = collector.clone();
        let mut layer = layer(2).with_observer(Some(observer));

        layer.sync(Frame::new(2), 2, &[vec![1u8, 1], vec![2, 2]]).unwrap();
        let state = *layer.current_state();

        let report = applied(layer.sync(Frame::new(3), 2, &[vec![9u8, 9], vec![3, 3]]).unwrap());
        assert_eq!(report.rollback_frame, None);
        assert!(collector.has_violation(ViolationKind::Resync));
        assert_eq!(
            layer.record(Frame::new(2)).unwrap().inputs().input(PlayerHandle::new(0)),
            Some(2)
        );
        assert_eq!(
            *layer.current_state(),
            from_scratch(&[vec![1, 1], vec![2, 2], vec![3, 3]])
        );
        assert_ne!(*layer.current_state(), state);
    }

    #[test]
    fn frame_range_is_inclusive_and_may_be_empty() {
        let frames: Vec<i32> = frame_range(Frame::new(2), Frame::new(4))
            .map(Frame::as_i32)
            .collect();
        assert_eq!(frames, vec![2, 3, 4]);
        assert_eq!(frame_range(Frame::new(3), Frame::new(2)).count(), 0);
    }
}
