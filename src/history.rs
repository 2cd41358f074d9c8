//! Contiguous log of simulated frames.
//!
//! The history always starts at frame 0 and the record stored at index `n` is frame `n`.
//! Records are only ever appended at the end or cut off from a given frame onward; nothing
//! is rewritten in place. Rollback is therefore "truncate, then append again".

use tracing::trace;

use crate::error::{InvalidRequestKind, RollbackError, RollbackResult};
use crate::frame_info::{FrameRecord, InputSet};
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::Frame;

/// Ordered, gap-free sequence of [`FrameRecord`]s starting at frame 0.
///
/// Frame 0 is held apart from the later records so it can never be cut off, and so the
/// newest record is always available without a fallible lookup.
#[derive(Debug, Clone)]
pub struct History<I, S> {
    genesis: FrameRecord<I, S>,
    /// Frames `1..=highest`, record `n` stored at index `n - 1`.
    records: Vec<FrameRecord<I, S>>,
    num_players: usize,
}

impl<I: Copy + Default, S> History<I, S> {
    /// Creates a history holding only frame 0.
    ///
    /// Frame 0 is agreed by every peer, so its (neutral) inputs are marked confirmed.
    pub fn new(initial_state: S, num_players: usize) -> Self {
        let inputs = InputSet::confirmed(std::iter::repeat(I::default()).take(num_players));
        Self {
            genesis: FrameRecord::new(Frame::ZERO, inputs, initial_state),
            records: Vec::new(),
            num_players,
        }
    }

    /// Discards every record and starts over from a new frame 0.
    pub fn reset(&mut self, initial_state: S) {
        *self = Self::new(initial_state, self.num_players);
    }
}

impl<I, S> History<I, S> {
    /// Number of input slots every record carries.
    #[inline]
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The newest frame in the history. Never below frame 0.
    #[inline]
    #[must_use]
    pub fn highest_frame(&self) -> Frame {
        Frame::new(self.records.len() as i32)
    }

    /// Number of records, including frame 0.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len() + 1
    }

    /// Always `false`: frame 0 can not be removed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the record of `frame`, if it exists.
    #[must_use]
    pub fn get(&self, frame: Frame) -> Option<&FrameRecord<I, S>> {
        match frame.as_index()? {
            0 => Some(&self.genesis),
            index => self.records.get(index - 1),
        }
    }

    /// Returns the newest record.
    #[must_use]
    pub fn latest(&self) -> &FrameRecord<I, S> {
        self.records.last().unwrap_or(&self.genesis)
    }

    /// Iterates over all records from frame 0 upward.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &FrameRecord<I, S>> + '_ {
        std::iter::once(&self.genesis).chain(self.records.iter())
    }

    /// Appends the record of `frame`.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::OutOfSequence`] if `frame` is not exactly `highest_frame() + 1`.
    /// - [`RollbackError::InvalidRequest`] if `inputs` does not carry one slot per player.
    pub fn append(&mut self, frame: Frame, inputs: InputSet<I>, state: S) -> RollbackResult<()> {
        let expected = self.highest_frame() + 1;
        if frame != expected {
            return Err(RollbackError::OutOfSequence {
                expected,
                actual: frame,
            });
        }
        if inputs.len() != self.num_players {
            return Err(InvalidRequestKind::WrongInputCount {
                frame,
                actual: inputs.len(),
                expected: self.num_players,
            }
            .into());
        }
        trace!(frame = frame.as_i32(), "appending frame record");
        self.records.push(FrameRecord::new(frame, inputs, state));
        Ok(())
    }

    /// Removes every record from `frame` onward and returns them, oldest first.
    ///
    /// Truncating at `highest_frame() + 1` is a no-op that returns nothing.
    ///
    /// # Errors
    ///
    /// [`RollbackError::InvalidFrame`] if `frame <= 0` (frame 0 is immutable) or
    /// `frame > highest_frame() + 1`.
    pub fn truncate_from(&mut self, frame: Frame) -> RollbackResult<Vec<FrameRecord<I, S>>> {
        let index = match frame.as_index() {
            Some(index) if index >= 1 => index - 1,
            _ => {
                return Err(RollbackError::InvalidFrame {
                    frame,
                    reason: "frame 0 and earlier can not be discarded".to_owned(),
                })
            },
        };
        if index > self.records.len() {
            return Err(RollbackError::InvalidFrame {
                frame,
                reason: format!("history ends at frame {}", self.highest_frame()),
            });
        }
        trace!(
            from = frame.as_i32(),
            to = self.highest_frame().as_i32(),
            "truncating history"
        );
        Ok(self.records.split_off(index))
    }
}

impl<I, S> InvariantChecker for History<I, S> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (index, record) in self.iter().enumerate() {
            if record.frame().as_index() != Some(index) {
                return Err(InvariantViolation::new(
                    "History",
                    "record frame does not match its position",
                )
                .with_details(format!("index={}, frame={}", index, record.frame())));
            }
            if record.inputs().len() != self.num_players {
                return Err(InvariantViolation::new(
                    "History",
                    "record carries the wrong number of input slots",
                )
                .with_details(format!(
                    "frame={}, slots={}, players={}",
                    record.frame(),
                    record.inputs().len(),
                    self.num_players
                )));
            }
        }
        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::PlayerHandle;

    fn history_with(frames: i32) -> History<u8, u32> {
        let mut history = History::new(0u32, 2);
        for f in 1..=frames {
            history
                .append(Frame::new(f), InputSet::confirmed([f as u8, 0]), f as u32)
                .unwrap();
        }
        history
    }

    #[test]
    fn new_history_holds_confirmed_frame_zero() {
        let history: History<u8, u32> = History::new(5, 3);
        assert_eq!(history.len(), 1);
        assert_eq!(history.highest_frame(), Frame::ZERO);
        let zero = history.get(Frame::ZERO).unwrap();
        assert_eq!(*zero.state(), 5);
        assert_eq!(zero.inputs().len(), 3);
        assert!(!zero.inputs().has_predictions());
        assert!(history.check_invariants().is_ok());
    }

    #[test]
    fn append_requires_next_frame() {
        let mut history = history_with(2);
        let err = history
            .append(Frame::new(4), InputSet::confirmed([0, 0]), 4)
            .unwrap_err();
        assert_eq!(
            err,
            RollbackError::OutOfSequence {
                expected: Frame::new(3),
                actual: Frame::new(4),
            }
        );
        let err = history
            .append(Frame::new(2), InputSet::confirmed([0, 0]), 2)
            .unwrap_err();
        assert!(matches!(err, RollbackError::OutOfSequence { .. }));
        assert_eq!(history.highest_frame(), Frame::new(2));
    }

    #[test]
    fn append_rejects_wrong_width() {
        let mut history = history_with(0);
        let err = history
            .append(Frame::new(1), InputSet::confirmed([1]), 1)
            .unwrap_err();
        assert!(matches!(err, RollbackError::InvalidRequest { .. }));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn truncate_returns_discarded_records() {
        let mut history = history_with(5);
        let discarded = history.truncate_from(Frame::new(3)).unwrap();
        assert_eq!(history.highest_frame(), Frame::new(2));
        let frames: Vec<i32> = discarded.iter().map(|r| r.frame().as_i32()).collect();
        assert_eq!(frames, vec![3, 4, 5]);
        assert_eq!(
            discarded[0].inputs().input(PlayerHandle::new(0)),
            Some(3)
        );
        // appending resumes right after the cut
        history
            .append(Frame::new(3), InputSet::confirmed([9, 9]), 33)
            .unwrap();
        assert!(history.check_invariants().is_ok());
    }

    #[test]
    fn truncate_bounds() {
        let mut history = history_with(3);
        assert!(matches!(
            history.truncate_from(Frame::ZERO),
            Err(RollbackError::InvalidFrame { .. })
        ));
        assert!(matches!(
            history.truncate_from(Frame::new(5)),
            Err(RollbackError::InvalidFrame { .. })
        ));
        assert!(history.truncate_from(Frame::new(4)).unwrap().is_empty());
        assert_eq!(history.highest_frame(), Frame::new(3));
    }

    #[test]
    fn reset_keeps_player_count() {
        let mut history = history_with(4);
        history.reset(100);
        assert_eq!(history.len(), 1);
        assert_eq!(history.num_players(), 2);
        assert_eq!(*history.latest().state(), 100);
    }
}
