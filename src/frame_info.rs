use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Frame, InputStatus, PlayerHandle};

/// One player's action for one frame, tagged with its provenance.
///
/// # Note
///
/// This type is re-exported at the crate root. Its fields are public so tests and
/// presentation layers can inspect where an input came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSlot<I> {
    /// The input struct given by the user or synthesized by the predictor.
    pub input: I,
    /// Whether the input is real or predicted.
    pub status: InputStatus,
}

impl<I> InputSlot<I> {
    /// Creates a slot holding a real input.
    pub const fn confirmed(input: I) -> Self {
        Self {
            input,
            status: InputStatus::Confirmed,
        }
    }

    /// Creates a slot holding a predicted input.
    pub const fn predicted(input: I) -> Self {
        Self {
            input,
            status: InputStatus::Predicted,
        }
    }

    /// Returns `true` if the slot holds a real input.
    #[inline]
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == InputStatus::Confirmed
    }
}

/// The inputs of every player for one frame, one slot per player in handle order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSet<I> {
    slots: SmallVec<[InputSlot<I>; 4]>,
}

impl<I> InputSet<I> {
    /// Number of slots (players).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the set has no slots.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the slot of a player, if the handle is in range.
    #[must_use]
    pub fn slot(&self, player: PlayerHandle) -> Option<&InputSlot<I>> {
        self.slots.get(player.as_usize())
    }

    /// Iterates over the slots in player order.
    pub fn iter(&self) -> std::slice::Iter<'_, InputSlot<I>> {
        self.slots.iter()
    }

    /// Returns `true` if at least one slot is predicted.
    #[must_use]
    pub fn has_predictions(&self) -> bool {
        self.slots.iter().any(|slot| !slot.is_confirmed())
    }
}

impl<I: Copy> InputSet<I> {
    /// Builds an input set where every slot is real.
    pub fn confirmed(inputs: impl IntoIterator<Item = I>) -> Self {
        Self {
            slots: inputs.into_iter().map(InputSlot::confirmed).collect(),
        }
    }

    /// Builds an input set from explicit slots.
    pub fn from_slots(slots: impl IntoIterator<Item = InputSlot<I>>) -> Self {
        Self {
            slots: slots.into_iter().collect(),
        }
    }

    /// Returns the input of a player, if the handle is in range.
    #[must_use]
    pub fn input(&self, player: PlayerHandle) -> Option<I> {
        self.slot(player).map(|slot| slot.input)
    }

    /// Iterates over the raw inputs in player order, ignoring provenance.
    pub fn inputs(&self) -> impl Iterator<Item = I> + '_ {
        self.slots.iter().map(|slot| slot.input)
    }
}

impl<I: Copy + PartialEq> InputSet<I> {
    /// Returns `true` if every slot is real and equals the corresponding authoritative input.
    ///
    /// A predicted slot never matches, even when its value happens to equal the
    /// authoritative one: the record still has to be replaced to become confirmed.
    #[must_use]
    pub fn matches_confirmed(&self, authoritative: &[I]) -> bool {
        self.slots.len() == authoritative.len()
            && self
                .slots
                .iter()
                .zip(authoritative)
                .all(|(slot, real)| slot.is_confirmed() && slot.input == *real)
    }
}

impl<'a, I> IntoIterator for &'a InputSet<I> {
    type Item = &'a InputSlot<I>;
    type IntoIter = std::slice::Iter<'a, InputSlot<I>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

/// A single entry of the history: the inputs applied at `frame` and the state they produced.
///
/// Records are immutable. Reconciliation replaces whole records; it never edits one in place.
#[derive(Debug, Clone)]
pub struct FrameRecord<I, S> {
    frame: Frame,
    inputs: InputSet<I>,
    state: S,
}

impl<I, S> FrameRecord<I, S> {
    /// Creates a new record.
    pub const fn new(frame: Frame, inputs: InputSet<I>, state: S) -> Self {
        Self {
            frame,
            inputs,
            state,
        }
    }

    /// The frame this record belongs to.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> Frame {
        self.frame
    }

    /// The inputs applied to produce this frame.
    #[inline]
    #[must_use]
    pub const fn inputs(&self) -> &InputSet<I> {
        &self.inputs
    }

    /// The state after applying the inputs.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> &S {
        &self.state
    }

    /// Consumes the record, returning its inputs and state.
    pub fn into_parts(self) -> (InputSet<I>, S) {
        (self.inputs, self.state)
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

    #[test]
    fn confirmed_set_has_no_predictions() {
        let set = InputSet::confirmed([1u8, 2]);
        assert_eq!(set.len(), 2);
        assert!(!set.has_predictions());
        assert_eq!(set.input(PlayerHandle::new(1)), Some(2));
        assert_eq!(set.input(PlayerHandle::new(2)), None);
    }

    #[test]
    fn mixed_set_tracks_provenance_per_slot() {
        let set = InputSet::from_slots([InputSlot::confirmed(7u8), InputSlot::predicted(0u8)]);
        assert!(set.has_predictions());
        assert!(set.slot(PlayerHandle::new(0)).unwrap().is_confirmed());
        assert!(!set.slot(PlayerHandle::new(1)).unwrap().is_confirmed());
    }

    #[test]
    fn matches_confirmed_requires_real_and_equal() {
        let real = InputSet::confirmed([1u8, 2]);
        assert!(real.matches_confirmed(&[1, 2]));
        assert!(!real.matches_confirmed(&[1, 3]));
        assert!(!real.matches_confirmed(&[1]));

        // a correct guess is still a guess
        let guessed = InputSet::from_slots([InputSlot::confirmed(1u8), InputSlot::predicted(2u8)]);
        assert!(!guessed.matches_confirmed(&[1, 2]));
    }

    #[test]
    fn record_exposes_parts() {
        let record = FrameRecord::new(Frame::new(3), InputSet::confirmed([4u8]), "state");
        assert_eq!(record.frame(), Frame::new(3));
        assert_eq!(*record.state(), "state");
        let (inputs, state) = record.into_parts();
        assert_eq!(inputs.input(PlayerHandle::new(0)), Some(4));
        assert_eq!(state, "state");
    }
}
