//! Input prediction for remote players.
//!
//! When the local peer advances a frame it only knows its own input. Every other slot is
//! filled by a [`PredictionStrategy`], fed with the newest *confirmed* input of that player
//! found in the history.
//!
//! # Determinism Requirement
//!
//! **CRITICAL**: All prediction strategies MUST be deterministic. A replay after rollback
//! re-predicts every frame past the authoritative batch; if the strategy consulted anything
//! other than its arguments, replay would diverge from the first run.
//!
//! # Built-in Strategies
//!
//! - [`RepeatLastConfirmed`]: Repeats the last confirmed input (default)
//! - [`BlankPrediction`]: Always returns the default (neutral) input
//!
//! # Custom Strategies
//!
//! ```
//! use lockstep_rollback::{Frame, PredictionStrategy};
//!
//! /// Keeps holding the last input for a few frames, then lets go.
//! struct FadeOut;
//!
//! impl<I: Copy + Default> PredictionStrategy<I> for FadeOut {
//!     fn predict(&self, frame: Frame, last_confirmed_input: Option<I>, _player_index: usize) -> I {
//!         if frame.as_i32() % 8 == 0 {
//!             I::default()
//!         } else {
//!             last_confirmed_input.unwrap_or_default()
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;

use crate::frame_info::{InputSet, InputSlot};
use crate::history::History;
use crate::{Frame, InputStatus, PlayerHandle};

/// Defines how a remote player's input is guessed before it arrives.
pub trait PredictionStrategy<I: Copy + Default>: Send + Sync {
    /// Predicts the input of `player_index` on `frame`.
    ///
    /// # Arguments
    ///
    /// * `frame` - The frame being predicted
    /// * `last_confirmed_input` - The newest confirmed input of this player before `frame`,
    ///   or `None` if the history holds none
    /// * `player_index` - The slot being predicted
    fn predict(&self, frame: Frame, last_confirmed_input: Option<I>, player_index: usize) -> I;
}

/// The default prediction strategy: repeat the last confirmed input.
///
/// If there is no confirmed input yet, this returns the default input value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepeatLastConfirmed;

impl<I: Copy + Default> PredictionStrategy<I> for RepeatLastConfirmed {
    fn predict(&self, _frame: Frame, last_confirmed_input: Option<I>, _player_index: usize) -> I {
        last_confirmed_input.unwrap_or_default()
    }
}

/// A prediction strategy that always returns the default (neutral) input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlankPrediction;

impl<I: Copy + Default> PredictionStrategy<I> for BlankPrediction {
    fn predict(&self, _frame: Frame, _last_confirmed: Option<I>, _player_index: usize) -> I {
        I::default()
    }
}

/// Looks up the newest confirmed input in the history and hands it to the strategy.
#[derive(Clone)]
pub struct InputPredictor<I: Copy + Default> {
    strategy: Arc<dyn PredictionStrategy<I>>,
}

impl<I: Copy + Default> InputPredictor<I> {
    /// Creates a predictor around a strategy.
    pub fn new(strategy: Arc<dyn PredictionStrategy<I>>) -> Self {
        Self { strategy }
    }

    /// The newest confirmed input of `player` strictly before `frame`.
    ///
    /// Frames at or below the synchronization cursor are fully confirmed and frame 0 is
    /// always confirmed, so the backward scan never walks past the speculative tail.
    pub fn last_confirmed_input<S>(
        &self,
        history: &History<I, S>,
        frame: Frame,
        player: PlayerHandle,
    ) -> Option<I> {
        let newest = frame - 1;
        let start = newest.min(history.highest_frame()).as_index()?;
        (0..=start).rev().find_map(|index| {
            history
                .get(Frame::new(index as i32))
                .and_then(|record| record.inputs().slot(player))
                .filter(|slot| slot.status == InputStatus::Confirmed)
                .map(|slot| slot.input)
        })
    }

    /// Predicts the input of `player` for `frame`.
    pub fn predict<S>(&self, history: &History<I, S>, frame: Frame, player: PlayerHandle) -> I {
        let last = self.last_confirmed_input(history, frame, player);
        self.strategy.predict(frame, last, player.as_usize())
    }

    /// Builds the input set for `frame` by keeping every `known` slot and predicting the rest.
    ///
    /// `known[n]` is `Some(input)` for slots whose real input is already available.
    pub fn fill<S>(
        &self,
        history: &History<I, S>,
        frame: Frame,
        known: &[Option<I>],
    ) -> InputSet<I> {
        InputSet::from_slots(known.iter().enumerate().map(|(index, slot)| match slot {
            Some(input) => InputSlot::confirmed(*input),
            None => InputSlot::predicted(self.predict(history, frame, PlayerHandle::new(index))),
        }))
    }
}

impl<I: Copy + Default> Default for InputPredictor<I> {
    fn default() -> Self {
        Self::new(Arc::new(RepeatLastConfirmed))
    }
}

impl<I: Copy + Default> std::fmt::Debug for InputPredictor<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPredictor").finish_non_exhaustive()
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
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u8,
    }

    fn input(inp: u8) -> TestInput {
        TestInput { inp }
    }

    #[test]
    fn test_blank_prediction_strategy() {
        let strategy = BlankPrediction;

        let result: TestInput = strategy.predict(Frame::new(0), Some(input(42)), 0);
        assert_eq!(result, TestInput::default());

        let result: TestInput = strategy.predict(Frame::new(10), None, 1);
        assert_eq!(result, TestInput::default());
    }

    #[test]
    fn test_repeat_last_confirmed_strategy() {
        let strategy = RepeatLastConfirmed;

        let result: TestInput = strategy.predict(Frame::new(5), Some(input(99)), 0);
        assert_eq!(result.inp, 99);

        let result: TestInput = strategy.predict(Frame::new(0), None, 0);
        assert_eq!(result, TestInput::default());
    }

    /// Frame 1 real for both, frame 2 real for player 0 only, frame 3 fully predicted.
    fn speculative_history() -> History<TestInput, ()> {
        let mut history = History::new((), 2);
        history
            .append(Frame::new(1), InputSet::confirmed([input(1), input(7)]), ())
            .unwrap();
        history
            .append(
                Frame::new(2),
                InputSet::from_slots([InputSlot::confirmed(input(2)), InputSlot::predicted(input(7))]),
                (),
            )
            .unwrap();
        history
            .append(
                Frame::new(3),
                InputSet::from_slots([InputSlot::predicted(input(2)), InputSlot::predicted(input(7))]),
                (),
            )
            .unwrap();
        history
    }

    #[test]
    fn last_confirmed_skips_predicted_slots() {
        let predictor = InputPredictor::default();
        let history = speculative_history();

        let remote = PlayerHandle::new(1);
        assert_eq!(
            predictor.last_confirmed_input(&history, Frame::new(4), remote),
            Some(input(7))
        );
        let local = PlayerHandle::new(0);
        assert_eq!(
            predictor.last_confirmed_input(&history, Frame::new(4), local),
            Some(input(2))
        );
        // only looks strictly before the given frame
        assert_eq!(
            predictor.last_confirmed_input(&history, Frame::new(2), local),
            Some(input(1))
        );
    }

    #[test]
    fn frame_zero_is_the_fallback() {
        let predictor = InputPredictor::default();
        let history: History<TestInput, ()> = History::new((), 2);
        assert_eq!(
            predictor.last_confirmed_input(&history, Frame::new(1), PlayerHandle::new(1)),
            Some(TestInput::default())
        );
        assert_eq!(
            predictor.last_confirmed_input(&history, Frame::ZERO, PlayerHandle::new(1)),
            None
        );
    }

    #[test]
    fn fill_keeps_known_and_predicts_rest() {
        let predictor = InputPredictor::default();
        let history = speculative_history();
        let set = predictor.fill(&history, Frame::new(4), &[Some(input(3)), None]);
        assert_eq!(set.slot(PlayerHandle::new(0)), Some(&InputSlot::confirmed(input(3))));
        assert_eq!(set.slot(PlayerHandle::new(1)), Some(&InputSlot::predicted(input(7))));
    }

    #[test]
    fn custom_strategy_receives_player_index() {
        struct ByIndex;
        impl PredictionStrategy<TestInput> for ByIndex {
            fn predict(&self, _frame: Frame, _last: Option<TestInput>, player_index: usize) -> TestInput {
                input(player_index as u8 + 100)
            }
        }

        let predictor = InputPredictor::new(Arc::new(ByIndex));
        let history = speculative_history();
        assert_eq!(
            predictor.predict(&history, Frame::new(4), PlayerHandle::new(1)),
            input(101)
        );
    }
}
