use tracing::trace;

use super::SyncLayer;
use crate::error::InvalidRequestKind;
use crate::frame_info::InputSet;
use crate::{Config, Frame, RollbackResult};

impl<T: Config> SyncLayer<T> {
    /// Simulates the next frame with the local player's real input and predictions for
    /// every other slot. Returns the new frame.
    ///
    /// Never waits for the network. The predicted slots stay eligible for rollback until an
    /// authoritative batch covers the frame.
    pub fn speculate_tick(&mut self, local_input: T::Input) -> RollbackResult<Frame> {
        let frame = self.history.highest_frame() + 1;
        let mut known = vec![None; self.num_players()];
        if let Some(slot) = known.get_mut(self.local_player.as_usize()) {
            *slot = Some(local_input);
        }
        let inputs = self.predictor.fill(&self.history, frame, &known);
        let frame = self.simulate_next(inputs)?;
        trace!(
            frame = frame.as_i32(),
            ahead = self.frames_ahead(),
            "speculated frame"
        );
        crate::debug_check_invariants!(self, self.observer.as_ref(), "after speculate_tick");
        Ok(frame)
    }

    /// Simulates the next frame with real input for every slot and advances the cursor to it.
    ///
    /// Only valid while the cursor sits on the newest frame (every player local, as in a
    /// sync test).
    pub fn advance_confirmed(&mut self, inputs: &[T::Input]) -> RollbackResult<Frame> {
        if inputs.len() != self.num_players() {
            return Err(InvalidRequestKind::MissingLocalInput {
                actual: inputs.len(),
                expected: self.num_players(),
            }
            .into());
        }
        if self.last_frame_synced != self.history.highest_frame() {
            return Err(crate::RollbackError::InvalidFrame {
                frame: self.history.highest_frame() + 1,
                reason: format!(
                    "frames after {} are still predicted",
                    self.last_frame_synced
                ),
            });
        }
        let frame = self.simulate_next(InputSet::confirmed(inputs.iter().copied()))?;
        self.last_frame_synced = frame;
        Ok(frame)
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
    use super::super::test_support::*;
    use crate::{Frame, PlayerHandle, RollbackError};

    #[test]
    fn speculate_tags_local_real_and_remote_predicted() {
        let mut layer = layer(3);
        let frame = layer.speculate_tick(4).unwrap();
        assert_eq!(frame, 1);

        let inputs = layer.record(frame).unwrap().inputs();
        assert!(inputs.slot(PlayerHandle::new(0)).unwrap().is_confirmed());
        assert!(!inputs.slot(PlayerHandle::new(1)).unwrap().is_confirmed());
        assert!(!inputs.slot(PlayerHandle::new(2)).unwrap().is_confirmed());
        // nothing confirmed yet, frame 0 holds neutral input
        assert_eq!(inputs.input(PlayerHandle::new(1)), Some(0));
        assert_eq!(layer.frames_ahead(), 1);
    }

    #[test]
    fn speculate_advances_exactly_one_frame() {
        let mut layer = layer(2);
        for expected in 1..=5 {
            assert_eq!(layer.speculate_tick(1).unwrap(), expected);
        }
        assert_eq!(layer.history().len(), 6);
        assert_eq!(
            *layer.current_state(),
            from_scratch(&[vec![1, 0], vec![1, 0], vec![1, 0], vec![1, 0], vec![1, 0]])
        );
    }

    #[test]
    fn predictions_repeat_newest_real_remote_input() {
        let mut layer = layer(2);
        layer.speculate_tick(1).unwrap();
        layer.sync(Frame::new(1), 1, &[vec![1u8, 6]]).unwrap();
        layer.speculate_tick(2).unwrap();
        assert_eq!(
            layer
                .record(Frame::new(2))
                .unwrap()
                .inputs()
                .input(PlayerHandle::new(1)),
            Some(6)
        );
    }

    #[test]
    fn advance_confirmed_moves_cursor() {
        let mut layer = layer(2);
        assert_eq!(layer.advance_confirmed(&[1, 2]).unwrap(), 1);
        assert_eq!(layer.last_frame_synced(), Frame::new(1));
        assert!(!layer
            .record(Frame::new(1))
            .unwrap()
            .inputs()
            .has_predictions());
    }

    #[test]
    fn advance_confirmed_rejects_wrong_width_and_predicted_tail() {
        let mut layer = layer(2);
        assert!(matches!(
            layer.advance_confirmed(&[1]),
            Err(RollbackError::InvalidRequest { .. })
        ));
        layer.speculate_tick(1).unwrap();
        assert!(matches!(
            layer.advance_confirmed(&[1, 1]),
            Err(RollbackError::InvalidFrame { .. })
        ));
    }
}
