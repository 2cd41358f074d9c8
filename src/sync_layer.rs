//! # Sync Layer - Rollback Networking Core
//!
//! The sync layer owns the frame [`History`], the [`InputPredictor`], the deterministic
//! [`Simulation`] and the synchronization cursor. Sessions drive it; it never touches the
//! network.
//!
//! ## How Rollback Works
//!
//! ### Step 1: Speculation
//!
//! Every local frame is simulated immediately ([`SyncLayer::speculate_tick`]). The local
//! player's slot holds the real input, every remote slot holds a prediction. The resulting
//! record is appended to the history.
//!
//! ### Step 2: Authoritative Batches
//!
//! Remote peers send the real inputs of a contiguous run of frames ending at `sync_frame`.
//! Batches overlap on purpose, so a lost message is covered by the next one.
//! [`SyncLayer::sync`] checks a batch against the cursor:
//!
//! - ending before the cursor: stale, dropped
//! - starting after `cursor + 1`: the frames in between can never be confirmed, which is a
//!   fatal [`RollbackError::Desync`](crate::RollbackError::Desync)
//!
//! ### Step 3: Rollback
//!
//! The earliest frame above the cursor whose stored input set is not exactly the real
//! authoritative one (a predicted slot or a different value) becomes the rollback frame.
//! The history is cut there and every frame up to `max(sync_frame, previous highest)` is
//! re-simulated: batch frames with authoritative input, later frames with the real inputs
//! recorded before the cut and fresh predictions for the rest.
//!
//! ```text
//! frames:   0 ─ 1 ─ 2 ─ 3 ─ 4 ─ 5        (highest = 5, cursor = 1)
//! batch:            [2   3]              (sync_frame = 3)
//! mismatch:             ^ frame 3 predicted wrong
//! replay:               3 ─ 4 ─ 5        (3 from batch, 4..5 re-predicted)
//! cursor:                 3
//! ```
//!
//! ## Determinism Requirement
//!
//! **Critical**: the tick function MUST be deterministic. A replay has to reproduce the
//! first run exactly wherever the inputs did not change.

mod resync;
mod speculation;

pub use resync::{SyncOutcome, SyncReport};

use std::sync::Arc;

use crate::frame_info::{FrameRecord, InputSet};
use crate::history::History;
use crate::prediction::InputPredictor;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationObserver};
use crate::{Config, Frame, PlayerHandle, RollbackResult, Simulation};

/// Largest authoritative batch accepted by default.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

/// The synchronization layer: history, prediction, replay and the sync cursor.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and benchmarks.
/// It is not part of the stable public API.
pub struct SyncLayer<T>
where
    T: Config,
{
    history: History<T::Input, T::State>,
    predictor: InputPredictor<T::Input>,
    simulation: Arc<dyn Simulation<T>>,
    local_player: PlayerHandle,
    /// Highest frame whose every slot is authoritative. Never decreases.
    last_frame_synced: Frame,
    max_batch_size: usize,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> SyncLayer<T> {
    /// Creates a sync layer positioned at frame 0.
    pub fn new(
        initial_state: T::State,
        num_players: usize,
        local_player: PlayerHandle,
        simulation: Arc<dyn Simulation<T>>,
    ) -> Self {
        Self {
            history: History::new(initial_state, num_players),
            predictor: InputPredictor::default(),
            simulation,
            local_player,
            last_frame_synced: Frame::ZERO,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            observer: None,
        }
    }

    /// Replaces the input predictor.
    #[must_use]
    pub fn with_predictor(mut self, predictor: InputPredictor<T::Input>) -> Self {
        self.predictor = predictor;
        self
    }

    /// Sets the largest batch `sync` accepts.
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Routes violations to `observer` instead of the tracing default.
    #[must_use]
    pub fn with_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// The frame history.
    #[must_use]
    pub fn history(&self) -> &History<T::Input, T::State> {
        &self.history
    }

    /// The record of `frame`, if it exists.
    #[must_use]
    pub fn record(&self, frame: Frame) -> Option<&FrameRecord<T::Input, T::State>> {
        self.history.get(frame)
    }

    /// The deterministic tick function.
    #[must_use]
    pub fn simulation(&self) -> &dyn Simulation<T> {
        self.simulation.as_ref()
    }

    /// The highest simulated frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.history.highest_frame()
    }

    /// The state of the highest simulated frame.
    #[must_use]
    pub fn current_state(&self) -> &T::State {
        self.history.latest().state()
    }

    /// The synchronization cursor.
    #[must_use]
    pub fn last_frame_synced(&self) -> Frame {
        self.last_frame_synced
    }

    /// How many frames run ahead of the cursor on predicted input.
    #[must_use]
    pub fn frames_ahead(&self) -> usize {
        (self.current_frame() - self.last_frame_synced).max(0) as usize
    }

    /// Number of input slots per frame.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.history.num_players()
    }

    /// The slot whose input is produced locally.
    #[must_use]
    pub fn local_player(&self) -> PlayerHandle {
        self.local_player
    }

    /// The largest batch `sync` accepts.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Where violations are reported. `None` means the tracing default.
    #[must_use]
    pub fn observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.observer.as_ref()
    }

    /// Drops everything and starts over from a new frame 0.
    pub fn reset(&mut self, initial_state: T::State) {
        self.history.reset(initial_state);
        self.last_frame_synced = Frame::ZERO;
    }

    /// Ticks the newest state with `inputs` and appends the result as the next frame.
    fn simulate_next(&mut self, inputs: InputSet<T::Input>) -> RollbackResult<Frame> {
        let frame = self.history.highest_frame() + 1;
        let state = self
            .simulation
            .tick(self.history.latest().state(), &inputs);
        self.history.append(frame, inputs, state)?;
        Ok(frame)
    }
}

impl<T: Config> InvariantChecker for SyncLayer<T> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.history.check_invariants()?;

        if self.last_frame_synced > self.history.highest_frame() {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "sync cursor is ahead of the history",
            )
            .with_details(format!(
                "last_frame_synced={}, highest_frame={}",
                self.last_frame_synced,
                self.history.highest_frame()
            )));
        }

        let unconfirmed = self
            .history
            .iter()
            .take_while(|record| record.frame() <= self.last_frame_synced)
            .find(|record| record.inputs().has_predictions());
        if let Some(record) = unconfirmed {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "frame at or below the sync cursor holds a prediction",
            )
            .with_details(format!(
                "frame={}, last_frame_synced={}",
                record.frame(),
                self.last_frame_synced
            )));
        }

        if !self.local_player.is_valid_player_for(self.num_players()) {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "local player handle out of range",
            )
            .with_details(format!(
                "local_player={}, num_players={}",
                self.local_player,
                self.num_players()
            )));
        }

        Ok(())
    }
}

impl<T: Config> std::fmt::Debug for SyncLayer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("current_frame", &self.current_frame())
            .field("last_frame_synced", &self.last_frame_synced)
            .field("num_players", &self.num_players())
            .field("local_player", &self.local_player)
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
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
pub(crate) mod test_support {
    use super::*;

    /// Two players, inputs are small integers, the state is the running sum of all
    /// inputs weighted by player (so swapping slots changes the state).
    pub struct SumConfig;

    impl Config for SumConfig {
        type Input = u8;
        type State = u64;
    }

    pub fn weighted_sum(state: &u64, inputs: &InputSet<u8>) -> u64 {
        inputs
            .inputs()
            .enumerate()
            .fold(state.wrapping_mul(3), |acc, (index, input)| {
                acc.wrapping_add((index as u64 + 1) * u64::from(input))
            })
    }

    pub fn layer(num_players: usize) -> SyncLayer<SumConfig> {
        SyncLayer::new(0, num_players, PlayerHandle::new(0), Arc::new(weighted_sum))
    }

    /// Replays `frames` from frame 0 with the given full input sets.
    pub fn from_scratch(frames: &[Vec<u8>]) -> u64 {
        frames.iter().fold(0, |state, inputs| {
            weighted_sum(&state, &InputSet::confirmed(inputs.iter().copied()))
        })
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
    use super::test_support::*;
    use super::*;

    #[test]
    fn starts_at_frame_zero() {
        let layer = layer(2);
        assert_eq!(layer.current_frame(), Frame::ZERO);
        assert_eq!(layer.last_frame_synced(), Frame::ZERO);
        assert_eq!(*layer.current_state(), 0);
        assert_eq!(layer.frames_ahead(), 0);
        assert!(layer.check_invariants().is_ok());
    }

    #[test]
    fn reset_rewinds_cursor() {
        let mut layer = layer(2);
        layer.speculate_tick(1).unwrap();
        layer.sync(Frame::new(1), 1, &[vec![1u8, 2]]).unwrap();
        assert_eq!(layer.last_frame_synced(), Frame::new(1));

        layer.reset(9);
        assert_eq!(layer.current_frame(), Frame::ZERO);
        assert_eq!(layer.last_frame_synced(), Frame::ZERO);
        assert_eq!(*layer.current_state(), 9);
    }

    #[cfg(any(debug_assertions, feature = "paranoid"))]
    #[test]
    fn broken_invariant_is_reported_to_the_configured_observer() {
        use crate::telemetry::{CollectingObserver, ViolationKind};

        let collector = Arc::new(CollectingObserver::new());
        let observer: Arc<dyn ViolationObserver> = collector.clone();
        let mut layer = layer(2).with_observer(Some(observer));
        layer.last_frame_synced = Frame::new(5);

        layer.speculate_tick(1).unwrap();
        let seen = collector.violations();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].kind, ViolationKind::Invariant);
        assert!(seen[0].message.contains("after speculate_tick"), "{}", seen[0].message);
    }

    #[test]
    fn debug_output_is_compact() {
        let text = format!("{:?}", layer(3));
        assert!(text.contains("num_players: 3"));
        assert!(text.contains("last_frame_synced"));
    }
}
