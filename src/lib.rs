//! # Lockstep Rollback
//!
//! Rollback/prediction netcode core for deterministic peer-to-peer simulations.
//!
//! Every peer runs the same deterministic simulation. The local peer never waits for the
//! network: each frame it ticks immediately with its own real input and a *predicted* input
//! for every remote player. When authoritative inputs arrive (in redundant, possibly
//! reordered batches) the crate diffs them against what was predicted, rolls back to the
//! earliest mispredicted frame and replays forward. A permanent gap in the authoritative
//! stream is detected and surfaced as a fatal [`RollbackError::Desync`] instead of letting
//! peers silently diverge.
//!
//! ## Components
//!
//! - [`History`](history::History): contiguous, append-only log of [`FrameRecord`]s from frame 0
//! - [`InputPredictor`]: guesses remote input from the newest confirmed input
//! - [`SyncLayer`](sync_layer::SyncLayer): speculative driver and resynchronizer
//! - [`RollbackSession`]: the façade a game loop owns (inbound batch queue, events, desync latch)
//! - [`SyncTestSession`]: re-simulates recent frames to catch non-deterministic tick functions
//!
//! ## Example
//!
//! ```
//! use lockstep_rollback::{Config, Frame, InputBatch, InputSet, PlayerHandle, SessionBuilder};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
//! struct Step(i32);
//!
//! struct Counter;
//!
//! impl Config for Counter {
//!     type Input = Step;
//!     type State = i64;
//! }
//!
//! fn tick(state: &i64, inputs: &InputSet<Step>) -> i64 {
//!     state + inputs.inputs().map(|step| i64::from(step.0)).sum::<i64>()
//! }
//!
//! let mut session = SessionBuilder::<Counter>::new()
//!     .with_local_player(PlayerHandle::new(0))?
//!     .start_session(0, tick)?;
//!
//! // The remote player is predicted to idle.
//! session.speculate_tick(Step(1))?;
//! assert_eq!(*session.current_state(), 1);
//!
//! // The remote player actually stepped by 5 on frame 1.
//! let batch = InputBatch::from_frames(Frame::new(1), vec![vec![Step(1), Step(5)]]);
//! session.sync(&batch)?;
//! assert_eq!(*session.current_state(), 6);
//! # Ok::<(), lockstep_rollback::RollbackError>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

pub use error::{InvalidRequestKind, RollbackError, RollbackResult};
pub use frame_info::{FrameRecord, InputSet, InputSlot};
pub use network::messages::InputBatch;
pub use prediction::{BlankPrediction, InputPredictor, PredictionStrategy, RepeatLastConfirmed};
pub use sessions::builder::SessionBuilder;
pub use sessions::event_drain::EventDrain;
pub use sessions::rollback_session::RollbackSession;
pub use sessions::sync_test_session::SyncTestSession;
pub use sync_layer::{SyncOutcome, SyncReport};

pub mod checksum;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
pub mod hash;
#[doc(hidden)]
pub mod history;
pub mod prediction;
pub mod prelude;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod event_drain;
    #[doc(hidden)]
    pub mod rollback_session;
    #[doc(hidden)]
    pub mod sync_test_session;
}
/// Wire types and the binary codec for exchanging input batches between peers.
pub mod network {
    /// Binary codec for input batch serialization.
    ///
    /// Wraps bincode with a fixed configuration so every peer encodes batches identically.
    pub mod codec;
    #[doc(hidden)]
    pub mod messages;
}

/// Internal module exposing implementation details for property testing and benchmarks.
///
/// Nothing in here is covered by semver. Game code should go through
/// [`RollbackSession`] and [`SyncTestSession`].
#[doc(hidden)]
pub mod __internal {
    pub use crate::history::History;
    pub use crate::sync_layer::SyncLayer;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A stack-allocated list of per-player values, sized for the common 1-4 player case.
pub type InputVec<I> = smallvec::SmallVec<[I; 4]>;

/// A frame is a single step of simulation.
///
/// Frame numbers start at 0 (the initial state, created at session start and never
/// mutated) and increase by exactly one per tick. [`Frame::NULL`] represents "no frame".
///
/// # Examples
///
/// ```
/// use lockstep_rollback::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
///
/// let next = frame + 1;
/// assert_eq!(next.as_i32(), 1);
/// assert_eq!(next - frame, 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, equivalent to [`NULL_FRAME`].
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// The initial frame of every session.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame`. The value is not validated.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is non-negative.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns the frame as a history index, or `None` for negative frames.
    #[inline]
    #[must_use]
    pub const fn as_index(self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// Arithmetic operations

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identifies one input slot of the session, `0..num_players`.
///
/// # Examples
///
/// ```
/// use lockstep_rollback::PlayerHandle;
///
/// let handle = PlayerHandle::new(1);
/// assert!(handle.is_valid_player_for(2));
/// assert!(!handle.is_valid_player_for(1));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle`. The value is not validated against a session.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle addresses a slot in a session with `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_valid_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerHandle(value)
    }
}

impl From<PlayerHandle> for usize {
    #[inline]
    fn from(handle: PlayerHandle) -> Self {
        handle.0
    }
}

// #############
// #   ENUMS   #
// #############

/// Provenance of one input slot. Tracked per slot, because a single frame mixes the
/// local player's real input with predicted remote input.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum InputStatus {
    /// The input is real: produced locally or received as authoritative input.
    Confirmed,
    /// The input was synthesized by the [`InputPredictor`] and is eligible for rollback.
    Predicted,
}

/// A session is always in one of these states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The session accepts local ticks and inbound batches.
    Running,
    /// A permanent gap in the authoritative input stream was detected. The session refuses
    /// all further work and must be rebuilt from a fresh agreed initial state.
    Desynchronized {
        /// First frame whose authoritative input can never arrive.
        first_missing: Frame,
        /// Last frame whose authoritative input can never arrive.
        last_missing: Frame,
    },
}

/// Notifications emitted by a [`RollbackSession`]. Handling them is up to the user.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`; always include a wildcard arm when matching.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RollbackEvent {
    /// Mispredicted frames were discarded and re-simulated.
    Rollback {
        /// Earliest mispredicted frame (first re-simulated frame).
        from: Frame,
        /// Last re-simulated frame.
        to: Frame,
    },
    /// All frames up to and including `frame` are now confirmed and immutable.
    Confirmed {
        /// The new synchronization cursor.
        frame: Frame,
    },
    /// A batch arrived that only covered already-confirmed frames and was discarded.
    StaleBatch {
        /// The last frame covered by the discarded batch.
        sync_frame: Frame,
        /// The synchronization cursor at the time the batch was discarded.
        last_frame_synced: Frame,
    },
    /// The session hit a fatal desynchronization.
    Desynchronized {
        /// First frame whose authoritative input can never arrive.
        first_missing: Frame,
        /// Last frame whose authoritative input can never arrive.
        last_missing: Frame,
    },
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for sessions.
///
/// Implement this on a marker struct to bundle the input and state types.
///
/// # Example
///
/// ```
/// use lockstep_rollback::Config;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Copy, Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
/// enum Move {
///     #[default]
///     Sleep,
///     Up,
///     Down,
/// }
///
/// #[derive(Clone)]
/// struct Board {
///     cells: Vec<u8>,
/// }
///
/// struct PuzzleConfig;
///
/// impl Config for PuzzleConfig {
///     type Input = Move;
///     type State = Board;
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait Config: 'static + Send + Sync {
    /// The per-player, per-frame action. This is the only game data that crosses the network.
    ///
    /// The implementation of [Default] is the neutral "no-op" action used when nothing
    /// better can be predicted.
    type Input: Copy + Clone + PartialEq + Default + Debug + Serialize + DeserializeOwned + Send + Sync;

    /// The simulation state. Every frame record owns its own snapshot.
    type State: Clone + Send + Sync;
}

/// Compile time parameterization for sessions.
#[cfg(not(feature = "sync-send"))]
pub trait Config: 'static {
    /// The per-player, per-frame action. This is the only game data that crosses the network.
    ///
    /// The implementation of [Default] is the neutral "no-op" action used when nothing
    /// better can be predicted.
    type Input: Copy + Clone + PartialEq + Default + Debug + Serialize + DeserializeOwned;

    /// The simulation state. Every frame record owns its own snapshot.
    type State: Clone;
}

/// The deterministic per-frame step of the game.
///
/// `tick` must be a pure function of `(state, inputs)`: no hidden randomness, no wall
/// clock, no I/O, and no failure for any reachable state (including states reached
/// through predicted or neutral input). Replay correctness depends on it.
///
/// Any `Fn(&T::State, &InputSet<T::Input>) -> T::State` closure or function implements it.
pub trait Simulation<T: Config>: Send + Sync {
    /// Produces the state of the next frame.
    fn tick(&self, state: &T::State, inputs: &InputSet<T::Input>) -> T::State;
}

impl<T, F> Simulation<T> for F
where
    T: Config,
    F: Fn(&T::State, &InputSet<T::Input>) -> T::State + Send + Sync,
{
    fn tick(&self, state: &T::State, inputs: &InputSet<T::Input>) -> T::State {
        self(state, inputs)
    }
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    // ==========================================
    // Frame Tests
    // ==========================================

    #[test]
    fn frame_null_is_not_valid() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.as_index(), None);
    }

    #[test]
    fn frame_zero_is_valid_index() {
        assert!(Frame::ZERO.is_valid());
        assert_eq!(Frame::ZERO.as_index(), Some(0));
        assert_eq!(Frame::new(17).as_index(), Some(17));
    }

    #[test]
    fn frame_arithmetic() {
        let mut frame = Frame::new(10);
        assert_eq!(frame + 5, Frame::new(15));
        assert_eq!(frame - 3, Frame::new(7));
        assert_eq!(Frame::new(15) - frame, 5);
        frame += 2;
        assert_eq!(frame, 12);
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::new(42).to_string(), "42");
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
    }

    #[test]
    fn frame_compares_with_i32() {
        assert!(Frame::new(3) > 2);
        assert!(Frame::new(3) == 3);
    }

    // ==========================================
    // PlayerHandle Tests
    // ==========================================

    #[test]
    fn player_handle_validity() {
        assert!(PlayerHandle::new(0).is_valid_player_for(1));
        assert!(!PlayerHandle::new(1).is_valid_player_for(1));
        assert_eq!(usize::from(PlayerHandle::from(3)), 3);
    }

    // ==========================================
    // Simulation Tests
    // ==========================================

    struct CounterConfig;

    impl Config for CounterConfig {
        type Input = u8;
        type State = u32;
    }

    #[test]
    fn closures_implement_simulation() {
        let sim = |state: &u32, inputs: &InputSet<u8>| state + inputs.inputs().map(u32::from).sum::<u32>();
        let inputs = InputSet::confirmed([1u8, 2, 3]);
        assert_eq!(Simulation::<CounterConfig>::tick(&sim, &10, &inputs), 16);
    }
}
