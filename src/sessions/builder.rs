use std::sync::Arc;

use tracing::debug;

use crate::error::InvalidRequestKind;
use crate::prediction::{InputPredictor, PredictionStrategy};
use crate::sessions::rollback_session::RollbackSession;
use crate::sessions::sync_test_session::SyncTestSession;
use crate::sync_layer::{SyncLayer, DEFAULT_MAX_BATCH_SIZE};
use crate::telemetry::ViolationObserver;
use crate::{Config, PlayerHandle, RollbackResult, Simulation};

const DEFAULT_PLAYERS: usize = 2;
const DEFAULT_LOCAL_PLAYER: PlayerHandle = PlayerHandle::new(0);
/// Default event queue size.
/// Events older than this threshold are dropped if not polled.
const DEFAULT_EVENT_QUEUE_SIZE: usize = 100;
/// Default number of received batches held until the next poll.
const DEFAULT_MAX_QUEUED_BATCHES: usize = 32;
/// Default number of frames a sync test re-simulates.
const DEFAULT_CHECK_DISTANCE: usize = 2;

/// The [`SessionBuilder`] builds every session type of this crate.
///
/// After setting all appropriate values, use `SessionBuilder::start_*_session(...)`
/// to consume the builder and create a session of the desired type.
///
/// # Examples
///
/// ```
/// use lockstep_rollback::{Config, InputSet, PlayerHandle, SessionBuilder};
///
/// struct Dice;
///
/// impl Config for Dice {
///     type Input = u8;
///     type State = u32;
/// }
///
/// let session = SessionBuilder::<Dice>::new()
///     .with_num_players(4)?
///     .with_local_player(PlayerHandle::new(2))?
///     .with_max_batch_size(16)?
///     .start_session(0, |total: &u32, rolls: &InputSet<u8>| {
///         total + rolls.inputs().map(u32::from).sum::<u32>()
///     })?;
/// assert_eq!(session.num_players(), 4);
/// # Ok::<(), lockstep_rollback::RollbackError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling a start_*_session method"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    num_players: usize,
    local_player: PlayerHandle,
    predictor: InputPredictor<T::Input>,
    max_batch_size: usize,
    event_queue_size: usize,
    max_queued_batches: usize,
    check_distance: usize,
    /// Optional observer for violations. Defaults to the tracing observer when unset.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for SessionBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure so a new field cannot be forgotten here.
        let Self {
            num_players,
            local_player,
            predictor,
            max_batch_size,
            event_queue_size,
            max_queued_batches,
            check_distance,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("num_players", num_players)
            .field("local_player", local_player)
            .field("predictor", predictor)
            .field("max_batch_size", max_batch_size)
            .field("event_queue_size", event_queue_size)
            .field("max_queued_batches", max_queued_batches)
            .field("check_distance", check_distance)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            num_players: DEFAULT_PLAYERS,
            local_player: DEFAULT_LOCAL_PLAYER,
            predictor: InputPredictor::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            max_queued_batches: DEFAULT_MAX_QUEUED_BATCHES,
            check_distance: DEFAULT_CHECK_DISTANCE,
            violation_observer: None,
        }
    }

    /// Change the number of players (input slots per frame). Default is 2.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if `num_players` is 0.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn with_num_players(mut self, num_players: usize) -> RollbackResult<Self> {
        if num_players == 0 {
            return Err(InvalidRequestKind::ZeroPlayers.into());
        }
        self.num_players = num_players;
        Ok(self)
    }

    /// Change which slot holds the local player's real input. Default is player 0.
    ///
    /// Call after [`with_num_players`](Self::with_num_players); the handle is checked
    /// against the player count known at this point and again when the session starts.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if the handle is not below the number of players.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn with_local_player(mut self, handle: PlayerHandle) -> RollbackResult<Self> {
        self.check_local_player(handle)?;
        self.local_player = handle;
        Ok(self)
    }

    /// Change how remote input is predicted. Default is
    /// [`RepeatLastConfirmed`](crate::RepeatLastConfirmed).
    ///
    /// The strategy must be deterministic; replays re-predict every frame past the
    /// authoritative batch.
    pub fn with_prediction_strategy(
        mut self,
        strategy: impl PredictionStrategy<T::Input> + 'static,
    ) -> Self {
        self.predictor = InputPredictor::new(Arc::new(strategy));
        self
    }

    /// Change the largest authoritative batch a session accepts. Default is 64.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if `max_batch_size` is 0.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> RollbackResult<Self> {
        if max_batch_size == 0 {
            return Err(InvalidRequestKind::ZeroValue {
                setting: "max_batch_size",
            }
            .into());
        }
        self.max_batch_size = max_batch_size;
        Ok(self)
    }

    /// Change how many events a session keeps before dropping the oldest. Default is 100.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if `event_queue_size` is 0.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn with_event_queue_size(mut self, event_queue_size: usize) -> RollbackResult<Self> {
        if event_queue_size == 0 {
            return Err(InvalidRequestKind::ZeroValue {
                setting: "event_queue_size",
            }
            .into());
        }
        self.event_queue_size = event_queue_size;
        Ok(self)
    }

    /// Change how many received batches a session holds until the next poll. Default is
    /// 32. When the limit is reached the oldest queued batch is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if `max_queued_batches` is 0.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn with_max_queued_batches(mut self, max_queued_batches: usize) -> RollbackResult<Self> {
        if max_queued_batches == 0 {
            return Err(InvalidRequestKind::ZeroValue {
                setting: "max_queued_batches",
            }
            .into());
        }
        self.max_queued_batches = max_queued_batches;
        Ok(self)
    }

    /// Change how many recent frames a [`SyncTestSession`] re-simulates after each frame.
    /// Default is 2. Only sync tests use it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if `check_distance` is 0.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn with_check_distance(mut self, check_distance: usize) -> RollbackResult<Self> {
        if check_distance == 0 {
            return Err(InvalidRequestKind::ZeroValue {
                setting: "check_distance",
            }
            .into());
        }
        self.check_distance = check_distance;
        Ok(self)
    }

    /// Sets an observer for violations detected by the session.
    ///
    /// Without one, violations go to the [`TracingObserver`](crate::telemetry::TracingObserver).
    ///
    /// # Example
    ///
    /// ```
    /// use lockstep_rollback::telemetry::CollectingObserver;
    /// use lockstep_rollback::{Config, SessionBuilder};
    /// use std::sync::Arc;
    ///
    /// # struct TestConfig;
    /// # impl Config for TestConfig {
    /// #     type Input = u8;
    /// #     type State = ();
    /// # }
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::<TestConfig>::new()
    ///     .with_violation_observer(observer.clone());
    ///
    /// // after running the session:
    /// assert!(observer.is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder to create a [`RollbackSession`] positioned at frame 0.
    ///
    /// `initial_state` must be the state every peer agreed on.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if the local player handle is not below the number of
    /// players.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn start_session(
        self,
        initial_state: T::State,
        simulation: impl Simulation<T> + 'static,
    ) -> RollbackResult<RollbackSession<T>> {
        self.check_local_player(self.local_player)?;
        debug!(
            num_players = self.num_players,
            local_player = self.local_player.as_usize(),
            max_batch_size = self.max_batch_size,
            "starting rollback session"
        );
        let event_queue_size = self.event_queue_size;
        let max_queued_batches = self.max_queued_batches;
        let sync_layer = self.into_sync_layer(initial_state, Arc::new(simulation));
        Ok(RollbackSession::new(
            sync_layer,
            max_queued_batches,
            event_queue_size,
        ))
    }

    /// Consumes the builder to create a [`SyncTestSession`]. Every player is local; the
    /// session re-simulates the last `check_distance` frames after each frame and compares
    /// checksums.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequest`] if the local player handle is not below the number of
    /// players.
    ///
    /// [`InvalidRequest`]: crate::RollbackError::InvalidRequest
    pub fn start_synctest_session(
        self,
        initial_state: T::State,
        simulation: impl Simulation<T> + 'static,
    ) -> RollbackResult<SyncTestSession<T>> {
        self.check_local_player(self.local_player)?;
        debug!(
            num_players = self.num_players,
            check_distance = self.check_distance,
            "starting sync test session"
        );
        let check_distance = self.check_distance;
        let sync_layer = self.into_sync_layer(initial_state, Arc::new(simulation));
        Ok(SyncTestSession::new(sync_layer, check_distance))
    }

    fn check_local_player(&self, handle: PlayerHandle) -> RollbackResult<()> {
        if handle.is_valid_player_for(self.num_players) {
            Ok(())
        } else {
            Err(InvalidRequestKind::InvalidLocalPlayerHandle {
                handle,
                num_players: self.num_players,
            }
            .into())
        }
    }

    fn into_sync_layer(
        self,
        initial_state: T::State,
        simulation: Arc<dyn Simulation<T>>,
    ) -> SyncLayer<T> {
        SyncLayer::new(
            initial_state,
            self.num_players,
            self.local_player,
            simulation,
        )
        .with_predictor(self.predictor)
        .with_max_batch_size(self.max_batch_size)
        .with_observer(self.violation_observer)
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
    use crate::frame_info::InputSet;
    use crate::prediction::BlankPrediction;
    use crate::{Frame, InputBatch, RollbackError};

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
        type State = u32;
    }

    fn sum(state: &u32, inputs: &InputSet<u8>) -> u32 {
        state + inputs.inputs().map(u32::from).sum::<u32>()
    }

    fn is_invalid_request<T>(result: RollbackResult<T>) -> bool {
        matches!(result, Err(RollbackError::InvalidRequest { .. }))
    }

    #[test]
    fn defaults() {
        let session = SessionBuilder::<TestConfig>::new()
            .start_session(0, sum)
            .unwrap();
        assert_eq!(session.num_players(), DEFAULT_PLAYERS);
        assert_eq!(session.local_player(), PlayerHandle::new(0));
        assert_eq!(session.current_frame(), Frame::ZERO);
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(is_invalid_request(
            SessionBuilder::<TestConfig>::new().with_num_players(0)
        ));
        assert!(is_invalid_request(
            SessionBuilder::<TestConfig>::new().with_max_batch_size(0)
        ));
        assert!(is_invalid_request(
            SessionBuilder::<TestConfig>::new().with_event_queue_size(0)
        ));
        assert!(is_invalid_request(
            SessionBuilder::<TestConfig>::new().with_check_distance(0)
        ));
        assert!(is_invalid_request(
            SessionBuilder::<TestConfig>::new().with_max_queued_batches(0)
        ));
    }

    #[test]
    fn local_player_must_fit() {
        assert!(is_invalid_request(
            SessionBuilder::<TestConfig>::new().with_local_player(PlayerHandle::new(2))
        ));
        let builder = SessionBuilder::<TestConfig>::new()
            .with_num_players(3)
            .unwrap()
            .with_local_player(PlayerHandle::new(2))
            .unwrap();
        assert!(builder.start_session(0, sum).is_ok());
    }

    #[test]
    fn shrinking_player_count_is_caught_at_start() {
        let builder = SessionBuilder::<TestConfig>::new()
            .with_num_players(4)
            .unwrap()
            .with_local_player(PlayerHandle::new(3))
            .unwrap()
            .with_num_players(2)
            .unwrap();
        assert!(is_invalid_request(builder.start_session(0, sum)));
    }

    #[test]
    fn max_batch_size_reaches_the_session() {
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_max_batch_size(2)
            .unwrap()
            .start_session(0, sum)
            .unwrap();
        let batch = InputBatch::from_frames(Frame::new(3), vec![vec![1u8, 1]; 3]);
        assert!(is_invalid_request(session.sync(&batch)));
    }

    #[test]
    fn prediction_strategy_reaches_the_session() {
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_prediction_strategy(BlankPrediction)
            .start_session(0, sum)
            .unwrap();
        session
            .sync(&InputBatch::from_frames(Frame::new(1), vec![vec![0u8, 9]]))
            .unwrap();
        session.speculate_tick(0).unwrap();
        let record = session.record(Frame::new(2)).unwrap();
        assert_eq!(record.inputs().input(PlayerHandle::new(1)), Some(0));
    }

    #[test]
    fn debug_lists_settings() {
        let rendered = format!("{:?}", SessionBuilder::<TestConfig>::new());
        assert!(rendered.contains("max_batch_size: 64"));
        assert!(rendered.contains("max_queued_batches: 32"));
        assert!(rendered.contains("has_violation_observer: false"));
    }
}
