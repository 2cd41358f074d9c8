use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, trace};

use crate::checksum::compute_checksum;
use crate::frame_info::{FrameRecord, InputSlot};
use crate::network::messages::InputBatch;
use crate::sessions::event_drain::EventDrain;
use crate::sync_layer::{SyncLayer, SyncOutcome};
use crate::telemetry::{report_to_observer, Violation, ViolationKind, ViolationSeverity};
use crate::{
    Config, Frame, InputVec, PlayerHandle, RollbackError, RollbackEvent, RollbackResult,
    SessionState,
};

/// A rollback session for one peer of a deterministic simulation.
///
/// The game loop calls [`advance_frame`](Self::advance_frame) once per tick with the local
/// player's input. Authoritative batches from the transport are handed over with
/// [`queue_batch`](Self::queue_batch) or [`receive_message`](Self::receive_message); they are
/// only applied at the next [`poll_remote_batches`](Self::poll_remote_batches) or
/// `advance_frame`, so the history is never modified from inside a network callback.
///
/// Once a gap in the authoritative input stream is detected the session latches into
/// [`SessionState::Desynchronized`] and every later mutating call fails with the same
/// [`RollbackError::Desync`]. Build a new session from a fresh agreed state to continue.
pub struct RollbackSession<T>
where
    T: Config,
{
    sync_layer: SyncLayer<T>,
    /// Batches received but not applied yet, oldest first.
    inbound: VecDeque<InputBatch<T::Input>>,
    max_queued_batches: usize,
    event_queue: VecDeque<RollbackEvent>,
    max_event_queue_size: usize,
    /// The error every call returns once the session is desynchronized.
    desync: Option<RollbackError>,
}

impl<T: Config> RollbackSession<T> {
    pub(crate) fn new(
        sync_layer: SyncLayer<T>,
        max_queued_batches: usize,
        max_event_queue_size: usize,
    ) -> Self {
        Self {
            sync_layer,
            inbound: VecDeque::new(),
            max_queued_batches,
            event_queue: VecDeque::new(),
            max_event_queue_size,
            desync: None,
        }
    }

    /// Applies queued batches, then simulates the next frame with `local_input` and
    /// predicted remote input. Returns the new frame.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::Desync`] if a queued batch revealed a gap, or the session was
    ///   already desynchronized. No frame is simulated.
    /// - [`RollbackError::InvalidRequest`] if a queued batch was malformed. The batch is
    ///   dropped; call again to continue.
    pub fn advance_frame(&mut self, local_input: T::Input) -> RollbackResult<Frame> {
        self.poll_remote_batches()?;
        self.speculate_tick(local_input)
    }

    /// Simulates the next frame with `local_input` and predicted remote input, without
    /// looking at queued batches. Returns the new frame.
    ///
    /// # Errors
    ///
    /// [`RollbackError::Desync`] if the session is desynchronized.
    pub fn speculate_tick(&mut self, local_input: T::Input) -> RollbackResult<Frame> {
        self.ensure_running()?;
        self.sync_layer.speculate_tick(local_input)
    }

    /// Applies an authoritative batch right away.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::InvalidRequest`] if the batch is malformed. Nothing changes.
    /// - [`RollbackError::Desync`] if the batch starts after `confirmed_frame() + 1`, or the
    ///   session was already desynchronized. The session is unusable afterwards.
    pub fn sync(&mut self, batch: &InputBatch<T::Input>) -> RollbackResult<SyncOutcome> {
        self.sync_frames(batch.sync_frame(), batch.batch_size(), batch.inputs())
    }

    /// Like [`sync`](Self::sync), with the batch given as its parts.
    ///
    /// # Errors
    ///
    /// See [`sync`](Self::sync).
    pub fn sync_frames<V>(
        &mut self,
        sync_frame: Frame,
        batch_size: usize,
        inputs: &[V],
    ) -> RollbackResult<SyncOutcome>
    where
        V: AsRef<[T::Input]>,
    {
        self.ensure_running()?;
        match self.sync_layer.sync(sync_frame, batch_size, inputs) {
            Ok(outcome) => {
                self.record_outcome(&outcome);
                Ok(outcome)
            },
            Err(err) => {
                if let RollbackError::Desync {
                    first_missing,
                    last_missing,
                    ..
                } = err
                {
                    self.latch_desync(&err, first_missing, last_missing);
                }
                Err(err)
            },
        }
    }

    /// Queues a batch to be applied at the next poll. Never touches the history.
    ///
    /// When the queue already holds the configured maximum, the oldest queued batch is
    /// dropped. Batches overlap, so a newer one usually covers what the dropped one carried.
    pub fn queue_batch(&mut self, batch: InputBatch<T::Input>) {
        while self.inbound.len() >= self.max_queued_batches {
            if let Some(dropped) = self.inbound.pop_front() {
                debug!(
                    sync_frame = dropped.sync_frame().as_i32(),
                    max_queued_batches = self.max_queued_batches,
                    "inbound queue full, dropping oldest batch"
                );
            }
        }
        trace!(
            sync_frame = batch.sync_frame().as_i32(),
            batch_size = batch.batch_size(),
            queued = self.inbound.len() + 1,
            "queued authoritative batch"
        );
        self.inbound.push_back(batch);
    }

    /// Decodes an encoded [`InputBatch`], checks its shape against this session and queues
    /// it.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::SerializationError`] if the message is not a valid encoding.
    /// - [`RollbackError::InvalidRequest`] if the batch does not fit this session (empty,
    ///   too large, before frame 0, wrong number of players).
    ///
    /// Nothing is queued on error.
    pub fn receive_message(&mut self, bytes: &[u8]) -> RollbackResult<()> {
        let batch = InputBatch::decode(bytes)?;
        batch.validate(self.num_players(), self.sync_layer.max_batch_size())?;
        self.queue_batch(batch);
        Ok(())
    }

    /// Number of batches waiting for the next poll.
    #[must_use]
    pub fn queued_batches(&self) -> usize {
        self.inbound.len()
    }

    /// Applies queued batches in arrival order. Returns how many were applied (stale
    /// batches included).
    ///
    /// Stops at the first failing batch. That batch is dropped; the ones behind it stay
    /// queued unless the failure was a desync, in which case the queue is cleared.
    ///
    /// # Errors
    ///
    /// See [`sync`](Self::sync).
    pub fn poll_remote_batches(&mut self) -> RollbackResult<usize> {
        self.ensure_running()?;
        let mut applied = 0;
        while let Some(batch) = self.inbound.pop_front() {
            if let Err(err) = self.sync(&batch) {
                if matches!(err, RollbackError::Desync { .. }) {
                    self.inbound.clear();
                }
                return Err(err);
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Returns all events that happened since last queried for events. If the number of
    /// stored events exceeds the configured queue size, the oldest events were discarded.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// Builds an outbound batch with the authoritative inputs of the newest `batch_size`
    /// confirmed frames (fewer if fewer exist, never more than the session's maximum batch
    /// size). Returns `None` while no frame after frame 0 is confirmed.
    ///
    /// Sending a wide batch every frame lets receivers recover from lost messages.
    #[must_use]
    pub fn confirmed_batch(&self, batch_size: usize) -> Option<InputBatch<T::Input>> {
        let sync_frame = self.confirmed_frame();
        let available = usize::try_from(sync_frame.as_i32()).ok()?;
        let batch_size = batch_size
            .min(available)
            .min(self.sync_layer.max_batch_size());
        if batch_size == 0 {
            return None;
        }
        let first_frame = sync_frame - (batch_size as i32 - 1);
        let frames: Option<Vec<InputVec<T::Input>>> = (0..batch_size)
            .map(|offset| {
                self.sync_layer
                    .record(first_frame + offset as i32)
                    .map(|record| record.inputs().inputs().collect())
            })
            .collect();
        frames.map(|frames| InputBatch::new(sync_frame, batch_size, frames))
    }

    /// The state of the highest simulated frame (the one to render).
    #[must_use]
    pub fn current_state(&self) -> &T::State {
        self.sync_layer.current_state()
    }

    /// The highest simulated frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The highest frame whose inputs are all authoritative. Frames up to it never change.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer.last_frame_synced()
    }

    /// How many frames the session runs ahead of the confirmed frame.
    #[must_use]
    pub fn frames_ahead(&self) -> usize {
        self.sync_layer.frames_ahead()
    }

    /// The record of `frame`, if it was simulated.
    #[must_use]
    pub fn record(&self, frame: Frame) -> Option<&FrameRecord<T::Input, T::State>> {
        self.sync_layer.record(frame)
    }

    /// The input a player used at `frame`, with its provenance.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::InvalidPlayerHandle`] if `player` is not a slot of the session.
    /// - [`RollbackError::InvalidFrame`] if `frame` was not simulated.
    pub fn player_input(
        &self,
        frame: Frame,
        player: PlayerHandle,
    ) -> RollbackResult<InputSlot<T::Input>> {
        let num_players = self.num_players();
        if !player.is_valid_player_for(num_players) {
            return Err(RollbackError::InvalidPlayerHandle {
                handle: player,
                num_players,
            });
        }
        self.sync_layer
            .record(frame)
            .and_then(|record| record.inputs().slot(player).copied())
            .ok_or_else(|| RollbackError::InvalidFrame {
                frame,
                reason: format!("current frame is {}", self.current_frame()),
            })
    }

    /// The number of players.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.sync_layer.num_players()
    }

    /// The slot holding the local player's input.
    #[must_use]
    pub fn local_player(&self) -> PlayerHandle {
        self.sync_layer.local_player()
    }

    /// Whether the session still accepts work.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match self.desync {
            Some(RollbackError::Desync {
                first_missing,
                last_missing,
                ..
            }) => SessionState::Desynchronized {
                first_missing,
                last_missing,
            },
            _ => SessionState::Running,
        }
    }

    fn ensure_running(&self) -> RollbackResult<()> {
        match &self.desync {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record_outcome(&mut self, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Stale {
                sync_frame,
                last_frame_synced,
            } => self.push_event(RollbackEvent::StaleBatch {
                sync_frame: *sync_frame,
                last_frame_synced: *last_frame_synced,
            }),
            SyncOutcome::Applied(report) => {
                if let Some(from) = report.rollback_frame {
                    let to = self.sync_layer.current_frame();
                    debug!(from = from.as_i32(), to = to.as_i32(), "rolled back");
                    self.push_event(RollbackEvent::Rollback { from, to });
                }
                self.push_event(RollbackEvent::Confirmed {
                    frame: report.confirmed_frame,
                });
            },
        }
    }

    fn latch_desync(&mut self, err: &RollbackError, first_missing: Frame, last_missing: Frame) {
        let message =
            format!("authoritative input for frames {first_missing}..={last_missing} is lost");
        let violation = Violation::new(
            ViolationSeverity::Critical,
            ViolationKind::FrameSync,
            message,
            concat!(file!(), ":", line!()),
        )
        .with_frame(first_missing)
        .with_context("last_frame_synced", self.confirmed_frame().to_string());
        report_to_observer(self.sync_layer.observer(), &violation);
        self.desync = Some(err.clone());
        self.push_event(RollbackEvent::Desynchronized {
            first_missing,
            last_missing,
        });
    }

    fn push_event(&mut self, event: RollbackEvent) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > self.max_event_queue_size {
            self.event_queue.pop_front();
        }
    }
}

impl<T> RollbackSession<T>
where
    T: Config,
    T::State: Serialize,
{
    /// Checksum of the state stored for `frame`. Peers that agree on the inputs up to a
    /// confirmed frame must agree on its checksum.
    ///
    /// # Errors
    ///
    /// - [`RollbackError::InvalidFrame`] if `frame` was not simulated.
    /// - [`RollbackError::SerializationError`] if the state cannot be encoded.
    pub fn checksum(&self, frame: Frame) -> RollbackResult<u64> {
        let record = self
            .sync_layer
            .record(frame)
            .ok_or_else(|| RollbackError::InvalidFrame {
                frame,
                reason: format!(
                    "frame has not been simulated (current frame {})",
                    self.current_frame()
                ),
            })?;
        compute_checksum(record.state())
    }
}

impl<T: Config> std::fmt::Debug for RollbackSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackSession")
            .field("sync_layer", &self.sync_layer)
            .field("queued_batches", &self.inbound.len())
            .field("queued_events", &self.event_queue.len())
            .field("state", &self.state())
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
    use std::sync::Arc;

    use super::*;
    use crate::sync_layer::test_support::*;
    use crate::telemetry::CollectingObserver;
    use crate::SessionBuilder;

    fn session() -> RollbackSession<SumConfig> {
        SessionBuilder::<SumConfig>::new()
            .start_session(0, weighted_sum)
            .unwrap()
    }

    fn batch(sync_frame: i32, frames: Vec<Vec<u8>>) -> InputBatch<u8> {
        InputBatch::from_frames(Frame::new(sync_frame), frames)
    }

    #[test]
    fn misprediction_emits_rollback_and_confirmed() {
        let mut session = session();
        for _ in 0..3 {
            session.speculate_tick(1).unwrap();
        }
        session.events().for_each(drop);

        session.sync(&batch(2, vec![vec![1, 4], vec![1, 4]])).unwrap();
        let events: Vec<_> = session.events().collect();
        assert_eq!(
            events,
            vec![
                RollbackEvent::Rollback {
                    from: Frame::new(1),
                    to: Frame::new(3)
                },
                RollbackEvent::Confirmed {
                    frame: Frame::new(2)
                },
            ]
        );
        assert_eq!(
            *session.current_state(),
            from_scratch(&[vec![1, 4], vec![1, 4], vec![1, 4]])
        );
    }

    #[test]
    fn stale_batch_is_reported_as_event() {
        let mut session = session();
        session.sync(&batch(3, vec![vec![0, 0]; 3])).unwrap();
        let outcome = session.sync(&batch(1, vec![vec![0, 0]])).unwrap();
        assert!(outcome.is_stale());
        assert!(session.events().any(|event| matches!(
            event,
            RollbackEvent::StaleBatch {
                last_frame_synced,
                ..
            } if last_frame_synced == Frame::new(3)
        )));
    }

    #[test]
    fn gap_latches_desync() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = SessionBuilder::<SumConfig>::new()
            .with_violation_observer(observer.clone())
            .start_session(0, weighted_sum)
            .unwrap();
        session.speculate_tick(1).unwrap();

        let err = session.sync(&batch(5, vec![vec![1, 1]; 2])).unwrap_err();
        assert_eq!(
            err,
            RollbackError::Desync {
                first_missing: Frame::new(1),
                last_missing: Frame::new(3),
                sync_frame: Frame::new(5),
            }
        );
        assert_eq!(
            session.state(),
            SessionState::Desynchronized {
                first_missing: Frame::new(1),
                last_missing: Frame::new(3),
            }
        );
        assert!(observer.has_violation(ViolationKind::FrameSync));

        // every later call fails the same way, even a batch that would fit
        assert_eq!(session.speculate_tick(1).unwrap_err(), err);
        assert_eq!(
            session.sync(&batch(1, vec![vec![1, 1]])).unwrap_err(),
            err
        );
        assert_eq!(session.current_frame(), Frame::new(1));
        assert!(session
            .events()
            .any(|event| matches!(event, RollbackEvent::Desynchronized { .. })));
    }

    #[test]
    fn malformed_batch_does_not_latch() {
        let mut session = session();
        let err = session.sync(&batch(2, vec![vec![1]; 2])).unwrap_err();
        assert!(matches!(err, RollbackError::InvalidRequest { .. }));
        assert_eq!(session.state(), SessionState::Running);
        assert!(session.speculate_tick(0).is_ok());
    }

    #[test]
    fn queued_batches_apply_only_when_polled() {
        let mut session = session();
        session.speculate_tick(2).unwrap();
        session.queue_batch(batch(1, vec![vec![2, 7]]));
        assert_eq!(session.confirmed_frame(), Frame::ZERO);
        assert_eq!(session.queued_batches(), 1);

        assert_eq!(session.poll_remote_batches().unwrap(), 1);
        assert_eq!(session.confirmed_frame(), Frame::new(1));
        assert_eq!(session.queued_batches(), 0);
    }

    #[test]
    fn advance_frame_polls_before_speculating() {
        let mut session = session();
        session.speculate_tick(2).unwrap();
        session.queue_batch(batch(1, vec![vec![2, 7]]));
        assert_eq!(session.advance_frame(2).unwrap(), Frame::new(2));
        // frame 2 predicted the freshly confirmed remote input
        let record = session.record(Frame::new(2)).unwrap();
        assert_eq!(record.inputs().input(PlayerHandle::new(1)), Some(7));
    }

    #[test]
    fn desync_while_polling_clears_the_queue() {
        let mut session = session();
        session.queue_batch(batch(4, vec![vec![0, 0]]));
        session.queue_batch(batch(1, vec![vec![0, 0]]));
        assert!(matches!(
            session.poll_remote_batches(),
            Err(RollbackError::Desync { .. })
        ));
        assert_eq!(session.queued_batches(), 0);
    }

    #[test]
    fn receive_message_decodes_and_queues() {
        let mut session = session();
        let bytes = batch(1, vec![vec![3, 3]]).encode().unwrap();
        session.receive_message(&bytes).unwrap();
        assert_eq!(session.queued_batches(), 1);

        assert!(matches!(
            session.receive_message(&bytes[..bytes.len() - 1]),
            Err(RollbackError::SerializationError { .. })
        ));
        assert_eq!(session.queued_batches(), 1);
    }

    #[test]
    fn receive_message_rejects_batches_that_do_not_fit() {
        let mut session = session();
        let three_players = batch(1, vec![vec![3, 3, 3]]).encode().unwrap();
        assert!(matches!(
            session.receive_message(&three_players),
            Err(RollbackError::InvalidRequest { .. })
        ));
        let hostile = InputBatch::from_frames(Frame::new(-10), vec![vec![1u8, 1]])
            .encode()
            .unwrap();
        assert!(matches!(
            session.receive_message(&hostile),
            Err(RollbackError::InvalidRequest { .. })
        ));
        assert_eq!(session.queued_batches(), 0);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn inbound_queue_keeps_only_the_newest_batches() {
        let mut session = SessionBuilder::<SumConfig>::new()
            .with_max_queued_batches(2)
            .unwrap()
            .start_session(0, weighted_sum)
            .unwrap();
        for frame in 1..=5 {
            let frames = (1..=frame).map(|_| vec![1u8, 1]).collect();
            session.queue_batch(batch(frame, frames));
        }
        assert_eq!(session.queued_batches(), 2);
        assert_eq!(session.poll_remote_batches().unwrap(), 2);
        assert_eq!(session.confirmed_frame(), Frame::new(5));
    }

    #[test]
    fn event_queue_drops_oldest() {
        let mut session = SessionBuilder::<SumConfig>::new()
            .with_event_queue_size(2)
            .unwrap()
            .start_session(0, weighted_sum)
            .unwrap();
        for frame in 1..=4 {
            session.sync(&batch(frame, vec![vec![0, 0]])).unwrap();
        }
        let events: Vec<_> = session.events().collect();
        assert_eq!(
            events,
            vec![
                RollbackEvent::Confirmed {
                    frame: Frame::new(3)
                },
                RollbackEvent::Confirmed {
                    frame: Frame::new(4)
                },
            ]
        );
    }

    #[test]
    fn confirmed_batch_covers_newest_confirmed_frames() {
        let mut session = session();
        assert!(session.confirmed_batch(4).is_none());

        session
            .sync(&batch(3, vec![vec![1, 2], vec![3, 4], vec![5, 6]]))
            .unwrap();
        let outbound = session.confirmed_batch(2).unwrap();
        assert_eq!(outbound.sync_frame(), Frame::new(3));
        assert_eq!(outbound.first_frame(), Frame::new(2));
        assert_eq!(outbound.inputs_for(Frame::new(2)), Some(&[3u8, 4][..]));

        // clamped to what exists
        assert_eq!(session.confirmed_batch(10).unwrap().batch_size(), 3);

        // a second peer fed the outbound batch converges
        let mut peer = self::session();
        peer.sync(&session.confirmed_batch(3).unwrap()).unwrap();
        assert_eq!(peer.current_state(), session.current_state());
    }

    #[test]
    fn checksum_of_confirmed_frames_matches_across_peers() {
        let mut a = session();
        let mut b = session();
        a.speculate_tick(1).unwrap();
        a.speculate_tick(1).unwrap();
        let full = batch(2, vec![vec![1, 5], vec![1, 6]]);
        a.sync(&full).unwrap();
        b.sync(&full).unwrap();
        assert_eq!(
            a.checksum(Frame::new(2)).unwrap(),
            b.checksum(Frame::new(2)).unwrap()
        );
        assert!(matches!(
            a.checksum(Frame::new(9)),
            Err(RollbackError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn player_input_reports_provenance() {
        let mut session = session();
        session.speculate_tick(7).unwrap();

        let local = session.player_input(Frame::new(1), PlayerHandle::new(0)).unwrap();
        assert_eq!(local, InputSlot::confirmed(7));
        let remote = session.player_input(Frame::new(1), PlayerHandle::new(1)).unwrap();
        assert_eq!(remote.status, crate::InputStatus::Predicted);

        assert_eq!(
            session.player_input(Frame::new(1), PlayerHandle::new(2)),
            Err(RollbackError::InvalidPlayerHandle {
                handle: PlayerHandle::new(2),
                num_players: 2,
            })
        );
        assert!(matches!(
            session.player_input(Frame::new(2), PlayerHandle::new(0)),
            Err(RollbackError::InvalidFrame { .. })
        ));
    }
}
