//! Rollback session integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use crate::common::stubs::{
    ground_truth, grid_tick, scripted_frame, scripted_move, GridConfig, GridState, Move,
    ScriptedRelay,
};
use lockstep_rollback::checksum::compute_checksum;
use lockstep_rollback::telemetry::{CollectingObserver, ViolationKind};
use lockstep_rollback::{
    Frame, InputBatch, InputStatus, PlayerHandle, RollbackError, RollbackEvent, RollbackSession,
    SessionBuilder, SessionState,
};

fn peer(num_players: usize, local: usize) -> RollbackSession<GridConfig> {
    SessionBuilder::<GridConfig>::new()
        .with_num_players(num_players)
        .unwrap()
        .with_local_player(PlayerHandle::new(local))
        .unwrap()
        .start_session(GridState::new(num_players), grid_tick)
        .unwrap()
}

/// Runs `frames` frames on every peer. After frame `f` the relay publishes the batch
/// ending at `f - latency` to each peer unless `dropped(f, peer)` says it is lost.
fn run(
    peers: &mut [RollbackSession<GridConfig>],
    relay: &ScriptedRelay,
    frames: i32,
    latency: i32,
    dropped: impl Fn(i32, usize) -> bool,
) -> Result<(), RollbackError> {
    for frame in 1..=frames {
        for (index, session) in peers.iter_mut().enumerate() {
            let local = session.local_player().as_usize();
            let advanced = session.advance_frame(scripted_move(local, frame))?;
            assert_eq!(advanced, Frame::new(frame), "peer {index}");
        }
        let sync_frame = frame - latency;
        if sync_frame < 1 {
            continue;
        }
        let message = relay.message(sync_frame);
        for (index, session) in peers.iter_mut().enumerate() {
            if !dropped(frame, index) {
                session.receive_message(&message)?;
            }
        }
    }
    Ok(())
}

#[test]
fn peers_converge_despite_latency_and_loss() {
    let players = 3;
    let relay = ScriptedRelay {
        num_players: players,
        window: 5,
    };
    let mut peers: Vec<_> = (0..players).map(|local| peer(players, local)).collect();

    run(&mut peers, &relay, 90, 3, |frame, index| (frame + index as i32) % 4 == 0).unwrap();

    let truth = ground_truth(players, 90);
    let flush = relay.message(90);
    for session in &mut peers {
        assert!(session.frames_ahead() >= 3);
        session.receive_message(&flush).unwrap();
        session.poll_remote_batches().unwrap();
        assert_eq!(session.confirmed_frame(), Frame::new(90));
        assert_eq!(session.frames_ahead(), 0);
        assert_eq!(*session.current_state(), truth);
    }

    let checksums: Vec<_> = peers
        .iter()
        .map(|session| session.checksum(Frame::new(90)).unwrap())
        .collect();
    assert!(checksums.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(checksums[0], compute_checksum(&truth).unwrap());
}

#[test]
fn every_record_holds_the_state_of_its_inputs() {
    let relay = ScriptedRelay {
        num_players: 2,
        window: 4,
    };
    let mut peers = vec![peer(2, 1)];
    run(&mut peers, &relay, 40, 2, |frame, _| frame % 3 == 0).unwrap();

    let session = &peers[0];
    for frame in 1..=40 {
        let previous = session.record(Frame::new(frame - 1)).unwrap();
        let record = session.record(Frame::new(frame)).unwrap();
        assert_eq!(
            *record.state(),
            grid_tick(previous.state(), record.inputs()),
            "frame {frame}"
        );
    }
}

#[test]
fn too_much_loss_for_the_window_is_a_desync() {
    let relay = ScriptedRelay {
        num_players: 2,
        window: 1,
    };
    let mut peers = vec![peer(2, 0)];
    let result = run(&mut peers, &relay, 10, 0, |frame, _| frame == 5);

    let expected = RollbackError::Desync {
        first_missing: Frame::new(5),
        last_missing: Frame::new(5),
        sync_frame: Frame::new(6),
    };
    assert_eq!(result, Err(expected.clone()));

    let session = &mut peers[0];
    assert_eq!(
        session.state(),
        SessionState::Desynchronized {
            first_missing: Frame::new(5),
            last_missing: Frame::new(5),
        }
    );
    // latched: even an input that needs no network is refused
    assert_eq!(session.speculate_tick(Move::Up), Err(expected));
    assert!(session.events().any(|event| event
        == RollbackEvent::Desynchronized {
            first_missing: Frame::new(5),
            last_missing: Frame::new(5),
        }));
}

#[test]
fn reordered_batches_are_stale_not_fatal() {
    let relay = ScriptedRelay {
        num_players: 2,
        window: 3,
    };
    let mut session = peer(2, 0);
    for frame in 1..=6 {
        session.speculate_tick(scripted_move(0, frame)).unwrap();
    }
    session.queue_batch(relay.batch(3));
    session.queue_batch(relay.batch(6));
    session.queue_batch(relay.batch(4));
    assert_eq!(session.poll_remote_batches().unwrap(), 3);

    assert_eq!(session.confirmed_frame(), Frame::new(6));
    assert_eq!(*session.current_state(), ground_truth(2, 6));
    assert!(session.events().any(|event| matches!(
        event,
        RollbackEvent::StaleBatch { sync_frame, last_frame_synced }
            if sync_frame == Frame::new(4) && last_frame_synced == Frame::new(6)
    )));
}

#[test]
fn duplicate_batches_change_nothing() {
    let relay = ScriptedRelay {
        num_players: 2,
        window: 5,
    };
    let mut session = peer(2, 0);
    for frame in 1..=8 {
        session.speculate_tick(scripted_move(0, frame)).unwrap();
    }
    let batch = relay.batch(5);
    session.sync(&batch).unwrap();
    let state = session.current_state().clone();
    let _ = session.events().count();

    let outcome = session.sync(&batch).unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.rollback_frame, None);
    assert_eq!(report.frames_resimulated, 0);
    assert_eq!(*session.current_state(), state);
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![RollbackEvent::Confirmed {
            frame: Frame::new(5)
        }]
    );
}

#[test]
fn local_input_past_the_batch_survives_rollback() {
    let mut session = peer(2, 1);
    for frame in 1..=5 {
        session.speculate_tick(scripted_move(1, frame)).unwrap();
    }
    // remote player moved differently than predicted on frame 2
    let batch = InputBatch::from_frames(
        Frame::new(2),
        vec![scripted_frame(2, 1), vec![Move::Left, scripted_move(1, 2)]],
    );
    let report = *session.sync(&batch).unwrap().report().unwrap();
    assert_eq!(report.rollback_frame, Some(Frame::new(1)));
    assert_eq!(report.frames_resimulated, 5);

    for frame in 3..=5 {
        let inputs = session.record(Frame::new(frame)).unwrap().inputs();
        let local = inputs.slot(PlayerHandle::new(1)).unwrap();
        assert_eq!(local.status, InputStatus::Confirmed);
        assert_eq!(local.input, scripted_move(1, frame));
        let remote = inputs.slot(PlayerHandle::new(0)).unwrap();
        assert_eq!(remote.status, InputStatus::Predicted);
        assert_eq!(remote.input, Move::Left);
    }
    assert!(session.events().any(|event| event
        == RollbackEvent::Rollback {
            from: Frame::new(1),
            to: Frame::new(5)
        }));
}

#[test]
fn peer_behind_the_batch_catches_up() {
    let relay = ScriptedRelay {
        num_players: 2,
        window: 8,
    };
    let mut session = peer(2, 0);
    session.speculate_tick(scripted_move(0, 1)).unwrap();
    let report = *session.sync(&relay.batch(6)).unwrap().report().unwrap();
    assert_eq!(report.frames_appended, 5);
    assert_eq!(session.current_frame(), Frame::new(6));
    assert_eq!(*session.current_state(), ground_truth(2, 6));
}

#[test]
fn conflicting_confirmed_input_is_reported_and_ignored() {
    let observer = Arc::new(CollectingObserver::new());
    let mut session = SessionBuilder::<GridConfig>::new()
        .with_violation_observer(observer.clone())
        .start_session(GridState::new(2), grid_tick)
        .unwrap();
    let relay = ScriptedRelay {
        num_players: 2,
        window: 3,
    };
    session.sync(&relay.batch(3)).unwrap();
    let before = session.current_state().clone();

    let mut frames: Vec<Vec<Move>> = (2..=4).map(|frame| scripted_frame(2, frame)).collect();
    frames[0][1] = Move::Sleep;
    frames[0][0] = Move::Sleep;
    if frames[0] == scripted_frame(2, 2) {
        frames[0][0] = Move::Up;
    }
    session
        .sync(&InputBatch::from_frames(Frame::new(4), frames))
        .unwrap();

    assert!(observer.has_violation(ViolationKind::Resync));
    assert_eq!(
        session.record(Frame::new(3)).unwrap().state(),
        &before,
        "confirmed frames never change"
    );
    assert_eq!(*session.current_state(), ground_truth(2, 4));
}

#[test]
fn outbound_batches_feed_a_fresh_peer() {
    let relay = ScriptedRelay {
        num_players: 2,
        window: 6,
    };
    let mut host = peer(2, 0);
    host.sync(&relay.batch(6)).unwrap();

    let mut late_joiner = peer(2, 1);
    let outbound = host.confirmed_batch(16).unwrap();
    assert_eq!(outbound.batch_size(), 6);
    late_joiner
        .receive_message(&outbound.encode().unwrap())
        .unwrap();
    late_joiner.poll_remote_batches().unwrap();
    assert_eq!(late_joiner.current_state(), host.current_state());
}
