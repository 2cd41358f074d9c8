//! # Relay Simulation Example
//!
//! Two peers play a tiny tug-of-war. Neither waits for the other: each frame they tick
//! with their own input and a predicted input for the opponent. A relay collects both
//! players' real inputs and broadcasts overlapping batches with a few frames of latency,
//! dropping some messages on the way. The peers roll back whenever a batch contradicts
//! their predictions and still end on the same state.
//!
//! Run with: `cargo run --example relay_sim`
//! (set `RUST_LOG`-style verbosity by editing the max level below)

// Allow example-specific patterns
#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::VecDeque;

use lockstep_rollback::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const FRAMES: i32 = 120;
const LATENCY: usize = 4;
const WINDOW: i32 = 6;

#[derive(Copy, Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
enum Pull {
    #[default]
    Rest,
    Pull,
    Heave,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct Rope {
    /// Negative means player 0 is winning.
    marker: i32,
    fatigue: [u32; 2],
}

struct TugOfWar;

impl Config for TugOfWar {
    type Input = Pull;
    type State = Rope;
}

fn tick(rope: &Rope, pulls: &InputSet<Pull>) -> Rope {
    let mut next = rope.clone();
    for (player, pull) in pulls.inputs().enumerate() {
        let strength = match pull {
            Pull::Rest => {
                next.fatigue[player] = next.fatigue[player].saturating_sub(2);
                0
            },
            Pull::Pull => 2,
            Pull::Heave => 4,
        };
        let effective = (strength - (next.fatigue[player] / 8) as i32).max(0);
        next.fatigue[player] += strength as u32;
        next.marker += if player == 0 { -effective } else { effective };
    }
    next
}

fn script(player: usize, frame: i32) -> Pull {
    match (frame / (3 + player as i32 * 2) + player as i32) % 3 {
        0 => Pull::Rest,
        1 => Pull::Pull,
        _ => Pull::Heave,
    }
}

fn main() -> Result<(), RollbackError> {
    // configure logging: output library and example logs to standard out
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )
    .expect("setting up tracing subscriber failed");

    let initial = Rope {
        marker: 0,
        fatigue: [0, 0],
    };
    let mut peers = Vec::new();
    for local in 0..2 {
        peers.push(
            SessionBuilder::<TugOfWar>::new()
                .with_local_player(PlayerHandle::new(local))?
                .start_session(initial.clone(), tick)?,
        );
    }

    // the relay knows every real input; messages spend LATENCY frames in flight
    let mut in_flight: VecDeque<Vec<u8>> = VecDeque::new();
    let mut rollbacks = [0usize; 2];

    for frame in 1..=FRAMES {
        let arriving = if in_flight.len() >= LATENCY {
            in_flight.pop_front()
        } else {
            None
        };

        for (index, peer) in peers.iter_mut().enumerate() {
            if let Some(message) = &arriving {
                // every 7th message to peer 1 is lost
                if !(index == 1 && frame % 7 == 0) {
                    peer.receive_message(message)?;
                }
            }
            peer.advance_frame(script(index, frame))?;
            for event in peer.events() {
                if let RollbackEvent::Rollback { from, to } = event {
                    rollbacks[index] += 1;
                    info!(peer = index, %from, %to, "rolled back");
                }
            }
        }

        let first = (frame - WINDOW + 1).max(1);
        let frames: Vec<Vec<Pull>> = (first..=frame)
            .map(|f| vec![script(0, f), script(1, f)])
            .collect();
        in_flight.push_back(InputBatch::from_frames(Frame::new(frame), frames).encode()?);
    }

    // deliver whatever is still in flight
    for message in in_flight {
        for peer in &mut peers {
            peer.receive_message(&message)?;
            peer.poll_remote_batches()?;
        }
    }

    let states: Vec<_> = peers.iter().map(|peer| peer.current_state().clone()).collect();
    info!(
        final_frame = FRAMES,
        marker = states[0].marker,
        rollbacks_peer0 = rollbacks[0],
        rollbacks_peer1 = rollbacks[1],
        "match over"
    );
    if states[0] == states[1] {
        info!(
            checksum = peers[0].checksum(Frame::new(FRAMES))?,
            "peers agree"
        );
    } else {
        warn!(?states, "peers diverged");
    }
    Ok(())
}
