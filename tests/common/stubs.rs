//! A small grid game used as the deterministic simulation in integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use lockstep_rollback::{Config, Frame, InputBatch, InputSet};
use serde::{Deserialize, Serialize};

pub const GRID_SIZE: i32 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Move {
    #[default]
    Sleep,
    Up,
    Down,
    Left,
    Right,
}

impl Move {
    fn delta(self) -> (i32, i32) {
        match self {
            Move::Sleep => (0, 0),
            Move::Up => (0, -1),
            Move::Down => (0, 1),
            Move::Left => (-1, 0),
            Move::Right => (1, 0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridState {
    pub positions: Vec<(i32, i32)>,
    /// Incremented every time two players share a cell, so the order of moves matters.
    pub collisions: u32,
    pub ticks: u32,
}

impl GridState {
    pub fn new(num_players: usize) -> Self {
        let positions = (0..num_players as i32)
            .map(|p| (p * 3 % GRID_SIZE, p * 5 % GRID_SIZE))
            .collect();
        Self {
            positions,
            collisions: 0,
            ticks: 0,
        }
    }
}

pub struct GridConfig;

impl Config for GridConfig {
    type Input = Move;
    type State = GridState;
}

pub fn grid_tick(state: &GridState, inputs: &InputSet<Move>) -> GridState {
    let mut next = state.clone();
    for (position, step) in next.positions.iter_mut().zip(inputs.inputs()) {
        let (dx, dy) = step.delta();
        position.0 = (position.0 + dx).rem_euclid(GRID_SIZE);
        position.1 = (position.1 + dy).rem_euclid(GRID_SIZE);
    }
    for (i, a) in next.positions.iter().enumerate() {
        if next.positions[i + 1..].contains(a) {
            next.collisions += 1;
        }
    }
    next.ticks += 1;
    next
}

/// The input player `player` gives on `frame`. Every peer and the relay agree on it.
pub fn scripted_move(player: usize, frame: i32) -> Move {
    match (player as i32 * 7 + frame * 3 + frame / 5) % 5 {
        0 => Move::Sleep,
        1 => Move::Up,
        2 => Move::Down,
        3 => Move::Left,
        _ => Move::Right,
    }
}

pub fn scripted_frame(num_players: usize, frame: i32) -> Vec<Move> {
    (0..num_players).map(|p| scripted_move(p, frame)).collect()
}

/// State after `frames` frames of scripted input, computed without any rollback.
pub fn ground_truth(num_players: usize, frames: i32) -> GridState {
    (1..=frames).fold(GridState::new(num_players), |state, frame| {
        grid_tick(
            &state,
            &InputSet::confirmed(scripted_frame(num_players, frame)),
        )
    })
}

/// Stands in for the transport: knows every player's scripted input and publishes
/// overlapping batches of the newest `window` frames up to `sync_frame`.
pub struct ScriptedRelay {
    pub num_players: usize,
    pub window: i32,
}

impl ScriptedRelay {
    pub fn batch(&self, sync_frame: i32) -> InputBatch<Move> {
        let first = (sync_frame - self.window + 1).max(1);
        let frames = (first..=sync_frame)
            .map(|frame| scripted_frame(self.num_players, frame))
            .collect();
        InputBatch::from_frames(Frame::new(sync_frame), frames)
    }

    pub fn message(&self, sync_frame: i32) -> Vec<u8> {
        self.batch(sync_frame).encode().unwrap()
    }
}
