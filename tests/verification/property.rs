//! Property-based tests for the sync layer.
//!
//! A peer with one local and one remote player runs a random interleaving of local ticks
//! and authoritative batches (random lag, random overlap, repeated deliveries). The
//! remote player's real inputs are drawn up front, so every batch agrees with every other.
//!
//! # Properties
//!
//! - The history is contiguous: frame `k` lives at index `k` for `0..=highest`
//! - The sync cursor never decreases and never passes the newest frame
//! - Delivering the same batch twice changes nothing the second time
//! - Once everything is confirmed, the state equals a from-scratch run of the real inputs

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use lockstep_rollback::__internal::SyncLayer;
use lockstep_rollback::telemetry::InvariantChecker;
use lockstep_rollback::{Config, Frame, InputSet, PlayerHandle, SyncOutcome};
use proptest::prelude::*;

// ============================================================================
// Test Configuration
// ============================================================================

struct MixConfig;

impl Config for MixConfig {
    type Input = u8;
    type State = u64;
}

const MAX_FRAMES: usize = 64;

fn mix(state: &u64, inputs: &InputSet<u8>) -> u64 {
    inputs
        .inputs()
        .enumerate()
        .fold(state.wrapping_mul(31), |acc, (index, input)| {
            acc.wrapping_add((index as u64 + 7) * u64::from(input) + 1)
        })
}

#[derive(Debug, Clone)]
enum Op {
    Tick(u8),
    Deliver { lag: i32, overlap: i32 },
    Repeat,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u8>().prop_map(Op::Tick),
        2 => (0i32..5, 0i32..4).prop_map(|(lag, overlap)| Op::Deliver { lag, overlap }),
        1 => Just(Op::Repeat),
    ]
}

/// One peer plus the inputs the whole session really used.
struct Harness {
    layer: SyncLayer<MixConfig>,
    local: Vec<u8>,
    remote: Vec<u8>,
    last_batch: Option<(Frame, Vec<Vec<u8>>)>,
}

impl Harness {
    fn new(local_player: usize, remote: Vec<u8>) -> Self {
        Self {
            layer: SyncLayer::new(0, 2, PlayerHandle::new(local_player), Arc::new(mix)),
            local: Vec::new(),
            remote,
            last_batch: None,
        }
    }

    fn real_inputs(&self, frame: i32) -> Vec<u8> {
        let k = (frame - 1) as usize;
        let mut inputs = vec![self.remote[k]; 2];
        inputs[self.layer.local_player().as_usize()] = self.local[k];
        inputs
    }

    fn batch(&self, first: i32, sync_frame: i32) -> Vec<Vec<u8>> {
        (first..=sync_frame).map(|f| self.real_inputs(f)).collect()
    }

    fn deliver(&mut self, sync_frame: Frame, frames: Vec<Vec<u8>>) -> SyncOutcome {
        let outcome = self
            .layer
            .sync(sync_frame, frames.len(), &frames)
            .expect("gap-free batch must apply");
        self.last_batch = Some((sync_frame, frames));
        outcome
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Tick(input) => {
                if self.local.len() < MAX_FRAMES {
                    self.local.push(input);
                    self.layer.speculate_tick(input).unwrap();
                }
            },
            Op::Deliver { lag, overlap } => {
                let cursor = self.layer.last_frame_synced().as_i32();
                let highest = self.layer.current_frame().as_i32();
                let sync_frame = (highest - lag).max(cursor);
                if sync_frame < 1 {
                    return;
                }
                let first = (cursor + 1 - overlap).max(1).min(sync_frame);
                let frames = self.batch(first, sync_frame);
                self.deliver(Frame::new(sync_frame), frames);
            },
            Op::Repeat => {
                if let Some((sync_frame, frames)) = self.last_batch.clone() {
                    self.deliver(sync_frame, frames);
                }
            },
        }
    }

    fn confirm_everything(&mut self) {
        let highest = self.layer.current_frame().as_i32();
        if highest >= 1 {
            let cursor = self.layer.last_frame_synced().as_i32();
            let frames = self.batch(cursor.max(0) + 1, highest);
            if !frames.is_empty() {
                self.deliver(Frame::new(highest), frames);
            }
        }
    }

    fn from_scratch(&self) -> u64 {
        (1..=self.layer.current_frame().as_i32()).fold(0, |state, frame| {
            mix(&state, &InputSet::confirmed(self.real_inputs(frame)))
        })
    }
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..120)
}

fn remote_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), MAX_FRAMES)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Frame k is always stored at index k, with nothing missing or repeated.
    #[test]
    fn prop_history_is_contiguous(
        local_player in 0usize..2,
        remote in remote_strategy(),
        ops in ops_strategy(),
    ) {
        let mut harness = Harness::new(local_player, remote);
        for op in &ops {
            harness.apply(op);
            let history = harness.layer.history();
            prop_assert_eq!(history.len(), harness.layer.current_frame().as_i32() as usize + 1);
            for (index, record) in history.iter().enumerate() {
                prop_assert_eq!(record.frame(), Frame::new(index as i32));
            }
        }
    }

    /// The cursor only moves forward and never runs past the newest frame.
    #[test]
    fn prop_cursor_is_monotonic(
        local_player in 0usize..2,
        remote in remote_strategy(),
        ops in ops_strategy(),
    ) {
        let mut harness = Harness::new(local_player, remote);
        let mut previous = Frame::ZERO;
        for op in &ops {
            harness.apply(op);
            let cursor = harness.layer.last_frame_synced();
            prop_assert!(cursor >= previous, "cursor moved back: {} -> {}", previous, cursor);
            prop_assert!(cursor <= harness.layer.current_frame());
            prop_assert!(harness.layer.check_invariants().is_ok());
            previous = cursor;
        }
    }

    /// A batch delivered twice in a row is a no-op the second time.
    #[test]
    fn prop_redundant_batch_is_idempotent(
        local_player in 0usize..2,
        remote in remote_strategy(),
        ops in ops_strategy(),
    ) {
        let mut harness = Harness::new(local_player, remote);
        for op in &ops {
            harness.apply(op);
        }
        let Some((sync_frame, frames)) = harness.last_batch.clone() else {
            return Ok(());
        };
        let state = *harness.layer.current_state();
        let highest = harness.layer.current_frame();
        let outcome = harness.deliver(sync_frame, frames);
        match outcome {
            SyncOutcome::Applied(report) => {
                prop_assert_eq!(report.rollback_frame, None);
                prop_assert_eq!(report.frames_resimulated, 0);
                prop_assert_eq!(report.frames_appended, 0);
            },
            SyncOutcome::Stale { .. } => {},
        }
        prop_assert_eq!(*harness.layer.current_state(), state);
        prop_assert_eq!(harness.layer.current_frame(), highest);
    }

    /// However predictions went, the fully confirmed result is the from-scratch result.
    #[test]
    fn prop_rollback_matches_from_scratch(
        local_player in 0usize..2,
        remote in remote_strategy(),
        ops in ops_strategy(),
    ) {
        let mut harness = Harness::new(local_player, remote);
        for op in &ops {
            harness.apply(op);
        }
        harness.confirm_everything();
        prop_assert_eq!(harness.layer.frames_ahead(), 0);
        prop_assert_eq!(*harness.layer.current_state(), harness.from_scratch());
        for record in harness.layer.history().iter() {
            prop_assert!(!record.inputs().has_predictions());
        }
    }
}
