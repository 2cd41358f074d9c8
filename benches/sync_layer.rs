//! Benchmarks for SyncLayer operations
//!
//! Run with: cargo bench --bench sync_layer
//!
//! Speculation runs every frame; a resync with rollback replays up to the whole
//! speculation depth, so its cost grows with how far the peer runs ahead.

// Allow benchmark-specific patterns
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use lockstep_rollback::__internal::SyncLayer;
use lockstep_rollback::{Config, Frame, InputBatch, InputSet, PlayerHandle};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::sync::Arc;

/// Simple test input type for benchmarking
#[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
struct BenchInput {
    buttons: u8,
    stick_x: i8,
    stick_y: i8,
}

/// A state large enough that cloning it per frame shows up.
#[derive(Clone, Debug, Default)]
struct BenchState {
    positions: [(i32, i32); 4],
    scratch: [u64; 32],
}

struct BenchConfig;

impl Config for BenchConfig {
    type Input = BenchInput;
    type State = BenchState;
}

fn tick(state: &BenchState, inputs: &InputSet<BenchInput>) -> BenchState {
    let mut next = state.clone();
    for (position, input) in next.positions.iter_mut().zip(inputs.inputs()) {
        position.0 += i32::from(input.stick_x);
        position.1 += i32::from(input.stick_y);
    }
    for (i, cell) in next.scratch.iter_mut().enumerate() {
        *cell = cell.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(i as u64);
    }
    next
}

fn layer(num_players: usize) -> SyncLayer<BenchConfig> {
    SyncLayer::new(
        BenchState::default(),
        num_players,
        PlayerHandle::new(0),
        Arc::new(tick),
    )
}

fn remote_input(frame: i32) -> BenchInput {
    BenchInput {
        buttons: (frame % 7) as u8,
        stick_x: (frame % 3) as i8 - 1,
        stick_y: 1,
    }
}

fn bench_speculate(c: &mut Criterion) {
    let mut group = c.benchmark_group("SyncLayer/speculate_tick");
    for num_players in [2usize, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_players),
            &num_players,
            |b, &num_players| {
                b.iter_batched(
                    || layer(num_players),
                    |mut layer| {
                        for _ in 0..60 {
                            black_box(layer.speculate_tick(BenchInput::default()).unwrap());
                        }
                        layer
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("SyncLayer/sync_with_rollback");
    for depth in [2i32, 8, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let mut layer = layer(2);
                    for _ in 0..depth {
                        layer.speculate_tick(BenchInput::default()).unwrap();
                    }
                    let frames: Vec<Vec<BenchInput>> = (1..=depth)
                        .map(|frame| vec![BenchInput::default(), remote_input(frame)])
                        .collect();
                    (layer, frames)
                },
                |(mut layer, frames)| {
                    let outcome = layer
                        .sync(Frame::new(depth), frames.len(), &frames)
                        .unwrap();
                    black_box(outcome);
                    layer
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_batch_codec(c: &mut Criterion) {
    let frames: Vec<Vec<BenchInput>> = (1..=16)
        .map(|frame| vec![remote_input(frame), remote_input(frame + 1)])
        .collect();
    let batch = InputBatch::from_frames(Frame::new(16), frames);
    let bytes = batch.encode().unwrap();

    c.bench_function("InputBatch/encode_16x2", |b| {
        b.iter(|| black_box(batch.encode().unwrap()));
    });
    c.bench_function("InputBatch/decode_16x2", |b| {
        b.iter(|| black_box(InputBatch::<BenchInput>::decode(black_box(&bytes)).unwrap()));
    });
}

criterion_group!(benches, bench_speculate, bench_rollback, bench_batch_codec);
criterion_main!(benches);
