//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: a grid game with enum inputs and a scripted relay that turns every
//!   player's input into overlapping authoritative batches

pub mod stubs;
