//! Verification integration tests.
//!
//! - Property tests: history contiguity, cursor monotonicity, idempotent redundant
//!   batches, rollback equals a from-scratch run
//! - Invariant tests: `InvariantChecker` holds across speculation and resync

// Verification test modules
mod verification {
    pub mod invariants;
    pub mod property;
}
