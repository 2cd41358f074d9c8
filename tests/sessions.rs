//! Session integration tests.
//!
//! - Rollback sessions driven through a scripted relay (latency, loss, reordering)
//! - Sync test sessions with deterministic and non-deterministic tick functions

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Session test modules
mod sessions {
    pub mod rollback;
    pub mod synctest;
}
