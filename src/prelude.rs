//! Convenient re-exports for common usage.
//!
//! ```rust
//! use lockstep_rollback::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Copy, Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
//! struct Pad {
//!     buttons: u8,
//! }
//!
//! struct Pong;
//!
//! impl Config for Pong {
//!     type Input = Pad;
//!     type State = [i32; 2];
//! }
//!
//! fn tick(paddles: &[i32; 2], pads: &InputSet<Pad>) -> [i32; 2] {
//!     let mut next = *paddles;
//!     for (paddle, pad) in next.iter_mut().zip(pads.inputs()) {
//!         *paddle += i32::from(pad.buttons & 1) - i32::from((pad.buttons >> 1) & 1);
//!     }
//!     next
//! }
//!
//! let mut session = SessionBuilder::<Pong>::new().start_session([0, 0], tick)?;
//! session.advance_frame(Pad { buttons: 1 })?;
//! for event in session.events() {
//!     if let RollbackEvent::Rollback { from, to } = event {
//!         println!("replayed {from}..={to}");
//!     }
//! }
//! # Ok::<(), RollbackError>(())
//! ```

pub use crate::{
    BlankPrediction, Config, EventDrain, Frame, FrameRecord, InputBatch, InputSet, InputSlot,
    InputStatus, PlayerHandle, PredictionStrategy, RepeatLastConfirmed, RollbackError,
    RollbackEvent, RollbackResult, RollbackSession, SessionBuilder, SessionState, Simulation,
    SyncOutcome, SyncReport, SyncTestSession, NULL_FRAME,
};
