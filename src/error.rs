use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// Result alias used throughout the crate.
pub type RollbackResult<T> = Result<T, RollbackError>;

/// This enum contains all errors this library can return.
///
/// # Severity
///
/// - [`OutOfSequence`](Self::OutOfSequence) and [`InvalidFrame`](Self::InvalidFrame) are
///   local invariant violations: the caller drove the history out of order. They are not
///   recoverable and the session should be aborted with a diagnostic.
/// - [`Desync`](Self::Desync) means the network delivered a permanent gap in the
///   authoritative input stream. The session must be torn down and restarted from a fresh
///   agreed initial state.
/// - A misprediction is never an error; it is handled by rollback and replay.
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum RollbackError {
    /// A frame record was appended out of lockstep (a frame number would have been skipped
    /// or repeated).
    OutOfSequence {
        /// The only frame number that could have been appended.
        expected: Frame,
        /// The frame number that was offered.
        actual: Frame,
    },
    /// An invalid frame number was provided.
    InvalidFrame {
        /// The frame that was invalid.
        frame: Frame,
        /// A description of why the frame was invalid.
        reason: String,
    },
    /// Authoritative input for a range of frames can never be received: the batch starts
    /// beyond the frame after the synchronization cursor.
    Desync {
        /// First frame of the missing range.
        first_missing: Frame,
        /// Last frame of the missing range.
        last_missing: Frame,
        /// The last frame of the batch that exposed the gap.
        sync_frame: Frame,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// An invalid player handle was provided.
    InvalidPlayerHandle {
        /// The player handle that was invalid.
        handle: PlayerHandle,
        /// The number of players in the session.
        num_players: usize,
    },
    /// In a [`SyncTestSession`], re-simulated frames produced different checksums than the
    /// first simulation, so the tick function is not deterministic.
    ///
    /// [`SyncTestSession`]: crate::SyncTestSession
    MismatchedChecksum {
        /// The frame at which the mismatch was detected.
        current_frame: Frame,
        /// The frames with mismatched checksums (one or more).
        mismatched_frames: Vec<Frame>,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl RollbackError {
    /// Returns `true` for errors that leave the history untrustworthy, so the owner should
    /// rebuild the session from a fresh agreed state.
    ///
    /// Only [`RollbackError::Desync`] is caused by the network, and it is the only one a
    /// [`RollbackSession`](crate::RollbackSession) latches. The others come from calling the
    /// history or sync layer out of order and are returned to the caller as they are.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Desync { .. }
                | Self::OutOfSequence { .. }
                | Self::InvalidFrame { .. }
                | Self::InternalError { .. }
        )
    }
}

impl Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackError::OutOfSequence { expected, actual } => {
                write!(
                    f,
                    "Frame {} appended out of sequence, expected frame {}",
                    actual, expected
                )
            },
            RollbackError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            },
            RollbackError::Desync {
                first_missing,
                last_missing,
                sync_frame,
            } => {
                write!(
                    f,
                    "Desynchronized: batch ending at frame {} leaves frames {} to {} permanently unconfirmed",
                    sync_frame, first_missing, last_missing
                )
            },
            RollbackError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            RollbackError::InvalidPlayerHandle {
                handle,
                num_players,
            } => {
                write!(
                    f,
                    "Invalid player handle {}: session has {} players",
                    handle, num_players
                )
            },
            RollbackError::MismatchedChecksum {
                current_frame,
                mismatched_frames,
            } => {
                write!(
                    f,
                    "Detected checksum mismatch during re-simulation on frame {}, mismatched frames: {:?}",
                    current_frame, mismatched_frames
                )
            },
            RollbackError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            },
            RollbackError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
        }
    }
}

impl Error for RollbackError {}

/// Structured reasons for [`RollbackError::InvalidRequest`].
///
/// Builders and batch validation construct these; they convert into the flat
/// `InvalidRequest { info }` variant so callers only match one shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InvalidRequestKind {
    /// A session needs at least one player.
    ZeroPlayers,
    /// The local player handle does not address a slot of the session.
    InvalidLocalPlayerHandle {
        /// The offending handle.
        handle: PlayerHandle,
        /// The number of players in the session.
        num_players: usize,
    },
    /// An input batch must cover at least one frame.
    EmptyBatch,
    /// The stated batch size disagrees with the number of input sets carried.
    BatchSizeMismatch {
        /// The batch size stated by the sender.
        batch_size: usize,
        /// The number of input sets actually carried.
        carried: usize,
    },
    /// The batch covers more frames than the session accepts.
    BatchTooLarge {
        /// The batch size stated by the sender.
        batch_size: usize,
        /// The configured maximum.
        max_batch_size: usize,
    },
    /// The batch would start before frame 0.
    BatchStartsBeforeFrameZero {
        /// The last frame of the batch.
        sync_frame: Frame,
        /// The stated batch size.
        batch_size: usize,
    },
    /// An input set does not carry exactly one input per player.
    WrongInputCount {
        /// The frame whose input set is malformed.
        frame: Frame,
        /// The number of inputs carried.
        actual: usize,
        /// The number of players in the session.
        expected: usize,
    },
    /// A sync test needs one input per player for every frame.
    MissingLocalInput {
        /// The number of inputs supplied.
        actual: usize,
        /// The number of players in the session.
        expected: usize,
    },
    /// A configuration value must be strictly positive.
    ZeroValue {
        /// The name of the setting.
        setting: &'static str,
    },
}

impl Display for InvalidRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroPlayers => write!(f, "number of players must be greater than 0"),
            Self::InvalidLocalPlayerHandle {
                handle,
                num_players,
            } => write!(
                f,
                "local player handle {} must be less than the number of players ({})",
                handle, num_players
            ),
            Self::EmptyBatch => write!(f, "input batch must cover at least one frame"),
            Self::BatchSizeMismatch {
                batch_size,
                carried,
            } => write!(
                f,
                "batch size {} does not match the {} input sets carried",
                batch_size, carried
            ),
            Self::BatchTooLarge {
                batch_size,
                max_batch_size,
            } => write!(
                f,
                "batch size {} exceeds the maximum of {}",
                batch_size, max_batch_size
            ),
            Self::BatchStartsBeforeFrameZero {
                sync_frame,
                batch_size,
            } => write!(
                f,
                "batch of {} frames ending at frame {} would start before frame 0",
                batch_size, sync_frame
            ),
            Self::WrongInputCount {
                frame,
                actual,
                expected,
            } => write!(
                f,
                "input set for frame {} carries {} inputs, expected {}",
                frame, actual, expected
            ),
            Self::MissingLocalInput { actual, expected } => write!(
                f,
                "sync test received {} inputs, expected one per player ({})",
                actual, expected
            ),
            Self::ZeroValue { setting } => write!(f, "{} must be greater than 0", setting),
        }
    }
}

impl From<InvalidRequestKind> for RollbackError {
    fn from(kind: InvalidRequestKind) -> Self {
        RollbackError::InvalidRequest {
            info: kind.to_string(),
        }
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
    use super::*;

    #[test]
    fn desync_display_names_missing_range() {
        let err = RollbackError::Desync {
            first_missing: Frame::new(4),
            last_missing: Frame::new(5),
            sync_frame: Frame::new(9),
        };
        let msg = err.to_string();
        assert!(msg.contains("frames 4 to 5"), "{msg}");
        assert!(msg.contains("frame 9"), "{msg}");
    }

    #[test]
    fn invalid_request_kind_converts_to_flat_variant() {
        let err: RollbackError = InvalidRequestKind::BatchSizeMismatch {
            batch_size: 3,
            carried: 2,
        }
        .into();
        match err {
            RollbackError::InvalidRequest { info } => {
                assert!(info.contains("batch size 3"));
                assert!(info.contains("2 input sets"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn fatal_classification() {
        assert!(RollbackError::Desync {
            first_missing: Frame::new(1),
            last_missing: Frame::new(1),
            sync_frame: Frame::new(3),
        }
        .is_fatal());
        assert!(RollbackError::OutOfSequence {
            expected: Frame::new(2),
            actual: Frame::new(3),
        }
        .is_fatal());
        assert!(!RollbackError::from(InvalidRequestKind::EmptyBatch).is_fatal());
    }
}
