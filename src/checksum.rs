//! State checksums for comparing simulations.
//!
//! A checksum is the FNV-1a hash of the state's bincode encoding, using the same
//! fixed-width configuration as the wire codec. Two states with equal checksums are
//! treated as identical by [`SyncTestSession`](crate::SyncTestSession) and by peers
//! exchanging [`RollbackSession::checksum`](crate::RollbackSession::checksum) values.
//!
//! ```
//! use lockstep_rollback::checksum::compute_checksum;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Arena {
//!     tick: u32,
//!     positions: [(i16, i16); 2],
//! }
//!
//! let arena = Arena { tick: 12, positions: [(0, 1), (4, -2)] };
//! assert_eq!(compute_checksum(&arena)?, compute_checksum(&arena)?);
//! # Ok::<(), lockstep_rollback::RollbackError>(())
//! ```
//!
//! Floating point fields hash their bit patterns, so `0.0` and `-0.0` differ.

use serde::Serialize;

use crate::hash::fnv1a_bytes;
use crate::network::codec::{encode, CodecError, CodecOperation};
use crate::RollbackResult;

/// Checksums a serializable state.
///
/// # Errors
///
/// [`RollbackError::SerializationError`](crate::RollbackError::SerializationError) if the
/// state cannot be encoded.
pub fn compute_checksum<S: Serialize + ?Sized>(state: &S) -> RollbackResult<u64> {
    let bytes = encode(&state).map_err(|err| match err {
        CodecError::EncodeError { message, .. } => {
            CodecError::encode(format!("checksum: {message}"), CodecOperation::Encode)
        },
        other => other,
    })?;
    Ok(fnv1a_bytes(&bytes))
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
    use crate::RollbackError;
    use serde::Serializer;

    #[derive(Serialize)]
    struct Grid {
        cells: Vec<u8>,
        tick: u32,
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("opaque handle"))
        }
    }

    #[test]
    fn equal_states_share_a_checksum() {
        let a = Grid {
            cells: vec![0, 1, 2],
            tick: 9,
        };
        let b = Grid {
            cells: vec![0, 1, 2],
            tick: 9,
        };
        assert_eq!(compute_checksum(&a).unwrap(), compute_checksum(&b).unwrap());
    }

    #[test]
    fn one_cell_changes_the_checksum() {
        let a = Grid {
            cells: vec![0, 1, 2],
            tick: 9,
        };
        let b = Grid {
            cells: vec![0, 1, 3],
            tick: 9,
        };
        assert_ne!(compute_checksum(&a).unwrap(), compute_checksum(&b).unwrap());
    }

    #[test]
    fn checksum_is_hash_of_codec_bytes() {
        let bytes = encode(&42u64).unwrap();
        assert_eq!(compute_checksum(&42u64).unwrap(), fnv1a_bytes(&bytes));
    }

    #[test]
    fn serialization_failure_is_reported() {
        match compute_checksum(&Unserializable) {
            Err(RollbackError::SerializationError { context }) => {
                assert!(context.contains("opaque handle"), "{context}");
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
