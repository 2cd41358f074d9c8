use serde::{Deserialize, Serialize};

use crate::error::{InvalidRequestKind, RollbackResult};
use crate::network::codec::{self, CodecError, CodecOperation};
use crate::{Frame, InputVec};

/// Authoritative inputs for a contiguous run of frames ending at `sync_frame`.
///
/// `inputs[n]` holds one input per player for frame `first_frame() + n`. Peers send
/// overlapping batches on purpose: a lost batch is covered as long as a later, wider one
/// arrives before the receiver's cursor would have to jump a frame.
///
/// # Examples
///
/// ```
/// use lockstep_rollback::{Frame, InputBatch};
///
/// let batch = InputBatch::from_frames(Frame::new(5), vec![vec![1u8, 2], vec![3, 4]]);
/// assert_eq!(batch.first_frame(), Frame::new(4));
/// assert_eq!(batch.batch_size(), 2);
///
/// let bytes = batch.encode()?;
/// assert_eq!(InputBatch::<u8>::decode(&bytes)?, batch);
/// # Ok::<(), lockstep_rollback::RollbackError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBatch<I> {
    sync_frame: Frame,
    batch_size: usize,
    inputs: Vec<InputVec<I>>,
}

impl<I> InputBatch<I> {
    /// Creates a batch from its raw parts. The parts are not checked against each other;
    /// see [`InputBatch::validate`].
    pub fn new(sync_frame: Frame, batch_size: usize, inputs: Vec<InputVec<I>>) -> Self {
        Self {
            sync_frame,
            batch_size,
            inputs,
        }
    }

    /// Creates a batch whose size is the number of frames given.
    pub fn from_frames<F>(sync_frame: Frame, frames: Vec<F>) -> Self
    where
        F: IntoIterator<Item = I>,
    {
        let inputs: Vec<InputVec<I>> = frames
            .into_iter()
            .map(|frame| frame.into_iter().collect())
            .collect();
        Self {
            sync_frame,
            batch_size: inputs.len(),
            inputs,
        }
    }

    /// The last frame covered by the batch.
    #[must_use]
    pub fn sync_frame(&self) -> Frame {
        self.sync_frame
    }

    /// The number of frames the sender claims the batch covers.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The first frame covered by the batch, `sync_frame - batch_size + 1`.
    #[must_use]
    pub fn first_frame(&self) -> Frame {
        let span = i32::try_from(self.batch_size).unwrap_or(i32::MAX);
        Frame::new(
            self.sync_frame
                .as_i32()
                .saturating_sub(span)
                .saturating_add(1),
        )
    }

    /// The per-frame input sets, oldest first.
    #[must_use]
    pub fn inputs(&self) -> &[InputVec<I>] {
        &self.inputs
    }

    /// The input set of `frame`, if the batch covers it.
    #[must_use]
    pub fn inputs_for(&self, frame: Frame) -> Option<&[I]> {
        // both frames may come off the wire, so the distance is taken in i64
        let offset = i64::from(frame.as_i32()) - i64::from(self.first_frame().as_i32());
        let offset = usize::try_from(offset).ok()?;
        self.inputs.get(offset).map(InputVec::as_slice)
    }

    /// Checks the batch shape against a session with `num_players` players that accepts
    /// batches of at most `max_batch_size` frames. Returns the first frame of the batch.
    ///
    /// # Errors
    ///
    /// [`RollbackError::InvalidRequest`](crate::RollbackError::InvalidRequest) if the batch is
    /// empty or too large, its size disagrees with its contents, it starts before frame 0 or
    /// an input set does not hold exactly one input per player.
    pub fn validate(&self, num_players: usize, max_batch_size: usize) -> RollbackResult<Frame> {
        check_batch_shape::<I, _>(
            self.sync_frame,
            self.batch_size,
            &self.inputs,
            num_players,
            max_batch_size,
        )
    }
}

/// Shape checks shared by [`InputBatch::validate`] and the sync layer, which also accepts
/// batches given as loose parts. Returns the first frame of the batch.
pub(crate) fn check_batch_shape<I, V>(
    sync_frame: Frame,
    batch_size: usize,
    inputs: &[V],
    num_players: usize,
    max_batch_size: usize,
) -> RollbackResult<Frame>
where
    V: AsRef<[I]>,
{
    if batch_size == 0 {
        return Err(InvalidRequestKind::EmptyBatch.into());
    }
    if inputs.len() != batch_size {
        return Err(InvalidRequestKind::BatchSizeMismatch {
            batch_size,
            carried: inputs.len(),
        }
        .into());
    }
    let too_large = InvalidRequestKind::BatchTooLarge {
        batch_size,
        max_batch_size,
    };
    if batch_size > max_batch_size {
        return Err(too_large.into());
    }
    let Ok(span) = i32::try_from(batch_size) else {
        return Err(too_large.into());
    };
    let first_frame = sync_frame.as_i32().checked_sub(span - 1).map(Frame::new);
    let first_frame = match first_frame {
        Some(first) if sync_frame.is_valid() && first.is_valid() => first,
        _ => {
            return Err(InvalidRequestKind::BatchStartsBeforeFrameZero {
                sync_frame,
                batch_size,
            }
            .into())
        },
    };
    for (offset, set) in inputs.iter().enumerate() {
        let actual = set.as_ref().len();
        if actual != num_players {
            return Err(InvalidRequestKind::WrongInputCount {
                frame: first_frame + offset as i32,
                actual,
                expected: num_players,
            }
            .into());
        }
    }
    Ok(first_frame)
}

impl<I: Serialize> InputBatch<I> {
    /// Encodes the batch for the transport.
    ///
    /// # Errors
    ///
    /// [`RollbackError::SerializationError`](crate::RollbackError::SerializationError) if an
    /// input fails to serialize.
    pub fn encode(&self) -> RollbackResult<Vec<u8>> {
        codec::encode(self).map_err(|err| match err {
            CodecError::EncodeError { message, .. } => {
                CodecError::encode(message, CodecOperation::EncodeBatch).into()
            },
            other => other.into(),
        })
    }
}

impl<I: serde::de::DeserializeOwned> InputBatch<I> {
    /// Decodes a batch received from the transport. The whole message must be consumed.
    ///
    /// Only the encoding is checked here; the shape is checked when the batch is applied.
    ///
    /// # Errors
    ///
    /// [`RollbackError::SerializationError`](crate::RollbackError::SerializationError) for
    /// truncated, corrupted or oversized messages.
    pub fn decode(bytes: &[u8]) -> RollbackResult<Self> {
        codec::decode_exact(bytes).map_err(|err| match err {
            CodecError::DecodeError { message, .. } => {
                CodecError::decode(message, CodecOperation::DecodeBatch).into()
            },
            other => other.into(),
        })
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
    use crate::RollbackError;

    #[test]
    fn first_frame_and_lookup() {
        let batch = InputBatch::from_frames(Frame::new(9), vec![vec![1u8], vec![2], vec![3]]);
        assert_eq!(batch.first_frame(), Frame::new(7));
        assert_eq!(batch.inputs_for(Frame::new(7)), Some(&[1u8][..]));
        assert_eq!(batch.inputs_for(Frame::new(9)), Some(&[3u8][..]));
        assert_eq!(batch.inputs_for(Frame::new(6)), None);
        assert_eq!(batch.inputs_for(Frame::new(10)), None);
    }

    #[test]
    fn validate_rejects_malformed_batches() {
        let ok = InputBatch::from_frames(Frame::new(2), vec![vec![1u8, 1], vec![2, 2]]);
        assert_eq!(ok.validate(2, 64), Ok(Frame::new(1)));
        assert!(ok.validate(3, 64).is_err());
        assert!(ok.validate(2, 1).is_err());

        let lying = InputBatch::new(Frame::new(2), 3, ok.inputs().to_vec());
        assert!(matches!(
            lying.validate(2, 64),
            Err(RollbackError::InvalidRequest { .. })
        ));

        let before_zero = InputBatch::from_frames(Frame::new(0), vec![vec![1u8], vec![1]]);
        assert!(before_zero.validate(1, 64).is_err());

        let empty: InputBatch<u8> = InputBatch::new(Frame::new(3), 0, Vec::new());
        assert!(empty.validate(1, 64).is_err());
    }

    #[test]
    fn hostile_frame_numbers_do_not_overflow() {
        let wire = InputBatch::from_frames(Frame::new(-10), vec![vec![1u8]])
            .encode()
            .unwrap();
        let batch = InputBatch::<u8>::decode(&wire).unwrap();
        assert_eq!(batch.inputs_for(Frame::new(i32::MAX)), None);
        assert_eq!(batch.inputs_for(Frame::new(-10)), Some(&[1u8][..]));

        let far_back = InputBatch::new(Frame::new(i32::MIN), 2, vec![smallvec::smallvec![1u8]; 2]);
        assert_eq!(far_back.inputs_for(Frame::new(i32::MAX)), None);
        assert!(matches!(
            far_back.validate(1, 64),
            Err(RollbackError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn decode_reports_truncated_message() {
        let batch = InputBatch::from_frames(Frame::new(4), vec![vec![1u16, 2], vec![3, 4]]);
        let bytes = batch.encode().unwrap();
        let err = InputBatch::<u16>::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        match err {
            RollbackError::SerializationError { context } => {
                assert!(context.contains("decoding input batch"), "{context}");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let batch = InputBatch::from_frames(Frame::new(1), vec![vec![5u8]]);
        let mut bytes = batch.encode().unwrap();
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            InputBatch::<u8>::decode(&bytes),
            Err(RollbackError::SerializationError { .. })
        ));
    }
}
