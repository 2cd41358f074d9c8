use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::RollbackEvent;

/// An opaque iterator that drains queued [`RollbackEvent`]s from a session.
///
/// Wraps the internal queue drain so `std::collections::vec_deque::Drain` is not part of
/// the public API. Obtain one from [`RollbackSession::events()`]. Events not consumed
/// before the drain is dropped are discarded.
///
/// # Examples
///
/// ```ignore
/// for event in session.events() {
///     match event {
///         RollbackEvent::Rollback { from, to } => println!("replayed {from}..={to}"),
///         _ => {},
///     }
/// }
/// ```
///
/// [`RollbackSession::events()`]: crate::RollbackSession::events
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: Drain<'a, RollbackEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(inner: Drain<'a, RollbackEvent>) -> Self {
        Self { inner }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = RollbackEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::iter_with_drain
)]
mod tests {
    use super::*;
    use crate::Frame;
    use std::collections::VecDeque;

    fn queue() -> VecDeque<RollbackEvent> {
        (1..=3)
            .map(|f| RollbackEvent::Confirmed {
                frame: Frame::new(f),
            })
            .collect()
    }

    #[test]
    fn drains_in_order_and_empties_queue() {
        let mut events = queue();
        let drained: Vec<_> = EventDrain::from_drain(events.drain(..)).collect();
        assert_eq!(drained.len(), 3);
        assert_eq!(
            drained[0],
            RollbackEvent::Confirmed {
                frame: Frame::new(1)
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn exact_size_and_reverse() {
        let mut events = queue();
        let mut drain = EventDrain::from_drain(events.drain(..));
        assert_eq!(drain.len(), 3);
        assert_eq!(
            drain.next_back(),
            Some(RollbackEvent::Confirmed {
                frame: Frame::new(3)
            })
        );
        assert_eq!(drain.len(), 2);
        assert!(format!("{drain:?}").contains("remaining: 2"));
    }

    #[test]
    fn dropping_drain_discards_rest() {
        let mut events = queue();
        {
            let mut drain = EventDrain::from_drain(events.drain(..));
            let _ = drain.next();
        }
        assert!(events.is_empty());
    }
}
