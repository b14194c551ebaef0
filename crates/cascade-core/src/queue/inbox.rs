//! Ordered batch of pending input items for one lifecycle call.

use std::collections::VecDeque;

use crate::item::Item;

use super::conduit::ConduitReceiver;

/// The inbox handed to [`process`](crate::processor::Processor::process).
///
/// Holds a finite, ordered batch of items from one inbound edge. The unit
/// removes each item with [`poll`](Inbox::poll) only once it is done with
/// it; anything left behind is redelivered on the next call — the inbox is
/// never auto-cleared by the engine.
#[derive(Debug, Default)]
pub struct Inbox {
    items: VecDeque<Item>,
}

impl Inbox {
    /// Creates an empty inbox.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Returns the oldest pending item without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&Item> {
        self.items.front()
    }

    /// Removes and returns the oldest pending item.
    ///
    /// Call this only after the item has been fully handled; removal is
    /// the unit's acknowledgement of consumption.
    pub fn poll(&mut self) -> Option<Item> {
        self.items.pop_front()
    }

    /// Returns the number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the inbox has no pending items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates the pending items in delivery order without consuming.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    /// Refills from an edge conduit, up to `limit` items.
    ///
    /// Returns how many items were moved in.
    pub(crate) fn refill_from(&mut self, receiver: &ConduitReceiver<Item>, limit: usize) -> usize {
        receiver.drain_into(&mut self.items, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::conduit::conduit;

    #[test]
    fn test_poll_in_delivery_order() {
        let (tx, rx) = conduit(8);
        for i in 0..4u32 {
            tx.try_push(Item::new(i)).unwrap();
        }
        let mut inbox = Inbox::new();
        assert_eq!(inbox.refill_from(&rx, 16), 4);

        for expected in 0..4u32 {
            assert_eq!(inbox.peek().unwrap().downcast_ref::<u32>(), Some(&expected));
            assert_eq!(inbox.poll().unwrap().downcast_ref::<u32>(), Some(&expected));
        }
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_unconsumed_items_remain() {
        let (tx, rx) = conduit(8);
        for i in 0..3u32 {
            tx.try_push(Item::new(i)).unwrap();
        }
        let mut inbox = Inbox::new();
        inbox.refill_from(&rx, 16);

        // Consume only the first item; the rest must stay put.
        inbox.poll();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.peek().unwrap().downcast_ref::<u32>(), Some(&1));
    }

    #[test]
    fn test_refill_respects_limit() {
        let (tx, rx) = conduit(16);
        for i in 0..10u32 {
            tx.try_push(Item::new(i)).unwrap();
        }
        let mut inbox = Inbox::new();
        assert_eq!(inbox.refill_from(&rx, 4), 4);
        assert_eq!(inbox.len(), 4);
        assert_eq!(rx.len(), 6);
    }
}
