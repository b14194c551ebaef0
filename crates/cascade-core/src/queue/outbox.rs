//! Bounded emission sink: one lane per outbound edge.
//!
//! The outbox is the sole flow-control surface a unit sees. Each lane is a
//! bounded buffer drained by the engine into the edge's conduits according
//! to the edge's routing policy. A cooperative unit's offer is rejected
//! the moment a lane is full: the unit keeps the item in its own state and
//! re-offers it on a later call. A non-cooperative unit's offer instead
//! blocks its dedicated thread, polling the cancellation token, until the
//! routers free space.

use std::collections::VecDeque;
use std::fmt;
use std::thread;
use std::time::Duration;

use smallvec::SmallVec;

use crate::dag::routing::{partition_index, RoutingPolicy};
use crate::dag::topology::Ordinal;
use crate::item::Item;
use crate::processor::context::CancellationToken;

use super::conduit::ConduitSender;

/// How offers behave when a lane is full.
#[derive(Debug, Clone, Copy)]
pub(crate) enum OutboxMode {
    /// Reject immediately; the unit retains and retries.
    Cooperative,
    /// Block the dedicated thread, polling cancellation at this interval.
    Dedicated {
        /// Sleep between routing attempts while blocked.
        poll: Duration,
    },
}

/// Progress report from draining the outbox into edge conduits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushProgress {
    /// At least one item was routed downstream.
    pub moved: bool,
    /// Every lane is empty and no broadcast is partially delivered.
    pub drained: bool,
}

/// A broadcast item that has reached some, but not all, of its targets.
///
/// Retrying only the undelivered targets keeps broadcast exactly-once per
/// conduit across backpressure stalls.
struct PendingBroadcast {
    item: Item,
    delivered: SmallVec<[bool; 8]>,
}

/// Routes one lane's items into the destination conduits of its edge.
pub(crate) struct LaneRouter {
    routing: RoutingPolicy,
    targets: Vec<ConduitSender<Item>>,
    /// Round-robin rotation position.
    next_target: usize,
    pending: Option<PendingBroadcast>,
}

impl LaneRouter {
    pub(crate) fn new(routing: RoutingPolicy, targets: Vec<ConduitSender<Item>>) -> Self {
        Self {
            routing,
            targets,
            next_target: 0,
            pending: None,
        }
    }

    /// Drains as much of `buf` as the conduits accept.
    ///
    /// Returns `true` if at least one push succeeded.
    fn drain(&mut self, buf: &mut VecDeque<Item>) -> bool {
        let mut moved = false;
        if self.targets.is_empty() {
            return moved;
        }

        while !buf.is_empty() {
            // A partially delivered broadcast must finish before anything
            // else may be routed, or per-producer order would break.
            if !self.finish_pending(&mut moved) {
                return moved;
            }
            match &self.routing {
                RoutingPolicy::Broadcast => {
                    if let Some(item) = buf.pop_front() {
                        let delivered = SmallVec::from_elem(false, self.targets.len());
                        self.pending = Some(PendingBroadcast { item, delivered });
                    }
                }
                RoutingPolicy::RoundRobin => {
                    let Some(item) = buf.front() else { break };
                    let target = self.next_target % self.targets.len();
                    match self.targets[target].try_push(item.clone()) {
                        Ok(()) => {
                            buf.pop_front();
                            self.next_target = self.next_target.wrapping_add(1);
                            moved = true;
                        }
                        Err(_) => return moved,
                    }
                }
                RoutingPolicy::Partitioned(key_fn) => {
                    let Some(item) = buf.front() else { break };
                    let target = partition_index(key_fn(item), self.targets.len());
                    match self.targets[target].try_push(item.clone()) {
                        Ok(()) => {
                            buf.pop_front();
                            moved = true;
                        }
                        Err(_) => return moved,
                    }
                }
            }
        }

        // A trailing broadcast may still be outstanding after the buffer
        // empties.
        self.finish_pending(&mut moved);
        moved
    }

    /// Attempts to complete a pending broadcast.
    ///
    /// Returns `true` when no broadcast remains outstanding.
    fn finish_pending(&mut self, moved: &mut bool) -> bool {
        let Some(pending) = &mut self.pending else {
            return true;
        };
        let mut complete = true;
        for (idx, delivered) in pending.delivered.iter_mut().enumerate() {
            if *delivered {
                continue;
            }
            match self.targets[idx].try_push(pending.item.clone()) {
                Ok(()) => {
                    *delivered = true;
                    *moved = true;
                }
                Err(_) => complete = false,
            }
        }
        if complete {
            self.pending = None;
        }
        complete
    }

    fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Drops the senders, closing this producer's share of the conduits.
    fn close(&mut self) {
        self.targets.clear();
        self.pending = None;
    }
}

impl fmt::Debug for LaneRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneRouter")
            .field("routing", &self.routing)
            .field("targets", &self.targets.len())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// One bounded lane of buffered output.
struct Lane {
    buf: VecDeque<Item>,
    capacity: usize,
}

/// The bounded emission sink handed to every processing method.
pub struct Outbox {
    lanes: Vec<Lane>,
    routers: Vec<LaneRouter>,
    mode: OutboxMode,
    cancel: CancellationToken,
}

impl Outbox {
    pub(crate) fn new(
        routers: Vec<LaneRouter>,
        capacity: usize,
        mode: OutboxMode,
        cancel: CancellationToken,
    ) -> Self {
        let lanes = routers
            .iter()
            .map(|_| Lane {
                buf: VecDeque::with_capacity(capacity),
                capacity,
            })
            .collect();
        Self {
            lanes,
            routers,
            mode,
            cancel,
        }
    }

    /// Returns the number of outbound lanes.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Offers an item to one lane.
    ///
    /// The item is cloned into the lane only on acceptance; on rejection
    /// the caller still owns it. Cooperative mode: returns `false` without
    /// blocking when the lane is full; the caller retains the item and
    /// re-offers it later, never drops it. Dedicated mode: blocks until
    /// the lane accepts, returning `false` only if the job was cancelled
    /// while waiting.
    ///
    /// # Panics
    ///
    /// Panics if `ordinal` does not name a declared outbound lane.
    pub fn offer(&mut self, ordinal: Ordinal, item: &Item) -> bool {
        let idx = ordinal.index();
        assert!(idx < self.lanes.len(), "no outbound lane {ordinal}");

        match self.mode {
            OutboxMode::Cooperative => {
                if self.lanes[idx].buf.len() < self.lanes[idx].capacity {
                    self.lanes[idx].buf.push_back(item.clone());
                    true
                } else {
                    false
                }
            }
            OutboxMode::Dedicated { poll } => loop {
                self.routers[idx].drain(&mut self.lanes[idx].buf);
                if self.lanes[idx].buf.len() < self.lanes[idx].capacity {
                    self.lanes[idx].buf.push_back(item.clone());
                    self.routers[idx].drain(&mut self.lanes[idx].buf);
                    return true;
                }
                if self.cancel.is_cancelled() {
                    return false;
                }
                thread::sleep(poll);
            },
        }
    }

    /// Offers an item to every lane at once.
    ///
    /// All-or-nothing: succeeds only when every lane has room, so a retry
    /// after `false` can never double-deliver to a subset of lanes. With
    /// zero lanes (a sink vertex) the offer is vacuously accepted.
    pub fn offer_all(&mut self, item: &Item) -> bool {
        match self.mode {
            OutboxMode::Cooperative => {
                if self
                    .lanes
                    .iter()
                    .any(|lane| lane.buf.len() >= lane.capacity)
                {
                    return false;
                }
                self.push_to_all(item);
                true
            }
            OutboxMode::Dedicated { poll } => loop {
                for idx in 0..self.lanes.len() {
                    self.routers[idx].drain(&mut self.lanes[idx].buf);
                }
                if self
                    .lanes
                    .iter()
                    .all(|lane| lane.buf.len() < lane.capacity)
                {
                    self.push_to_all(item);
                    for idx in 0..self.lanes.len() {
                        self.routers[idx].drain(&mut self.lanes[idx].buf);
                    }
                    return true;
                }
                if self.cancel.is_cancelled() {
                    return false;
                }
                thread::sleep(poll);
            },
        }
    }

    fn push_to_all(&mut self, item: &Item) {
        for lane in &mut self.lanes {
            lane.buf.push_back(item.clone());
        }
    }

    /// Drains buffered items into the edge conduits.
    pub(crate) fn flush(&mut self) -> FlushProgress {
        let mut moved = false;
        for (lane, router) in self.lanes.iter_mut().zip(&mut self.routers) {
            moved |= router.drain(&mut lane.buf);
        }
        let drained = self
            .lanes
            .iter()
            .zip(&self.routers)
            .all(|(lane, router)| lane.buf.is_empty() && router.is_idle());
        FlushProgress { moved, drained }
    }

    /// Closes this producer's share of every outbound conduit.
    pub(crate) fn close(&mut self) {
        for router in &mut self.routers {
            router.close();
        }
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("lanes", &self.lanes.len())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::routing::RoutingPolicy;
    use crate::processor::context::CancellationSource;
    use crate::queue::conduit::{conduit, ConduitReceiver};
    use std::sync::Arc;

    fn cooperative_outbox(
        lanes: usize,
        capacity: usize,
        targets_per_lane: usize,
        routing: RoutingPolicy,
        conduit_capacity: usize,
    ) -> (Outbox, Vec<Vec<ConduitReceiver<Item>>>) {
        let cancel = CancellationSource::new();
        let mut routers = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..lanes {
            let mut senders = Vec::new();
            let mut lane_receivers = Vec::new();
            for _ in 0..targets_per_lane {
                let (tx, rx) = conduit(conduit_capacity);
                senders.push(tx);
                lane_receivers.push(rx);
            }
            routers.push(LaneRouter::new(routing.clone(), senders));
            receivers.push(lane_receivers);
        }
        (
            Outbox::new(routers, capacity, OutboxMode::Cooperative, cancel.token()),
            receivers,
        )
    }

    #[test]
    fn test_offer_rejected_at_capacity() {
        let (mut outbox, _rx) =
            cooperative_outbox(1, 4, 1, RoutingPolicy::RoundRobin, 1024);
        for i in 0..4u32 {
            assert!(outbox.offer(Ordinal(0), &Item::new(i)));
        }
        // Fifth offer must be rejected, not dropped, not blocking.
        assert!(!outbox.offer(Ordinal(0), &Item::new(4u32)));
    }

    #[test]
    fn test_flush_frees_capacity() {
        let (mut outbox, rx) = cooperative_outbox(1, 2, 1, RoutingPolicy::RoundRobin, 1024);
        assert!(outbox.offer(Ordinal(0), &Item::new(0u32)));
        assert!(outbox.offer(Ordinal(0), &Item::new(1u32)));
        assert!(!outbox.offer(Ordinal(0), &Item::new(2u32)));

        let progress = outbox.flush();
        assert!(progress.moved);
        assert!(progress.drained);
        assert!(outbox.offer(Ordinal(0), &Item::new(2u32)));
        outbox.flush();

        let received: Vec<u32> = std::iter::from_fn(|| rx[0][0].try_pop())
            .map(|item| *item.downcast_ref::<u32>().unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[test]
    fn test_round_robin_rotates_targets() {
        let (mut outbox, rx) = cooperative_outbox(1, 16, 3, RoutingPolicy::RoundRobin, 1024);
        for i in 0..9u32 {
            assert!(outbox.offer(Ordinal(0), &Item::new(i)));
        }
        outbox.flush();
        for target in &rx[0] {
            assert_eq!(target.len(), 3);
        }
    }

    #[test]
    fn test_partitioned_stable_per_key() {
        let key_fn: crate::dag::routing::KeyFn =
            Arc::new(|item| u64::from(*item.downcast_ref::<u32>().unwrap() % 5));
        let (mut outbox, rx) =
            cooperative_outbox(1, 64, 4, RoutingPolicy::Partitioned(key_fn), 1024);
        for i in 0..40u32 {
            assert!(outbox.offer(Ordinal(0), &Item::new(i)));
        }
        outbox.flush();

        // Items with the same key (i % 5) must share a target.
        let mut key_to_target: fxhash::FxHashMap<u32, usize> = fxhash::FxHashMap::default();
        for (target_idx, target) in rx[0].iter().enumerate() {
            while let Some(item) = target.try_pop() {
                let key = *item.downcast_ref::<u32>().unwrap() % 5;
                let prior = key_to_target.insert(key, target_idx);
                if let Some(prior) = prior {
                    assert_eq!(prior, target_idx, "key {key} split across targets");
                }
            }
        }
    }

    #[test]
    fn test_broadcast_reaches_all_targets() {
        let (mut outbox, rx) = cooperative_outbox(1, 16, 3, RoutingPolicy::Broadcast, 1024);
        for i in 0..5u32 {
            assert!(outbox.offer(Ordinal(0), &Item::new(i)));
        }
        outbox.flush();
        for target in &rx[0] {
            let received: Vec<u32> = std::iter::from_fn(|| target.try_pop())
                .map(|item| *item.downcast_ref::<u32>().unwrap())
                .collect();
            assert_eq!(received, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_broadcast_partial_delivery_no_duplicates() {
        // One target with capacity 2 stalls the broadcast; the other keeps
        // accepting. After draining the stalled side, every target must
        // hold each item exactly once, in order.
        let (mut outbox, rx) = cooperative_outbox(1, 16, 2, RoutingPolicy::Broadcast, 2);
        for i in 0..6u32 {
            assert!(outbox.offer(Ordinal(0), &Item::new(i)));
        }

        let mut received: Vec<Vec<u32>> = vec![Vec::new(), Vec::new()];
        for _ in 0..32 {
            outbox.flush();
            for (idx, target) in rx[0].iter().enumerate() {
                while let Some(item) = target.try_pop() {
                    received[idx].push(*item.downcast_ref::<u32>().unwrap());
                }
            }
        }
        assert_eq!(received[0], vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(received[1], vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_offer_all_is_all_or_nothing() {
        let (mut outbox, _rx) = {
            // Two lanes with different fill levels.
            cooperative_outbox(2, 2, 1, RoutingPolicy::RoundRobin, 1024)
        };
        // Fill lane 1 to capacity without flushing.
        assert!(outbox.offer(Ordinal(1), &Item::new(0u32)));
        assert!(outbox.offer(Ordinal(1), &Item::new(1u32)));

        // Lane 0 has room but lane 1 does not: nothing may be enqueued.
        assert!(!outbox.offer_all(&Item::new(2u32)));
        assert!(outbox.lanes[0].buf.is_empty());
        assert_eq!(outbox.lanes[1].buf.len(), 2);
    }

    #[test]
    fn test_offer_all_no_lanes_vacuous() {
        let cancel = CancellationSource::new();
        let mut outbox = Outbox::new(Vec::new(), 8, OutboxMode::Cooperative, cancel.token());
        assert!(outbox.offer_all(&Item::new(1u32)));
        assert!(outbox.flush().drained);
    }

    #[test]
    fn test_dedicated_offer_blocks_until_space() {
        use std::thread;
        use std::time::Duration;

        let cancel = CancellationSource::new();
        let (tx, rx) = conduit(2);
        let router = LaneRouter::new(RoutingPolicy::RoundRobin, vec![tx]);
        let mut outbox = Outbox::new(
            vec![router],
            1,
            OutboxMode::Dedicated {
                poll: Duration::from_millis(1),
            },
            cancel.token(),
        );

        let producer = thread::spawn(move || {
            for i in 0..20u32 {
                assert!(outbox.offer(Ordinal(0), &Item::new(i)));
            }
        });

        let mut received = Vec::new();
        while received.len() < 20 {
            if let Some(item) = rx.try_pop() {
                received.push(*item.downcast_ref::<u32>().unwrap());
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_dedicated_offer_returns_false_on_cancel() {
        use std::thread;
        use std::time::Duration;

        let cancel = CancellationSource::new();
        let (tx, _rx) = conduit(1);
        let router = LaneRouter::new(RoutingPolicy::RoundRobin, vec![tx]);
        let mut outbox = Outbox::new(
            vec![router],
            1,
            OutboxMode::Dedicated {
                poll: Duration::from_millis(1),
            },
            cancel.token(),
        );

        // Fill the conduit and the lane so the next offer must wait.
        assert!(outbox.offer(Ordinal(0), &Item::new(0u32)));
        assert!(outbox.offer(Ordinal(0), &Item::new(1u32)));

        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cancel.cancel();
            })
        };
        assert!(!outbox.offer(Ordinal(0), &Item::new(2u32)));
        canceller.join().unwrap();
    }
}
