//! Bounded MPSC conduits connecting producer units to a consumer unit.
//!
//! One conduit exists per (edge, destination instance) pair. Producers are
//! the routers of the edge's source instances; the consumer is the
//! destination instance's tasklet. Pushes from one producer are serialized
//! by that producer's own sequential lifecycle, so per-producer FIFO order
//! is preserved end to end; no interleaving order is guaranteed across
//! producers.
//!
//! `try_push` never blocks: a full conduit returns the rejected value to
//! the caller, which retains it and retries later. Blocking producers
//! (dedicated threads of non-cooperative units) combine `try_push` with
//! [`ConduitSender::wait_not_full`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Error returned from `try_push`: the conduit is at capacity.
///
/// Carries the rejected value back to the caller so it can be retained
/// and re-offered; rejection is flow control, never item loss.
pub struct TryPushError<T> {
    /// The value that could not be pushed.
    pub value: T,
}

impl<T> TryPushError<T> {
    /// Consumes the error and returns the rejected value.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TryPushError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conduit is full")
    }
}

/// Shared state for one conduit.
struct Shared<T> {
    /// Pending items, bounded by `capacity`.
    queue: Mutex<VecDeque<T>>,
    /// Notified when the consumer frees space.
    space: Condvar,
    /// Maximum number of resident items.
    capacity: usize,
    /// Number of live senders; zero means the conduit is closed.
    producers: AtomicUsize,
}

/// Creates a bounded conduit with the given capacity.
///
/// The returned sender can be cloned once per producer instance; the
/// conduit closes when the last sender is dropped.
#[must_use]
pub fn conduit<T>(capacity: usize) -> (ConduitSender<T>, ConduitReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        space: Condvar::new(),
        capacity,
        producers: AtomicUsize::new(1),
    });
    (
        ConduitSender {
            shared: shared.clone(),
        },
        ConduitReceiver { shared },
    )
}

/// Producer handle for a conduit.
pub struct ConduitSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ConduitSender<T> {
    /// Attempts to push a value without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TryPushError`] carrying the value back when the conduit
    /// is at capacity.
    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.capacity {
            return Err(TryPushError { value });
        }
        queue.push_back(value);
        Ok(())
    }

    /// Waits up to `timeout` for space to free up.
    ///
    /// Returns `true` if the conduit has space when the call returns.
    /// Only dedicated (non-cooperative) producer threads may call this.
    pub fn wait_not_full(&self, timeout: Duration) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.len() < self.shared.capacity {
            return true;
        }
        let _ = self.shared.space.wait_for(&mut queue, timeout);
        queue.len() < self.shared.capacity
    }

    /// Returns the conduit capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for ConduitSender<T> {
    fn clone(&self) -> Self {
        self.shared.producers.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for ConduitSender<T> {
    fn drop(&mut self) {
        self.shared.producers.fetch_sub(1, Ordering::Release);
    }
}

/// Consumer handle for a conduit.
pub struct ConduitReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ConduitReceiver<T> {
    /// Pops the oldest item, if any.
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        let mut queue = self.shared.queue.lock();
        let popped = queue.pop_front();
        if popped.is_some() {
            self.shared.space.notify_all();
        }
        popped
    }

    /// Moves up to `max` items into `buf`, returning how many moved.
    pub fn drain_into(&self, buf: &mut VecDeque<T>, max: usize) -> usize {
        let mut queue = self.shared.queue.lock();
        let moved = max.min(queue.len());
        buf.extend(queue.drain(..moved));
        if moved > 0 {
            self.shared.space.notify_all();
        }
        moved
    }

    /// Returns the number of resident items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Returns whether the conduit holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    /// Returns whether every sender has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.producers.load(Ordering::Acquire) == 0
    }

    /// Returns whether the conduit is closed and drained.
    ///
    /// Checks closure before emptiness: after the last sender drops, no
    /// further push can happen, so `closed && empty` is a stable fact.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.is_closed() && self.is_empty()
    }
}

impl<T> fmt::Debug for ConduitReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConduitReceiver")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = conduit(8);
        for i in 0..5 {
            tx.try_push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_full_returns_value() {
        let (tx, rx) = conduit(2);
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        let err = tx.try_push(3).unwrap_err();
        assert_eq!(err.into_inner(), 3);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let (tx, rx) = conduit(4);
        for i in 0..10 {
            let _ = tx.try_push(i);
            assert!(rx.len() <= 4);
        }
        assert_eq!(rx.len(), 4);
    }

    #[test]
    fn test_close_on_last_sender_drop() {
        let (tx, rx) = conduit(4);
        let tx2 = tx.clone();
        tx.try_push(1).unwrap();
        drop(tx);
        assert!(!rx.is_closed());
        drop(tx2);
        assert!(rx.is_closed());
        assert!(!rx.is_exhausted());
        assert_eq!(rx.try_pop(), Some(1));
        assert!(rx.is_exhausted());
    }

    #[test]
    fn test_drain_into_bounded() {
        let (tx, rx) = conduit(8);
        for i in 0..6 {
            tx.try_push(i).unwrap();
        }
        let mut buf = VecDeque::new();
        assert_eq!(rx.drain_into(&mut buf, 4), 4);
        assert_eq!(buf, VecDeque::from(vec![0, 1, 2, 3]));
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_wait_not_full_wakes_on_pop() {
        let (tx, rx) = conduit(1);
        tx.try_push(0u32).unwrap();

        let waiter = {
            let tx = tx.clone();
            thread::spawn(move || tx.wait_not_full(Duration::from_secs(5)))
        };
        // Give the waiter time to block, then free space.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.try_pop(), Some(0));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_per_producer_order_under_contention() {
        let (tx, rx) = conduit(1024);
        let tx2 = tx.clone();
        let a = thread::spawn(move || {
            for i in 0..200u32 {
                loop {
                    match tx.try_push(("a", i)) {
                        Ok(()) => break,
                        Err(_) => thread::yield_now(),
                    }
                }
            }
        });
        let b = thread::spawn(move || {
            for i in 0..200u32 {
                loop {
                    match tx2.try_push(("b", i)) {
                        Ok(()) => break,
                        Err(_) => thread::yield_now(),
                    }
                }
            }
        });

        let mut last_a = None;
        let mut last_b = None;
        let mut seen = 0;
        while seen < 400 {
            if let Some((who, seq)) = rx.try_pop() {
                seen += 1;
                let last = if who == "a" { &mut last_a } else { &mut last_b };
                if let Some(prev) = *last {
                    assert!(seq > prev, "{who} reordered: {seq} after {prev}");
                }
                *last = Some(seq);
            } else {
                thread::yield_now();
            }
        }
        a.join().unwrap();
        b.join().unwrap();
    }
}
