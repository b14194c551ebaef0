//! # Processor contract
//!
//! The polymorphic computation abstraction: one [`Processor`] instance per
//! parallel slice of a vertex, transforming zero or more input streams
//! into zero or more output streams. Each stream corresponds to one edge
//! on the vertex, identified by the edge's ordinal.
//!
//! The special case of zero input streams is a *source* vertex, which gets
//! its data from the environment; zero output streams is a *sink*, which
//! pushes its data to the environment. Connector units bridging external
//! stores are ordinary processors that perform their I/O inside
//! `process`/`complete`/`try_process`, declaring themselves
//! non-cooperative when that I/O can block.
//!
//! Every lifecycle call for one instance happens on one logical thread of
//! control: the scheduler's tasklet exclusively owns the boxed processor,
//! so implementations never need synchronization of their own state.

use std::sync::Arc;

use crate::dag::topology::Ordinal;
use crate::queue::{Inbox, Outbox};
use crate::snapshot::storage::SnapshotSink;

pub mod context;

pub use context::{CancellationSource, CancellationToken, Context, JobId};

/// Factory producing one processor per parallel unit instance.
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

/// Snapshot state distribution declared by a vertex.
///
/// All instances of one vertex must report the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    /// No state to snapshot. `save_snapshot` and `restore_snapshot_key`
    /// are never driven.
    Stateless,
    /// State is keyed and sliced: on restore, each instance receives only
    /// the keys whose partition it owns (default hash partitioner, the
    /// same slicing as a partitioned edge).
    Partitioned,
    /// The entire entry set is restored to every instance. Use
    /// [`snapshot_filter`](Processor::snapshot_filter) to limit traffic.
    Broadcast,
}

/// Errors raised by processor lifecycle methods.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The processor broke the lifecycle contract. Fatal; never retried.
    #[error("lifecycle contract violated: {0}")]
    ContractViolation(String),

    /// The computation itself failed. Fails the job attempt.
    #[error("processing failed: {0}")]
    Failed(String),
}

/// Does the computation needed to transform input streams into output
/// streams.
///
/// By default a processor declares itself *cooperative*: it shares a
/// worker thread with other processors, gets an outbox of finite capacity
/// that is drained only between calls, and must return from every
/// lifecycle call within roughly a millisecond. The moment the outbox
/// refuses an item, the processor saves its position in its own state and
/// returns; it re-offers on the next call and must never drop the item.
///
/// A *non-cooperative* processor ([`is_cooperative`](Self::is_cooperative)
/// returns `false`) runs on a dedicated thread: its outbox offers block
/// until the item is routed, so there is no limit on the items emitted or
/// the time spent inside a single call — a source can do all of its work
/// in one `complete` invocation, even for an infinite stream. Prefer
/// cooperative processors; go non-cooperative only for genuinely blocking
/// operations, which would otherwise starve every unit sharing the thread.
pub trait Processor: Send {
    /// Initializes the processor with its capability context.
    ///
    /// Called exactly once, strictly before any other lifecycle method.
    /// The default does nothing.
    ///
    /// # Errors
    ///
    /// An error fails the job attempt.
    fn init(&mut self, _ctx: &Context) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Called with a batch of items from the inbound edge at `ordinal`.
    ///
    /// The items sit in the inbox; the processor may handle zero or more
    /// of them, removing each item only once it is done with it. Items
    /// left in the inbox are redelivered on the next call. The default
    /// does nothing.
    ///
    /// # Errors
    ///
    /// An error fails the job attempt.
    fn process(
        &mut self,
        _ordinal: Ordinal,
        _inbox: &mut Inbox,
        _outbox: &mut Outbox,
    ) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Called when there is no pending data in the inbox; lets the
    /// processor produce output in the absence of input.
    ///
    /// Returning `Ok(false)` requests another call before the engine
    /// proceeds to any other method. A non-cooperative processor must
    /// strictly return `Ok(true)`.
    ///
    /// # Errors
    ///
    /// An error fails the job attempt.
    fn try_process(&mut self, _outbox: &mut Outbox) -> Result<bool, ProcessorError> {
        Ok(true)
    }

    /// Called after every inbound edge's stream is exhausted; invoked
    /// repeatedly until it returns `Ok(true)`, after which no other
    /// processing method is ever called.
    ///
    /// Source processors do their emission here, in bounded slices when
    /// cooperative.
    ///
    /// # Errors
    ///
    /// An error fails the job attempt.
    fn complete(&mut self, _outbox: &mut Outbox) -> Result<bool, ProcessorError> {
        Ok(true)
    }

    /// Whether this processor participates in cooperative multithreading.
    ///
    /// Must be constant for the life of one instance (the engine reads it
    /// once at unit creation). Instances of one vertex may disagree.
    fn is_cooperative(&self) -> bool {
        true
    }

    /// The vertex's snapshot state distribution.
    ///
    /// All instances of one vertex must report the same value; the engine
    /// rejects the job otherwise.
    fn state_type(&self) -> StateType {
        StateType::Stateless
    }

    /// Stores the processor's state into the snapshot.
    ///
    /// Driven only between input batches, with every inbox empty, and
    /// never concurrently with any other lifecycle call. Returns
    /// `Ok(false)` to be called again (checkpointing in bounded chunks) or
    /// `Ok(true)` when done; output may still be emitted while saving.
    ///
    /// # Errors
    ///
    /// The default errs with [`ProcessorError::ContractViolation`] when
    /// the declared state type is stateful: such processors must override
    /// this method. The stateless default returns `Ok(true)` and is never
    /// driven.
    fn save_snapshot(
        &mut self,
        _sink: &mut dyn SnapshotSink,
        _outbox: &mut Outbox,
    ) -> Result<bool, ProcessorError> {
        if self.state_type() == StateType::Stateless {
            Ok(true)
        } else {
            Err(ProcessorError::ContractViolation(
                "save_snapshot must be overridden for stateful processors".to_string(),
            ))
        }
    }

    /// Predicate limiting which entries are replayed on restore.
    ///
    /// Consulted only when [`state_type`](Self::state_type) is
    /// [`StateType::Broadcast`], to avoid redundant traffic. The default
    /// accepts every key.
    fn snapshot_filter(&self, _key: &[u8]) -> bool {
        true
    }

    /// Applies one recovered entry to the processor's internal state.
    ///
    /// # Errors
    ///
    /// The default errs with [`ProcessorError::ContractViolation`]: a
    /// stateful processor must override it. Never driven for stateless
    /// vertices.
    fn restore_snapshot_key(&mut self, _key: &[u8], _value: &[u8]) -> Result<(), ProcessorError> {
        Err(ProcessorError::ContractViolation(
            "restore_snapshot_key not overridden".to_string(),
        ))
    }

    /// Called exactly once after all entries have been restored; internal
    /// indices may be rebuilt here. The default does nothing.
    ///
    /// # Errors
    ///
    /// An error fails the job attempt.
    fn finish_snapshot_restore(&mut self) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Discards all restored or accumulated internal state.
    ///
    /// Must be idempotent and callable before any restore occurred: a
    /// partition-ownership change mid-restore forces the restore sequence
    /// to start over from scratch. The default does nothing.
    fn clear_state(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises the trait defaults through a unit struct.
    struct Bare;
    impl Processor for Bare {}

    /// Declares partitioned state without overriding the snapshot path.
    struct BrokenStateful;
    impl Processor for BrokenStateful {
        fn state_type(&self) -> StateType {
            StateType::Partitioned
        }
    }

    fn scratch_outbox() -> Outbox {
        let cancel = CancellationSource::new();
        Outbox::new(
            Vec::new(),
            8,
            crate::queue::outbox::OutboxMode::Cooperative,
            cancel.token(),
        )
    }

    #[test]
    fn test_defaults_are_stateless_cooperative() {
        let p = Bare;
        assert!(p.is_cooperative());
        assert_eq!(p.state_type(), StateType::Stateless);
        assert!(p.snapshot_filter(b"anything"));
    }

    #[test]
    fn test_default_save_snapshot_ok_for_stateless() {
        let mut p = Bare;
        let mut sink = crate::snapshot::storage::InMemorySnapshotStore::new();
        let mut outbox = scratch_outbox();
        assert!(p.save_snapshot(&mut sink, &mut outbox).unwrap());
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_default_save_snapshot_violation_for_stateful() {
        let mut p = BrokenStateful;
        let mut sink = crate::snapshot::storage::InMemorySnapshotStore::new();
        let mut outbox = scratch_outbox();
        let err = p.save_snapshot(&mut sink, &mut outbox).unwrap_err();
        assert!(matches!(err, ProcessorError::ContractViolation(_)));
    }

    #[test]
    fn test_default_restore_key_is_violation() {
        let mut p = Bare;
        let err = p.restore_snapshot_key(b"k", b"v").unwrap_err();
        assert!(matches!(err, ProcessorError::ContractViolation(_)));
    }

    #[test]
    fn test_default_lifecycle_results() {
        let mut p = Bare;
        let mut outbox = scratch_outbox();
        assert!(p.try_process(&mut outbox).unwrap());
        assert!(p.complete(&mut outbox).unwrap());
        assert!(p.finish_snapshot_restore().is_ok());
        p.clear_state();
        p.clear_state(); // idempotent
    }
}
