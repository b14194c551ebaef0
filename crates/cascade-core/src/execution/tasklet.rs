//! Per-unit lifecycle state machine.
//!
//! One [`ProcessorTasklet`] exclusively owns one processor instance for
//! its whole life and drives every lifecycle call on it. That exclusive
//! ownership is what makes "all lifecycle calls are strictly sequential on
//! one logical thread of control" a type-level fact rather than a
//! convention: no other thread can reach the boxed processor.
//!
//! Phases advance `Init → Running → Draining → FlushingOutput → Complete`,
//! with `Cancelled` reachable from any live phase. `FlushingOutput` is
//! engine plumbing between "complete returned true" and closing the
//! outbound conduits: buffered output must reach the conduits before
//! downstream consumers may observe exhaustion.

use std::sync::Arc;

use crate::budget::CallBudget;
use crate::dag::topology::Ordinal;
use crate::item::Item;
use crate::processor::{Context, Processor, StateType};
use crate::queue::conduit::ConduitReceiver;
use crate::queue::{Inbox, Outbox};
use crate::snapshot::storage::CapturedState;
use crate::snapshot::{InMemorySnapshotStore, ManifestEntry, SnapshotCoordinator, UnitId};

use super::error::ExecutionError;
use super::EngineMetrics;

/// Lifecycle phase of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// `init` (and any restore) has not run yet.
    Init,
    /// Inbound streams may still deliver items.
    Running,
    /// Inputs exhausted; `complete` is being driven to `true`.
    Draining,
    /// `complete` returned `true`; buffered output is still being routed.
    FlushingOutput,
    /// Terminal: every lifecycle obligation is met.
    Complete,
    /// Terminal: the job was cancelled.
    Cancelled,
}

/// Outcome of one tasklet step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Progress {
    /// Whether the step moved items, made a lifecycle call that asked to
    /// be called again, or changed phase.
    pub made_progress: bool,
    /// Whether the tasklet reached a terminal phase.
    pub done: bool,
}

/// One inbound edge's delivery state for this unit.
struct InboundStream {
    /// Destination ordinal of the edge.
    ordinal: Ordinal,
    /// Conduit feeding this ordinal.
    receiver: ConduitReceiver<Item>,
    /// Current batch; never auto-cleared.
    inbox: Inbox,
}

/// A snapshot save in progress for one epoch.
struct ActiveSave {
    epoch: u64,
    sink: InMemorySnapshotStore,
}

/// Drives one processor instance through its lifecycle.
pub(crate) struct ProcessorTasklet {
    unit: UnitId,
    vertex: Arc<str>,
    instance: usize,
    processor: Box<dyn Processor>,
    ctx: Context,
    phase: Phase,
    inbound: Vec<InboundStream>,
    /// Rotation position for fair ordinal selection.
    next_inbound: usize,
    outbox: Outbox,
    /// Read once at creation; constant for the instance's life.
    cooperative: bool,
    state_type: StateType,
    inbox_batch_limit: usize,
    /// Entries to replay before the first `process`, if restoring.
    restore_entries: Option<Vec<ManifestEntry>>,
    coordinator: Arc<SnapshotCoordinator>,
    /// Latest epoch this unit has acknowledged.
    acked_epoch: u64,
    active_save: Option<ActiveSave>,
    metrics: Arc<EngineMetrics>,
}

impl ProcessorTasklet {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        unit: UnitId,
        vertex: Arc<str>,
        instance: usize,
        processor: Box<dyn Processor>,
        ctx: Context,
        inbound: Vec<(Ordinal, ConduitReceiver<Item>)>,
        outbox: Outbox,
        cooperative: bool,
        state_type: StateType,
        inbox_batch_limit: usize,
        restore_entries: Option<Vec<ManifestEntry>>,
        coordinator: Arc<SnapshotCoordinator>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let inbound = inbound
            .into_iter()
            .map(|(ordinal, receiver)| InboundStream {
                ordinal,
                receiver,
                inbox: Inbox::new(),
            })
            .collect();
        Self {
            unit,
            vertex,
            instance,
            processor,
            ctx,
            phase: Phase::Init,
            inbound,
            next_inbound: 0,
            outbox,
            cooperative,
            state_type,
            inbox_batch_limit,
            restore_entries,
            coordinator,
            acked_epoch: 0,
            active_save: None,
            metrics,
        }
    }

    /// Whether this tasklet shares a worker thread.
    pub(crate) fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    /// Whether the tasklet reached a terminal phase.
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Complete | Phase::Cancelled)
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether every inbox batch has been fully consumed.
    pub(crate) fn inboxes_empty(&self) -> bool {
        self.inbound.iter().all(|s| s.inbox.is_empty())
    }

    /// Advances the unit by one bounded step.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::UnitFailed`] when a lifecycle call fails;
    /// the caller is responsible for cancelling the rest of the job.
    pub(crate) fn step(&mut self) -> Result<Progress, ExecutionError> {
        if self.is_done() {
            return Ok(Progress {
                made_progress: false,
                done: true,
            });
        }

        // Cancellation is checked before any lifecycle call: once the
        // token fires, no further method is ever invoked on the unit.
        if self.ctx.is_cancelled() {
            self.finish(Phase::Cancelled);
            return Ok(Progress {
                made_progress: true,
                done: true,
            });
        }

        self.metrics.record_step();

        match self.phase {
            Phase::Init => self.step_init(),
            Phase::Running => self.step_running(),
            Phase::Draining => self.step_draining(),
            Phase::FlushingOutput => Ok(self.step_flushing()),
            Phase::Complete | Phase::Cancelled => unreachable!("stepped a terminal tasklet"),
        }
    }

    /// `init`, then the restore sequence when resuming from a snapshot.
    fn step_init(&mut self) -> Result<Progress, ExecutionError> {
        let init_result = self.processor.init(&self.ctx);
        self.check(init_result)?;

        if let Some(entries) = self.restore_entries.take() {
            self.run_restore(&entries)?;
        }

        self.phase = Phase::Running;
        Ok(Progress {
            made_progress: true,
            done: false,
        })
    }

    /// Replays recovered entries, then signals completion exactly once.
    fn run_restore(&mut self, entries: &[ManifestEntry]) -> Result<(), ExecutionError> {
        for entry in entries {
            if self.state_type == StateType::Broadcast && !self.processor.snapshot_filter(&entry.key)
            {
                continue;
            }
            let restored = self.processor.restore_snapshot_key(&entry.key, &entry.value);
            self.check(restored)?;
        }
        let finished = self.processor.finish_snapshot_restore();
        self.check(finished)?;
        tracing::debug!(
            vertex = %self.vertex,
            instance = self.instance,
            entries = entries.len(),
            "snapshot restore finished"
        );
        Ok(())
    }

    fn step_running(&mut self) -> Result<Progress, ExecutionError> {
        let mut progress = false;

        let flush = self.outbox.flush();
        progress |= flush.moved;
        if !flush.moved && !flush.drained {
            self.metrics.record_backpressure_stall();
        }

        // The save path runs only between input batches, with every inbox
        // empty; while a save is active no other lifecycle method runs.
        if self.advance_save()? {
            return Ok(Progress {
                made_progress: true,
                done: false,
            });
        }

        // Pick the next ordinal with pending items, rotating for fairness.
        let n = self.inbound.len();
        let mut chosen = None;
        for offset in 0..n {
            let idx = (self.next_inbound + offset) % n;
            if self.inbound[idx].inbox.is_empty() {
                let stream = &mut self.inbound[idx];
                let moved = stream.inbox.refill_from(&stream.receiver, self.inbox_batch_limit);
                if moved > 0 {
                    self.metrics.record_items_delivered(moved as u64);
                }
            }
            if !self.inbound[idx].inbox.is_empty() {
                chosen = Some(idx);
                break;
            }
        }

        if let Some(idx) = chosen {
            self.next_inbound = idx.wrapping_add(1);
            let ordinal = self.inbound[idx].ordinal;
            let budget = CallBudget::cooperative_call();
            let result = self.processor.process(
                ordinal,
                &mut self.inbound[idx].inbox,
                &mut self.outbox,
            );
            self.observe_budget(&budget);
            self.check(result)?;
            progress |= self.outbox.flush().moved;
            return Ok(Progress {
                made_progress: true,
                done: false,
            });
        }

        // No pending data in any inbox this step.
        let budget = CallBudget::cooperative_call();
        let try_result = self.processor.try_process(&mut self.outbox);
        self.observe_budget(&budget);
        let done = self.check(try_result)?;
        if !done && !self.cooperative {
            return Err(self.violation("non-cooperative unit returned false from try_process"));
        }
        progress |= self.outbox.flush().moved;
        progress |= !done;

        if done && self.all_inputs_exhausted() {
            // Input exhaustion confirmed; move on to the completing step.
            self.phase = Phase::Draining;
            return Ok(Progress {
                made_progress: true,
                done: false,
            });
        }

        Ok(Progress {
            made_progress: progress,
            done: false,
        })
    }

    fn step_draining(&mut self) -> Result<Progress, ExecutionError> {
        let mut progress = false;

        let flush = self.outbox.flush();
        progress |= flush.moved;
        if !flush.moved && !flush.drained {
            self.metrics.record_backpressure_stall();
        }

        // Saves interleave between `complete` calls.
        if self.advance_save()? {
            return Ok(Progress {
                made_progress: true,
                done: false,
            });
        }

        let budget = CallBudget::cooperative_call();
        let result = self.processor.complete(&mut self.outbox);
        self.observe_budget(&budget);
        let done = self.check(result)?;
        progress |= self.outbox.flush().moved;

        if done {
            self.phase = Phase::FlushingOutput;
            return Ok(Progress {
                made_progress: true,
                done: false,
            });
        }

        Ok(Progress {
            made_progress: progress,
            done: false,
        })
    }

    /// Routes remaining buffered output, then closes the conduits.
    fn step_flushing(&mut self) -> Progress {
        let flush = self.outbox.flush();
        if flush.drained {
            self.finish(Phase::Complete);
            return Progress {
                made_progress: true,
                done: true,
            };
        }
        if !flush.moved {
            self.metrics.record_backpressure_stall();
        }
        Progress {
            made_progress: flush.moved,
            done: false,
        }
    }

    /// Starts or advances the snapshot save path.
    ///
    /// Returns `true` while a save occupied this step.
    fn advance_save(&mut self) -> Result<bool, ExecutionError> {
        if self.active_save.is_none() {
            let requested = self.coordinator.requested_epoch();
            if requested <= self.acked_epoch || !self.inboxes_empty() {
                return Ok(false);
            }
            if self.state_type == StateType::Stateless {
                // Nothing to save; acknowledge immediately without ever
                // driving the (contract-violating) default.
                self.acknowledge(requested, InMemorySnapshotStore::new());
                return Ok(true);
            }
            self.active_save = Some(ActiveSave {
                epoch: requested,
                sink: InMemorySnapshotStore::new(),
            });
        }

        let budget = CallBudget::snapshot_chunk();
        let result = {
            let save = self.active_save.as_mut().expect("save in progress");
            self.processor.save_snapshot(&mut save.sink, &mut self.outbox)
        };
        self.observe_budget(&budget);
        let done = self.check(result)?;
        if done {
            if let Some(save) = self.active_save.take() {
                self.acknowledge(save.epoch, save.sink);
            }
        }
        Ok(true)
    }

    fn acknowledge(&mut self, epoch: u64, sink: InMemorySnapshotStore) {
        self.coordinator.acknowledge(
            self.unit,
            CapturedState {
                vertex: self.vertex.to_string(),
                global_index: self.instance,
                state_type: self.state_type,
                entries: sink.into_entries(),
            },
        );
        self.acked_epoch = epoch;
        self.metrics.record_snapshot_ack();
    }

    fn all_inputs_exhausted(&self) -> bool {
        self.inbound
            .iter()
            .all(|s| s.receiver.is_exhausted() && s.inbox.is_empty())
    }

    /// Enters a terminal phase: closes outbound conduits and leaves the
    /// snapshot protocol.
    fn finish(&mut self, phase: Phase) {
        self.outbox.close();
        self.coordinator.on_unit_finished(self.unit);
        if phase == Phase::Complete {
            self.metrics.record_unit_completed();
        }
        self.phase = phase;
    }

    fn observe_budget(&self, budget: &CallBudget) {
        if self.cooperative && budget.exceeded() {
            self.metrics.record_call_over_budget();
        }
    }

    /// Maps a lifecycle result onto the job-failure path.
    fn check<T>(&self, result: Result<T, crate::processor::ProcessorError>) -> Result<T, ExecutionError> {
        result.map_err(|source| ExecutionError::UnitFailed {
            vertex: self.vertex.to_string(),
            instance: self.instance,
            source,
        })
    }

    fn violation(&self, message: &str) -> ExecutionError {
        ExecutionError::UnitFailed {
            vertex: self.vertex.to_string(),
            instance: self.instance,
            source: crate::processor::ProcessorError::ContractViolation(message.to_string()),
        }
    }
}

impl std::fmt::Debug for ProcessorTasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorTasklet")
            .field("unit", &self.unit)
            .field("vertex", &self.vertex)
            .field("instance", &self.instance)
            .field("phase", &self.phase)
            .field("cooperative", &self.cooperative)
            .finish_non_exhaustive()
    }
}
