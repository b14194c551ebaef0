//! # Cooperative execution engine
//!
//! Drives many units' lifecycle methods on a small pool of worker threads
//! (one-thread-per-unit for non-cooperative units), moving items between
//! bounded queues. One tasklet exclusively owns one processor instance, so
//! no unit is ever invoked concurrently; suspension happens only at
//! lifecycle-call boundaries.
//!
//! The fairness goal is throughput, not strict round-robin latency: a
//! worker advances a unit only while it has pending inbound items or
//! declares more work, and an idle pass backs off progressively.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;

use crate::dag::topology::{Dag, EdgeId};
use crate::item::Item;
use crate::processor::{CancellationSource, Context, JobId, StateType};
use crate::queue::conduit::{conduit, ConduitReceiver, ConduitSender};
use crate::queue::outbox::{LaneRouter, Outbox, OutboxMode};
use crate::snapshot::{SnapshotConfig, SnapshotCoordinator, SnapshotManifest, UnitId};

pub mod error;
pub(crate) mod tasklet;
pub(crate) mod worker;


pub use error::ExecutionError;

use tasklet::ProcessorTasklet;
use worker::Worker;

/// Process-wide job attempt counter.
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for one job execution.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Number of worker threads shared by all cooperative units.
    pub cooperative_workers: usize,
    /// Capacity of each outbox lane.
    pub outbox_capacity: usize,
    /// Capacity of each edge conduit.
    pub conduit_capacity: usize,
    /// Maximum items delivered into an inbox per refill.
    pub inbox_batch_limit: usize,
    /// Upper bound for one idle backoff sleep on a worker.
    pub idle_sleep: Duration,
    /// Polling interval for blocked offers on dedicated threads.
    pub blocking_poll: Duration,
    /// Snapshot configuration for this job run.
    pub snapshot: SnapshotConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cooperative_workers: thread::available_parallelism()
                .map_or(2, |n| n.get().min(4)),
            outbox_capacity: 2048,
            conduit_capacity: 1024,
            inbox_batch_limit: 256,
            idle_sleep: Duration::from_micros(100),
            blocking_poll: Duration::from_millis(1),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl ExecutionConfig {
    /// Sets the cooperative worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.cooperative_workers = workers.max(1);
        self
    }

    /// Sets the outbox lane capacity.
    #[must_use]
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    /// Sets the edge conduit capacity.
    #[must_use]
    pub fn with_conduit_capacity(mut self, capacity: usize) -> Self {
        self.conduit_capacity = capacity.max(1);
        self
    }

    /// Sets the snapshot configuration.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// Counters tracked across one job execution.
///
/// Updated from worker threads with relaxed atomics; read at any time via
/// [`snapshot`](EngineMetrics::snapshot).
#[derive(Debug, Default)]
pub struct EngineMetrics {
    steps: AtomicU64,
    items_delivered: AtomicU64,
    backpressure_stalls: AtomicU64,
    calls_over_budget: AtomicU64,
    snapshots_acknowledged: AtomicU64,
    units_completed: AtomicU64,
}

impl EngineMetrics {
    pub(crate) fn record_step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_items_delivered(&self, count: u64) {
        self.items_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure_stall(&self) {
        self.backpressure_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_over_budget(&self) {
        self.calls_over_budget.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_ack(&self) {
        self.snapshots_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unit_completed(&self) {
        self.units_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            steps: self.steps.load(Ordering::Relaxed),
            items_delivered: self.items_delivered.load(Ordering::Relaxed),
            backpressure_stalls: self.backpressure_stalls.load(Ordering::Relaxed),
            calls_over_budget: self.calls_over_budget.load(Ordering::Relaxed),
            snapshots_acknowledged: self.snapshots_acknowledged.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    /// Tasklet steps taken.
    pub steps: u64,
    /// Items moved from conduits into inboxes.
    pub items_delivered: u64,
    /// Flush passes that could not move a stalled lane.
    pub backpressure_stalls: u64,
    /// Cooperative lifecycle calls that overran their time budget.
    pub calls_over_budget: u64,
    /// Per-unit snapshot acknowledgements.
    pub snapshots_acknowledged: u64,
    /// Units that reached the `Complete` phase.
    pub units_completed: u64,
}

/// Executes one job: instantiates units from a finalized [`Dag`], wires
/// the bounded conduits, and drives everything to completion.
///
/// Obtain long-lived handles ([`cancel_handle`](Self::cancel_handle),
/// [`coordinator`](Self::coordinator), [`metrics`](Self::metrics)) before
/// calling [`run`](Self::run), which consumes the engine.
pub struct ExecutionEngine {
    config: ExecutionConfig,
    cancel: CancellationSource,
    coordinator: Arc<SnapshotCoordinator>,
    metrics: Arc<EngineMetrics>,
    cooperative: Vec<ProcessorTasklet>,
    dedicated: Vec<(Arc<str>, usize, ProcessorTasklet)>,
    job_id: JobId,
}

impl ExecutionEngine {
    /// Builds an engine for a fresh job execution.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::DagNotFinalized`] for an unfinalized DAG
    /// and [`ExecutionError::MixedStateType`] when a vertex's instances
    /// disagree on their snapshot state type.
    pub fn new(dag: &Dag, config: ExecutionConfig) -> Result<Self, ExecutionError> {
        Self::build(dag, config, None)
    }

    /// Builds an engine that restores unit state from a completed
    /// snapshot manifest before normal processing starts.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_restore(
        dag: &Dag,
        config: ExecutionConfig,
        manifest: &SnapshotManifest,
    ) -> Result<Self, ExecutionError> {
        Self::build(dag, config, Some(manifest))
    }

    fn build(
        dag: &Dag,
        config: ExecutionConfig,
        manifest: Option<&SnapshotManifest>,
    ) -> Result<Self, ExecutionError> {
        if !dag.is_finalized() {
            return Err(ExecutionError::DagNotFinalized);
        }

        let job_id = JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationSource::new();
        let coordinator = Arc::new(SnapshotCoordinator::new(&config.snapshot));
        let metrics = Arc::new(EngineMetrics::default());

        // One conduit per (edge, destination instance). Producer instances
        // each get their own sender clone so conduit closure tracks the
        // last finishing producer.
        let mut senders: FxHashMap<EdgeId, Vec<Vec<ConduitSender<Item>>>> = FxHashMap::default();
        let mut receivers: FxHashMap<EdgeId, Vec<Option<ConduitReceiver<Item>>>> =
            FxHashMap::default();

        for edge in dag.edges().values() {
            let producer_count = dag.vertex(edge.source).map_or(1, |v| v.parallelism);
            let consumer_count = dag.vertex(edge.target).map_or(1, |v| v.parallelism);

            let mut per_producer: Vec<Vec<ConduitSender<Item>>> =
                Vec::with_capacity(producer_count);
            per_producer.resize_with(producer_count, Vec::new);
            let mut edge_receivers = Vec::with_capacity(consumer_count);

            for _ in 0..consumer_count {
                let (tx, rx) = conduit(config.conduit_capacity);
                for lanes in &mut per_producer {
                    lanes.push(tx.clone());
                }
                drop(tx);
                edge_receivers.push(Some(rx));
            }

            senders.insert(edge.id, per_producer);
            receivers.insert(edge.id, edge_receivers);
        }

        let mut cooperative = Vec::new();
        let mut dedicated = Vec::new();
        let mut next_unit: u32 = 0;

        for &vertex_id in dag.execution_order() {
            let Some(vertex) = dag.vertex(vertex_id) else {
                continue;
            };
            let name: Arc<str> = Arc::from(vertex.name.as_str());
            let inbound_edges = dag.inbound_edges(vertex_id);
            let outbound_edges = dag.outbound_edges(vertex_id);
            let mut vertex_state_type: Option<StateType> = None;

            for instance in 0..vertex.parallelism {
                let processor = (vertex.factory)();
                let cooperative_unit = processor.is_cooperative();
                let state_type = processor.state_type();

                match vertex_state_type {
                    None => vertex_state_type = Some(state_type),
                    Some(expected) if expected != state_type => {
                        return Err(ExecutionError::MixedStateType(vertex.name.clone()));
                    }
                    Some(_) => {}
                }

                let inbound: Vec<_> = inbound_edges
                    .iter()
                    .map(|edge| {
                        let receiver = receivers
                            .get_mut(&edge.id)
                            .and_then(|slots| slots[instance].take())
                            .expect("conduit receiver wired exactly once");
                        (edge.ordinal, receiver)
                    })
                    .collect();

                let routers: Vec<LaneRouter> = outbound_edges
                    .iter()
                    .map(|edge| {
                        let targets = senders
                            .get_mut(&edge.id)
                            .map(|per_producer| std::mem::take(&mut per_producer[instance]))
                            .expect("conduit senders wired exactly once");
                        LaneRouter::new(edge.routing.clone(), targets)
                    })
                    .collect();

                let mode = if cooperative_unit {
                    OutboxMode::Cooperative
                } else {
                    OutboxMode::Dedicated {
                        poll: config.blocking_poll,
                    }
                };
                let outbox = Outbox::new(routers, config.outbox_capacity, mode, cancel.token());

                let ctx = Context::new(
                    job_id,
                    name.clone(),
                    instance,
                    vertex.parallelism,
                    cancel.token(),
                    config.snapshot.enabled,
                );

                let restore_entries = match (manifest, state_type) {
                    (Some(_), StateType::Stateless) | (None, _) => None,
                    (Some(manifest), _) => Some(manifest.entries_for_instance(
                        &vertex.name,
                        state_type,
                        vertex.parallelism,
                        instance,
                    )),
                };

                let unit = UnitId(next_unit);
                next_unit += 1;
                coordinator.register_unit(unit);

                let tasklet = ProcessorTasklet::new(
                    unit,
                    name.clone(),
                    instance,
                    processor,
                    ctx,
                    inbound,
                    outbox,
                    cooperative_unit,
                    state_type,
                    config.inbox_batch_limit,
                    restore_entries,
                    coordinator.clone(),
                    metrics.clone(),
                );

                if cooperative_unit {
                    cooperative.push(tasklet);
                } else {
                    dedicated.push((name.clone(), instance, tasklet));
                }
            }
        }

        Ok(Self {
            config,
            cancel,
            coordinator,
            metrics,
            cooperative,
            dedicated,
            job_id,
        })
    }

    /// Returns a handle that cancels this job when fired.
    #[must_use]
    pub fn cancel_handle(&self) -> CancellationSource {
        self.cancel.clone()
    }

    /// Returns the snapshot coordinator for this job.
    #[must_use]
    pub fn coordinator(&self) -> Arc<SnapshotCoordinator> {
        self.coordinator.clone()
    }

    /// Returns the engine metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Returns the job attempt identifier.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Runs the job to completion, cancellation, or failure.
    ///
    /// Spawns the cooperative worker pool and one dedicated thread per
    /// non-cooperative unit, triggers automatic snapshots when configured,
    /// and joins everything before returning.
    ///
    /// # Errors
    ///
    /// Returns the first [`ExecutionError::UnitFailed`] raised by a unit,
    /// [`ExecutionError::Cancelled`] if the job was cancelled externally,
    /// or [`ExecutionError::WorkerPanicked`] if a worker thread died.
    pub fn run(self) -> Result<(), ExecutionError> {
        let Self {
            config,
            cancel,
            coordinator,
            metrics: _,
            cooperative,
            dedicated,
            job_id,
        } = self;

        tracing::info!(
            %job_id,
            cooperative_units = cooperative.len(),
            dedicated_units = dedicated.len(),
            workers = config.cooperative_workers,
            "job execution starting"
        );

        let live = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        // Distribute cooperative tasklets round-robin across the pool.
        let worker_count = config.cooperative_workers.max(1);
        let mut buckets: Vec<Vec<ProcessorTasklet>> = Vec::new();
        buckets.resize_with(worker_count, Vec::new);
        for (idx, tasklet) in cooperative.into_iter().enumerate() {
            buckets[idx % worker_count].push(tasklet);
        }

        for (idx, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let worker = Worker::new(bucket, cancel.clone(), config.idle_sleep);
            let live = live.clone();
            live.fetch_add(1, Ordering::Relaxed);
            let handle = thread::Builder::new()
                .name(format!("cascade-worker-{idx}"))
                .spawn(move || {
                    let result = worker.run();
                    live.fetch_sub(1, Ordering::Release);
                    result
                })
                .map_err(|e| ExecutionError::WorkerSpawn(e.to_string()))?;
            handles.push(handle);
        }

        for (name, instance, tasklet) in dedicated {
            let worker = Worker::new(vec![tasklet], cancel.clone(), config.idle_sleep);
            let live = live.clone();
            live.fetch_add(1, Ordering::Relaxed);
            let handle = thread::Builder::new()
                .name(format!("cascade-{name}-{instance}"))
                .spawn(move || {
                    let result = worker.run();
                    live.fetch_sub(1, Ordering::Release);
                    result
                })
                .map_err(|e| ExecutionError::WorkerSpawn(e.to_string()))?;
            handles.push(handle);
        }

        // Automatic snapshot cadence, when configured.
        if let (true, Some(interval)) = (config.snapshot.enabled, config.snapshot.interval) {
            let poll = interval.min(Duration::from_millis(50));
            let mut last_trigger = Instant::now();
            while live.load(Ordering::Acquire) > 0 {
                thread::sleep(poll);
                if last_trigger.elapsed() >= interval {
                    // An in-flight epoch just means we retrigger later.
                    let _ = coordinator.trigger_snapshot();
                    last_trigger = Instant::now();
                }
            }
        }

        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(ExecutionError::WorkerPanicked);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            tracing::error!(%job_id, error = %error, "job execution failed");
            return Err(error);
        }
        if cancel.token().is_cancelled() {
            tracing::info!(%job_id, "job execution cancelled");
            return Err(ExecutionError::Cancelled);
        }
        tracing::info!(%job_id, "job execution completed");
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("job_id", &self.job_id)
            .field("cooperative_units", &self.cooperative.len())
            .field("dedicated_units", &self.dedicated.len())
            .finish_non_exhaustive()
    }
}
