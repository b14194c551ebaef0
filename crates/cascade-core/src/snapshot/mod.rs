//! # Snapshot / restore protocol
//!
//! Orchestrates the save/restore protocol across all units of a running
//! job to produce and consume a consistent state checkpoint.
//!
//! - [`SnapshotCoordinator`] — publishes a requested epoch; each live unit
//!   acknowledges once its own save path finishes, and the coordinator
//!   finalizes a [`SnapshotManifest`] when every acknowledgement is in
//! - [`SnapshotSink`] / [`InMemorySnapshotStore`] — the key/value write
//!   target handed to `save_snapshot`
//! - [`SnapshotManifest`] — the serializable checkpoint; persistence is
//!   the caller's responsibility
//!
//! Units observe a requested epoch only between input batches, with every
//! inbox empty, which makes each unit's capture a point between batches.
//! The cross-graph barrier-alignment protocol that would make these
//! per-unit points globally consistent across processes is out of scope;
//! within one process, epoch observation through quiescent inboxes is the
//! coordinator's alignment rule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fxhash::FxHashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dag::routing::key_partition;
use crate::processor::StateType;

pub mod storage;

pub use storage::{CapturedState, InMemorySnapshotStore, SnapshotEntry, SnapshotSink};

/// Errors raised by the snapshot protocol.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// A snapshot was triggered while another is still in flight.
    #[error("snapshot already in progress: epoch {0}")]
    InProgress(u64),

    /// No completed snapshot is available to restore from.
    #[error("no completed snapshot available")]
    NoCompletedSnapshot,
}

/// Configuration for snapshotting a job run.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Whether snapshots will be saved for this job run.
    pub enabled: bool,
    /// Automatic trigger interval; `None` leaves triggering to the caller.
    pub interval: Option<Duration>,
    /// Maximum number of completed manifests to retain.
    pub max_retained: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: None,
            max_retained: 3,
        }
    }
}

impl SnapshotConfig {
    /// Enables snapshotting with no automatic interval.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Enables snapshotting with an automatic trigger interval.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval: Some(interval),
            ..Self::default()
        }
    }

    /// Sets the manifest retention bound.
    #[must_use]
    pub fn max_retained(mut self, max: usize) -> Self {
        self.max_retained = max;
        self
    }
}

/// One entry of a completed snapshot.
///
/// Uses owned standard types so the manifest derives
/// `Serialize`/`Deserialize` for persistence by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Name of the vertex that wrote the entry.
    pub vertex: String,
    /// Entry key.
    pub key: Vec<u8>,
    /// Entry value.
    pub value: Vec<u8>,
}

/// A completed, consistent checkpoint of all units' state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Monotonically increasing snapshot epoch.
    pub epoch: u64,
    /// All entries captured across the job's units.
    pub entries: Vec<ManifestEntry>,
}

impl SnapshotManifest {
    /// Iterates the entries written by one vertex's units.
    pub fn entries_for_vertex<'a>(
        &'a self,
        vertex: &'a str,
    ) -> impl Iterator<Item = &'a ManifestEntry> {
        self.entries.iter().filter(move |e| e.vertex == vertex)
    }

    /// Selects the entries one restoring instance receives.
    ///
    /// `Partitioned` state routes each key to the instance owning its
    /// partition slice; `Broadcast` state hands every entry to every
    /// instance (the unit's own `snapshot_filter` applies afterwards);
    /// `Stateless` vertices receive nothing.
    #[must_use]
    pub fn entries_for_instance(
        &self,
        vertex: &str,
        state_type: StateType,
        parallelism: usize,
        instance: usize,
    ) -> Vec<ManifestEntry> {
        match state_type {
            StateType::Stateless => Vec::new(),
            StateType::Partitioned => self
                .entries_for_vertex(vertex)
                .filter(|e| key_partition(&e.key, parallelism) == instance)
                .cloned()
                .collect(),
            StateType::Broadcast => self.entries_for_vertex(vertex).cloned().collect(),
        }
    }
}

/// Flat identifier of one unit instance within a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(pub u32);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnitId({})", self.0)
    }
}

/// Mutable coordinator state behind the lock.
struct CoordinatorState {
    /// Units that can still acknowledge epochs.
    live_units: FxHashSet<UnitId>,
    /// Units the in-flight epoch is still waiting on.
    pending: FxHashSet<UnitId>,
    /// State captured so far for the in-flight epoch.
    collected: Vec<CapturedState>,
    /// The in-flight epoch, if any.
    in_flight: Option<u64>,
    /// Completed manifests, bounded by `max_retained`.
    manifests: Vec<SnapshotManifest>,
}

/// Orchestrates the save path across all units of a running job.
///
/// The requested epoch is published through an atomic so tasklets can poll
/// it every step without taking the lock; the lock is only taken on the
/// rare acknowledge/trigger/finish transitions.
pub struct SnapshotCoordinator {
    /// Latest requested epoch; 0 means none yet.
    requested_epoch: AtomicU64,
    /// Next epoch to assign.
    next_epoch: AtomicU64,
    state: Mutex<CoordinatorState>,
    max_retained: usize,
}

impl SnapshotCoordinator {
    /// Creates a coordinator with the given retention bound.
    #[must_use]
    pub fn new(config: &SnapshotConfig) -> Self {
        Self {
            requested_epoch: AtomicU64::new(0),
            next_epoch: AtomicU64::new(1),
            state: Mutex::new(CoordinatorState {
                live_units: FxHashSet::default(),
                pending: FxHashSet::default(),
                collected: Vec::new(),
                in_flight: None,
                manifests: Vec::new(),
            }),
            max_retained: config.max_retained,
        }
    }

    /// Registers a unit that will acknowledge future epochs.
    ///
    /// Called by the engine for every unit instance before execution
    /// starts.
    pub fn register_unit(&self, unit: UnitId) {
        self.state.lock().live_units.insert(unit);
    }

    /// Triggers a new snapshot epoch.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::InProgress`] while a previous epoch is
    /// still awaiting acknowledgements.
    pub fn trigger_snapshot(&self) -> Result<u64, SnapshotError> {
        let mut state = self.state.lock();
        if let Some(epoch) = state.in_flight {
            return Err(SnapshotError::InProgress(epoch));
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        state.pending = state.live_units.clone();
        state.collected.clear();
        state.in_flight = Some(epoch);
        self.requested_epoch.store(epoch, Ordering::Release);
        tracing::debug!(epoch, pending = state.pending.len(), "snapshot triggered");

        if state.pending.is_empty() {
            self.finalize_locked(&mut state);
        }
        Ok(epoch)
    }

    /// Returns the latest requested epoch (0 if none yet).
    ///
    /// Polled by tasklets between input batches.
    #[inline]
    pub fn requested_epoch(&self) -> u64 {
        self.requested_epoch.load(Ordering::Acquire)
    }

    /// Records one unit's completed save for the in-flight epoch.
    ///
    /// Finalizes the manifest once every pending unit has acknowledged.
    pub fn acknowledge(&self, unit: UnitId, captured: CapturedState) {
        let mut state = self.state.lock();
        if state.in_flight.is_none() {
            return;
        }
        if state.pending.remove(&unit) {
            state.collected.push(captured);
        }
        if state.pending.is_empty() {
            self.finalize_locked(&mut state);
        }
    }

    /// Removes a unit that reached `Complete` (or was cancelled) from the
    /// protocol; completed units are excused from in-flight epochs.
    pub fn on_unit_finished(&self, unit: UnitId) {
        let mut state = self.state.lock();
        state.live_units.remove(&unit);
        let was_pending = state.pending.remove(&unit);
        if was_pending && state.pending.is_empty() && state.in_flight.is_some() {
            self.finalize_locked(&mut state);
        }
    }

    /// Returns whether an epoch is still awaiting acknowledgements.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Returns the most recent completed manifest, if any.
    #[must_use]
    pub fn latest_manifest(&self) -> Option<SnapshotManifest> {
        self.state.lock().manifests.last().cloned()
    }

    /// Returns all retained manifests, oldest first.
    #[must_use]
    pub fn manifests(&self) -> Vec<SnapshotManifest> {
        self.state.lock().manifests.clone()
    }

    /// Builds the manifest for the in-flight epoch and retires it.
    fn finalize_locked(&self, state: &mut CoordinatorState) {
        let Some(epoch) = state.in_flight.take() else {
            return;
        };

        let mut entries = Vec::new();
        for captured in state.collected.drain(..) {
            for entry in captured.entries {
                entries.push(ManifestEntry {
                    vertex: captured.vertex.clone(),
                    key: entry.key.into_vec(),
                    value: entry.value.into_vec(),
                });
            }
        }

        tracing::info!(epoch, entries = entries.len(), "snapshot completed");
        state.manifests.push(SnapshotManifest { epoch, entries });
        while state.manifests.len() > self.max_retained {
            state.manifests.remove(0);
        }
    }
}

impl std::fmt::Debug for SnapshotCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SnapshotCoordinator")
            .field("requested_epoch", &self.requested_epoch.load(Ordering::Relaxed))
            .field("in_flight", &state.in_flight)
            .field("live_units", &state.live_units.len())
            .field("pending", &state.pending.len())
            .field("manifests", &state.manifests.len())
            .finish()
    }
}
