//! Read-only capability handle a unit receives at startup.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifier of one job execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Read-only cancellation signal.
///
/// Satisfied exactly once, never reset. Units performing long blocking
/// work poll [`is_cancelled`](CancellationToken::is_cancelled) and return
/// promptly once it fires; the engine cannot forcibly interrupt a
/// blocking call.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    fired: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Returns whether cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// The writable side of a cancellation signal.
///
/// Held by the engine (and handed to callers that need to cancel a job
/// externally); units only ever see the read-only token.
#[derive(Debug, Clone)]
pub struct CancellationSource {
    fired: Arc<AtomicBool>,
}

impl CancellationSource {
    /// Creates an unfired cancellation signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fires the signal. Idempotent; there is no way to reset it.
    pub fn cancel(&self) {
        self.fired.store(true, Ordering::Release);
    }

    /// Returns a read-only token observing this signal.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            fired: self.fired.clone(),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability handle passed to [`init`](crate::processor::Processor::init).
///
/// Carries the unit's identity and job-wide signals. Logging goes through
/// the `tracing` facade; the engine attaches the vertex name and instance
/// index to its spans, and units are free to do the same.
#[derive(Debug, Clone)]
pub struct Context {
    job_id: JobId,
    vertex_name: Arc<str>,
    global_index: usize,
    total_parallelism: usize,
    cancel: CancellationToken,
    snapshotting_enabled: bool,
}

impl Context {
    pub(crate) fn new(
        job_id: JobId,
        vertex_name: Arc<str>,
        global_index: usize,
        total_parallelism: usize,
        cancel: CancellationToken,
        snapshotting_enabled: bool,
    ) -> Self {
        Self {
            job_id,
            vertex_name,
            global_index,
            total_parallelism,
            cancel,
            snapshotting_enabled,
        }
    }

    /// Returns the job execution attempt this unit belongs to.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Returns the name of the vertex this unit implements.
    #[must_use]
    pub fn vertex_name(&self) -> &str {
        &self.vertex_name
    }

    /// Returns the unit's index among all instances of its vertex: its
    /// unique cluster-wide index.
    #[must_use]
    pub fn global_index(&self) -> usize {
        self.global_index
    }

    /// Returns the total number of parallel instances of this vertex.
    #[must_use]
    pub fn total_parallelism(&self) -> usize {
        self.total_parallelism
    }

    /// Returns the job-wide cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns whether cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns whether snapshots will be saved for this job run.
    #[must_use]
    pub fn snapshotting_enabled(&self) -> bool {
        self.snapshotting_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_fires_once_and_stays() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        // Idempotent, never reset.
        source.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_context_accessors() {
        let source = CancellationSource::new();
        let ctx = Context::new(JobId(7), Arc::from("tokenize"), 2, 4, source.token(), true);
        assert_eq!(ctx.job_id(), JobId(7));
        assert_eq!(ctx.vertex_name(), "tokenize");
        assert_eq!(ctx.global_index(), 2);
        assert_eq!(ctx.total_parallelism(), 4);
        assert!(ctx.snapshotting_enabled());
        assert!(!ctx.is_cancelled());
        source.cancel();
        assert!(ctx.is_cancelled());
    }
}
