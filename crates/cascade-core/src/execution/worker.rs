//! Worker loops driving tasklets.
//!
//! Cooperative workers multiplex many tasklets on one thread, advancing
//! each by one bounded step per pass. A pass with no progress anywhere
//! backs off progressively (spin, then yield, then short sleeps) so idle
//! jobs do not burn a core. Dedicated workers run exactly one
//! non-cooperative tasklet and use the same loop; their single unit may
//! block inside a lifecycle call for as long as it likes.

use std::thread;
use std::time::Duration;

use crate::processor::CancellationSource;

use super::error::ExecutionError;
use super::tasklet::ProcessorTasklet;

/// Drives a set of tasklets to completion on the current thread.
pub(crate) struct Worker {
    tasklets: Vec<ProcessorTasklet>,
    cancel: CancellationSource,
    /// Upper bound for one idle backoff sleep.
    idle_sleep_cap: Duration,
}

impl Worker {
    pub(crate) fn new(
        tasklets: Vec<ProcessorTasklet>,
        cancel: CancellationSource,
        idle_sleep_cap: Duration,
    ) -> Self {
        Self {
            tasklets,
            cancel,
            idle_sleep_cap,
        }
    }

    /// Runs until every tasklet reaches a terminal phase.
    ///
    /// # Errors
    ///
    /// Returns the first unit failure. The job-wide cancellation signal is
    /// fired before returning so every other worker winds down.
    pub(crate) fn run(mut self) -> Result<(), ExecutionError> {
        let mut idle_streak: u32 = 0;

        loop {
            let mut any_progress = false;
            let mut all_done = true;

            for idx in 0..self.tasklets.len() {
                if self.tasklets[idx].is_done() {
                    continue;
                }
                all_done = false;
                match self.tasklets[idx].step() {
                    Ok(progress) => any_progress |= progress.made_progress,
                    Err(error) => {
                        tracing::error!(%error, "unit failed; cancelling job");
                        self.cancel.cancel();
                        self.wind_down();
                        return Err(error);
                    }
                }
            }

            if all_done {
                return Ok(());
            }

            if any_progress {
                idle_streak = 0;
            } else {
                idle_streak = idle_streak.saturating_add(1);
                self.back_off(idle_streak);
            }
        }
    }

    /// Progressive idle backoff: spin, yield, then capped sleeps.
    fn back_off(&self, streak: u32) {
        if streak <= 4 {
            std::hint::spin_loop();
        } else if streak <= 8 {
            thread::yield_now();
        } else {
            let sleep_us = (1u64 << (streak - 8).min(6)).min(
                u64::try_from(self.idle_sleep_cap.as_micros()).unwrap_or(u64::MAX),
            );
            thread::sleep(Duration::from_micros(sleep_us.max(1)));
        }
    }

    /// One final pass so still-live tasklets observe cancellation and
    /// close their conduits.
    fn wind_down(&mut self) {
        for tasklet in &mut self.tasklets {
            if !tasklet.is_done() {
                let _ = tasklet.step();
            }
        }
    }
}
