//! The weaver: a pool of worker threads sharing one pending-job queue.
//!
//! # Key Features
//!
//! - **Priority order**: higher priority first, FIFO among equals
//! - **Queue policies**: admission control re-checked on every dequeue attempt
//! - **Suspend/resume**: running jobs complete, nothing new starts
//! - **Finish barrier**: block until the queue is empty and every thread idle
//! - **Resizable pool**: shrinking never interrupts a running job
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_weaver::core::{JobPointer, Lambda, Weaver};
//!
//! let weaver = Weaver::with_thread_count(4)?;
//! for _ in 0..16 {
//!     let job: JobPointer = Arc::new(Lambda::new(|| Ok(())));
//!     weaver.enqueue(job)?;
//! }
//! weaver.finish();
//! ```
//!
//! Everything is guarded by a single mutex and one condition variable. Every
//! state change the weaver sees (enqueue, job completion, dequeue, resume,
//! resize) wakes all waiters; idle workers facing blocked jobs additionally
//! re-poll at `repoll_interval_ms`. A job whose policies never admit it keeps
//! [`WeaverHandle::finish`] blocked; use [`WeaverHandle::finish_timeout`]
//! where that is not acceptable.

mod coordinator;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub(crate) use coordinator::WeaverCore;
pub use coordinator::{Weaver, WeaverHandle};

/// Lifecycle of a weaver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaverState {
    /// Being built.
    InConstruction,
    /// Threads pick up jobs.
    WorkingHard,
    /// Suspend requested; jobs still running.
    Suspending,
    /// Suspended and no job running.
    Suspended,
    /// Draining; no new work accepted.
    ShuttingDown,
    /// Threads joined.
    Destructed,
}

impl WeaverState {
    /// Whether `enqueue` is accepted in this state.
    #[must_use]
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::WorkingHard | Self::Suspending | Self::Suspended)
    }
}

/// Snapshot of weaver utilisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WeaverStats {
    /// Live worker threads.
    pub thread_count: usize,
    /// Configured maximum.
    pub max_threads: usize,
    /// Threads currently executing a job.
    pub active_threads: usize,
    /// Jobs waiting in the queue.
    pub queued_jobs: usize,
    /// Jobs accepted by `enqueue`.
    pub submitted_jobs: u64,
    /// Jobs run by worker threads that succeeded.
    pub completed_jobs: u64,
    /// Jobs run by worker threads that failed.
    pub failed_jobs: u64,
    /// Jobs aborted, before running or after an abort request.
    pub aborted_jobs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct WeaverCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub aborted: AtomicU64,
}

impl WeaverCounters {
    pub fn snapshot(&self, thread_count: usize, max_threads: usize, active_threads: usize, queued_jobs: usize) -> WeaverStats {
        WeaverStats {
            thread_count,
            max_threads,
            active_threads,
            queued_jobs,
            submitted_jobs: self.submitted.load(Ordering::Relaxed),
            completed_jobs: self.completed.load(Ordering::Relaxed),
            failed_jobs: self.failed.load(Ordering::Relaxed),
            aborted_jobs: self.aborted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_work() {
        assert!(WeaverState::WorkingHard.accepts_work());
        assert!(WeaverState::Suspended.accepts_work());
        assert!(!WeaverState::ShuttingDown.accepts_work());
        assert!(!WeaverState::Destructed.accepts_work());
    }

    #[test]
    fn test_stats_default() {
        let stats = WeaverStats::default();
        assert_eq!(stats.thread_count, 0);
        assert_eq!(stats.completed_jobs, 0);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = WeaverCounters::default();
        counters.submitted.fetch_add(10, Ordering::Relaxed);
        counters.completed.fetch_add(7, Ordering::Relaxed);
        counters.aborted.fetch_add(1, Ordering::Relaxed);

        let stats = counters.snapshot(4, 8, 2, 3);
        assert_eq!(stats.thread_count, 4);
        assert_eq!(stats.max_threads, 8);
        assert_eq!(stats.active_threads, 2);
        assert_eq!(stats.queued_jobs, 3);
        assert_eq!(stats.submitted_jobs, 10);
        assert_eq!(stats.completed_jobs, 7);
        assert_eq!(stats.aborted_jobs, 1);
    }
}
