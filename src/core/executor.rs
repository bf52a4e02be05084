//! Executors: the seam through which a job's work is invoked.
//!
//! Decorators wrap the previous executor of a job, so behaviour composes
//! without touching the job type. [`Job::set_executor`] returns the executor
//! it replaced, which is how decorators chain and how callers restore the
//! original behaviour.
//!
//! Lifecycle reporting lives in [`Executor::begin`] and [`Executor::end`]
//! rather than around `execute`, because a collection's `execute` only
//! fans its elements out: its `end` comes later, from the thread that
//! finished its last element.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, info};

use super::error::{AppResult, WeaverError};
use super::job::{Job, JobId, JobPointer, JobStatus};
use super::thread::Thread;

/// Strategy that runs a job's work on a thread.
pub trait Executor: Send + Sync {
    /// Called once, on the executing thread, before `execute`.
    fn begin(&self, _job: &JobPointer, _thread: &Thread) {}

    /// Run `job` on `thread`.
    ///
    /// # Errors
    ///
    /// Propagates the job's own failure.
    fn execute(&self, job: &JobPointer, thread: &Thread) -> AppResult<()>;

    /// Called once with the job's final status, right before it is
    /// recorded. `thread` is the id of the thread that began the job.
    fn end(&self, _job: &JobPointer, _thread: usize, _status: JobStatus, _error: Option<&str>) {}
}

/// Calls `default_begin`, `run` and `default_end`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExecutor;

impl Executor for DefaultExecutor {
    fn execute(&self, job: &JobPointer, thread: &Thread) -> AppResult<()> {
        job.default_begin(job, thread);
        let result = job.run(job, thread);
        job.default_end(job, thread);
        result
    }
}

/// Lifecycle notification emitted by [`EventExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The job is about to run.
    Started {
        /// Job identifier.
        job: JobId,
        /// Executing thread.
        thread: usize,
    },
    /// The job's work returned successfully.
    Done {
        /// Job identifier.
        job: JobId,
        /// Executing thread.
        thread: usize,
    },
    /// The job's work returned an error.
    Failed {
        /// Job identifier.
        job: JobId,
        /// Executing thread.
        thread: usize,
        /// Rendered error.
        error: String,
    },
}

/// Decorator that forwards job lifecycle transitions to a channel.
///
/// Nothing in the weaver depends on the receiving side; a dropped receiver
/// only silences the events.
pub struct EventExecutor {
    inner: Arc<dyn Executor>,
    events: Sender<JobEvent>,
}

impl EventExecutor {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Executor>, events: Sender<JobEvent>) -> Self {
        Self { inner, events }
    }

    /// Wrap the job's current executor and install the decorator. Returns
    /// the executor that was replaced.
    ///
    /// # Errors
    ///
    /// Fails while the job is running.
    pub fn attach(job: &JobPointer, events: Sender<JobEvent>) -> Result<Arc<dyn Executor>, WeaverError> {
        let decorator = Arc::new(Self::new(job.executor(), events));
        job.set_executor(decorator)
    }

    /// The wrapped executor.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Executor> {
        &self.inner
    }

    fn emit(&self, event: JobEvent) {
        if self.events.send(event).is_err() {
            debug!("job event receiver dropped");
        }
    }
}

impl Executor for EventExecutor {
    fn begin(&self, job: &JobPointer, thread: &Thread) {
        self.emit(JobEvent::Started {
            job: job.id(),
            thread: thread.id(),
        });
        self.inner.begin(job, thread);
    }

    fn execute(&self, job: &JobPointer, thread: &Thread) -> AppResult<()> {
        self.inner.execute(job, thread)
    }

    fn end(&self, job: &JobPointer, thread: usize, status: JobStatus, error: Option<&str>) {
        self.inner.end(job, thread, status, error);
        let event = if status == JobStatus::Success {
            JobEvent::Done { job: job.id(), thread }
        } else {
            JobEvent::Failed {
                job: job.id(),
                thread,
                error: error.map_or_else(|| status.to_string(), str::to_string),
            }
        };
        self.emit(event);
    }
}

/// Decorator that logs how long the wrapped executor took.
pub struct TimingExecutor {
    inner: Arc<dyn Executor>,
}

impl TimingExecutor {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self { inner }
    }
}

impl Executor for TimingExecutor {
    fn begin(&self, job: &JobPointer, thread: &Thread) {
        self.inner.begin(job, thread);
    }

    fn execute(&self, job: &JobPointer, thread: &Thread) -> AppResult<()> {
        let started = Instant::now();
        let result = self.inner.execute(job, thread);
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            job_id = job.id(),
            thread_id = thread.id(),
            elapsed_ms = elapsed_ms,
            ok = result.is_ok(),
            "job executed"
        );
        result
    }

    fn end(&self, job: &JobPointer, thread: usize, status: JobStatus, error: Option<&str>) {
        self.inner.end(job, thread, status, error);
    }
}
