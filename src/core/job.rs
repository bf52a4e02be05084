//! The job contract and the bookkeeping every job carries.
//!
//! A job is shared between whoever enqueued it and the weaver that runs it,
//! so it always travels as a [`JobPointer`] (`Arc<dyn Job>`). Implementors
//! embed a [`JobState`] and hand it out through [`Job::state`]; every other
//! trait method has a default built on top of that state.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_weaver::core::{AppResult, Job, JobPointer, JobState, Thread};
//!
//! struct Render { state: JobState }
//!
//! impl Job for Render {
//!     fn state(&self) -> &JobState { &self.state }
//!     fn run(&self, _job: &JobPointer, _thread: &Thread) -> AppResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! let job: JobPointer = Arc::new(Render { state: JobState::new() });
//! weaver.enqueue(job.clone())?;
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{AppResult, WeaverError};
use super::executor::{DefaultExecutor, Executor};
use super::policy::{same_policy, QueuePolicy};
use super::thread::Thread;

/// Process-unique job identifier.
pub type JobId = u64;

/// Shared handle to a job.
pub type JobPointer = Arc<dyn Job>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not queued.
    New,
    /// Waiting in a weaver's pending queue.
    Queued,
    /// Being executed by a worker thread.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error or a panic.
    Failed,
    /// Cancelled before it ran, or stopped after an abort request.
    Aborted,
}

impl JobStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

type FinishCallback = Box<dyn FnOnce(JobStatus) + Send>;

struct Progress {
    status: JobStatus,
    error: Option<String>,
    callbacks: Vec<FinishCallback>,
}

/// Bookkeeping shared by every job: identity, priority, status, attached
/// queue policies and the executor.
pub struct JobState {
    id: JobId,
    priority: AtomicI32,
    progress: Mutex<Progress>,
    finished: Condvar,
    abort_requested: AtomicBool,
    outcome_reported: AtomicBool,
    policies: Mutex<Vec<Arc<dyn QueuePolicy>>>,
    executor: Mutex<Arc<dyn Executor>>,
}

fn default_executor() -> Arc<dyn Executor> {
    static DEFAULT: OnceLock<Arc<DefaultExecutor>> = OnceLock::new();
    let executor = DEFAULT.get_or_init(|| Arc::new(DefaultExecutor));
    Arc::clone(executor) as Arc<dyn Executor>
}

impl JobState {
    /// Fresh state with priority 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_priority(0)
    }

    /// Fresh state with the given priority.
    #[must_use]
    pub fn with_priority(priority: i32) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            priority: AtomicI32::new(priority),
            progress: Mutex::new(Progress {
                status: JobStatus::New,
                error: None,
                callbacks: Vec::new(),
            }),
            finished: Condvar::new(),
            abort_requested: AtomicBool::new(false),
            outcome_reported: AtomicBool::new(false),
            policies: Mutex::new(Vec::new()),
            executor: Mutex::new(default_executor()),
        }
    }

    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Current priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Change the priority.
    ///
    /// # Errors
    ///
    /// Returns [`WeaverError::InvalidJobState`] while the job is queued,
    /// since its position in the pending queue is fixed at enqueue time.
    pub fn set_priority(&self, priority: i32) -> Result<(), WeaverError> {
        let progress = self.progress.lock();
        if progress.status == JobStatus::Queued {
            return Err(self.invalid(progress.status));
        }
        self.priority.store(priority, Ordering::Relaxed);
        Ok(())
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.progress.lock().status
    }

    /// Whether the job reached a terminal status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Whether the job finished successfully.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status() == JobStatus::Success
    }

    /// Failure message recorded when the job failed or was aborted mid-run.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.progress.lock().error.clone()
    }

    /// Ask the job to stop. Advisory only.
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    /// Whether an abort was requested.
    #[must_use]
    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    /// Snapshot of the attached policies, in attachment order.
    #[must_use]
    pub fn policies(&self) -> Vec<Arc<dyn QueuePolicy>> {
        self.policies.lock().clone()
    }

    /// Attach a policy. Attaching the same policy twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`WeaverError::InvalidJobState`] while the job is queued or
    /// running.
    pub fn assign_queue_policy(&self, policy: Arc<dyn QueuePolicy>) -> Result<(), WeaverError> {
        // Held until the list is updated so an enqueue cannot snapshot it
        // halfway.
        let _progress = self.ensure_idle()?;
        let mut policies = self.policies.lock();
        if !policies.iter().any(|p| same_policy(p, &policy)) {
            policies.push(policy);
        }
        Ok(())
    }

    /// Detach a policy. Returns whether it was attached.
    ///
    /// # Errors
    ///
    /// Returns [`WeaverError::InvalidJobState`] while the job is queued or
    /// running.
    pub fn remove_queue_policy(&self, policy: &Arc<dyn QueuePolicy>) -> Result<bool, WeaverError> {
        let _progress = self.ensure_idle()?;
        let mut policies = self.policies.lock();
        let before = policies.len();
        policies.retain(|p| !same_policy(p, policy));
        Ok(policies.len() != before)
    }

    /// The executor that will run the job.
    #[must_use]
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor.lock())
    }

    /// Swap the executor and return the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`WeaverError::InvalidJobState`] while the job is running.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) -> Result<Arc<dyn Executor>, WeaverError> {
        let progress = self.progress.lock();
        if progress.status == JobStatus::Running {
            return Err(self.invalid(progress.status));
        }
        let previous = std::mem::replace(&mut *self.executor.lock(), executor);
        Ok(previous)
    }

    /// Register a callback that runs once the job finishes.
    ///
    /// Runs immediately on the calling thread if the job already finished,
    /// otherwise on whichever thread finishes it.
    pub fn on_finished(&self, callback: impl FnOnce(JobStatus) + Send + 'static) {
        let mut progress = self.progress.lock();
        if progress.status.is_finished() {
            let status = progress.status;
            drop(progress);
            callback(status);
            return;
        }
        progress.callbacks.push(Box::new(callback));
    }

    /// Block until the job finishes or `timeout` elapses. Returns whether
    /// the job finished.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self.progress.lock();
        while !progress.status.is_finished() {
            if self.finished.wait_until(&mut progress, deadline).timed_out() {
                return progress.status.is_finished();
            }
        }
        true
    }

    /// Block until the job finishes.
    pub fn wait(&self) {
        let mut progress = self.progress.lock();
        while !progress.status.is_finished() {
            self.finished.wait(&mut progress);
        }
    }

    pub(crate) fn mark_queued(&self) -> Result<(), WeaverError> {
        let mut progress = self.progress.lock();
        if progress.status != JobStatus::New {
            return Err(self.invalid(progress.status));
        }
        progress.status = JobStatus::Queued;
        Ok(())
    }

    /// Move to Running. Only a new or queued job can start.
    pub(crate) fn mark_running(&self) -> bool {
        let mut progress = self.progress.lock();
        match progress.status {
            JobStatus::New | JobStatus::Queued => {
                progress.status = JobStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Record the terminal status. Returns false if the job had already
    /// finished; the first outcome wins.
    pub(crate) fn finish(&self, status: JobStatus, error: Option<String>) -> bool {
        self.finish_from(|current| !current.is_finished(), status, error)
    }

    /// Abort a job nobody has queued or started. Returns false, and leaves
    /// the job alone, if it is no longer new.
    pub(crate) fn abort_unqueued(&self, error: Option<String>) -> bool {
        self.finish_from(|current| current == JobStatus::New, JobStatus::Aborted, error)
    }

    /// Claim the single report of this job's outcome to stats and
    /// observers. Only the first caller gets true.
    pub(crate) fn claim_outcome_report(&self) -> bool {
        !self.outcome_reported.swap(true, Ordering::AcqRel)
    }

    fn finish_from(&self, allowed: impl Fn(JobStatus) -> bool, status: JobStatus, error: Option<String>) -> bool {
        debug_assert!(status.is_finished());
        let callbacks = {
            let mut progress = self.progress.lock();
            if !allowed(progress.status) {
                return false;
            }
            progress.status = status;
            progress.error = error;
            self.finished.notify_all();
            std::mem::take(&mut progress.callbacks)
        };
        for callback in callbacks {
            callback(status);
        }
        true
    }

    fn ensure_idle(&self) -> Result<MutexGuard<'_, Progress>, WeaverError> {
        let progress = self.progress.lock();
        if matches!(progress.status, JobStatus::Queued | JobStatus::Running) {
            return Err(self.invalid(progress.status));
        }
        Ok(progress)
    }

    const fn invalid(&self, status: JobStatus) -> WeaverError {
        WeaverError::InvalidJobState {
            id: self.id,
            status,
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobState")
            .field("id", &self.id)
            .field("priority", &self.priority())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A unit of work.
///
/// Only [`Job::state`] and [`Job::run`] are required. `run` is called by the
/// job's [`Executor`] on a worker thread and never concurrently with itself.
/// Returning `Err` or panicking marks the job failed; neither affects other
/// jobs or the pool.
pub trait Job: Send + Sync + 'static {
    /// Shared bookkeeping.
    fn state(&self) -> &JobState;

    /// The work itself. `job` is the shared handle to `self`.
    ///
    /// # Errors
    ///
    /// Any error marks the job failed, or aborted if an abort was requested.
    fn run(&self, job: &JobPointer, thread: &Thread) -> AppResult<()>;

    /// Hook called by [`DefaultExecutor`] before `run`.
    fn default_begin(&self, _job: &JobPointer, _thread: &Thread) {}

    /// Hook called by [`DefaultExecutor`] after `run`, whatever it returned.
    fn default_end(&self, _job: &JobPointer, _thread: &Thread) {}

    /// Execute the job on `thread`: status bookkeeping around the executor.
    ///
    /// Composite jobs override this to defer their own completion.
    fn execute(&self, job: &JobPointer, thread: &Thread) {
        execute_with_executor(job, thread);
    }

    /// Called while the weaver's lock is held, right after the job entered
    /// the pending queue. Must not call back into the weaver.
    fn about_to_be_queued_locked(&self) {}

    /// Called while the weaver's lock is held, right after the job left the
    /// pending queue to run or to be cancelled. Must not call back into the
    /// weaver.
    fn about_to_be_dequeued_locked(&self) {}

    /// Ask the job to stop. Advisory; long-running jobs poll
    /// [`Job::should_abort`].
    fn request_abort(&self) {
        self.state().request_abort();
    }

    /// Job identifier.
    fn id(&self) -> JobId {
        self.state().id()
    }

    /// Priority used to order the pending queue. Higher runs first.
    fn priority(&self) -> i32 {
        self.state().priority()
    }

    /// Current status.
    fn status(&self) -> JobStatus {
        self.state().status()
    }

    /// Whether the job reached a terminal status.
    fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Whether the job finished successfully. Meaningful once finished.
    fn success(&self) -> bool {
        self.state().success()
    }

    /// Failure message, if the job failed or was aborted mid-run.
    fn error(&self) -> Option<String> {
        self.state().error()
    }

    /// Whether an abort was requested.
    fn should_abort(&self) -> bool {
        self.state().is_abort_requested()
    }

    /// See [`JobState::assign_queue_policy`].
    ///
    /// # Errors
    ///
    /// Fails while the job is queued or running.
    fn assign_queue_policy(&self, policy: Arc<dyn QueuePolicy>) -> Result<(), WeaverError> {
        self.state().assign_queue_policy(policy)
    }

    /// See [`JobState::remove_queue_policy`].
    ///
    /// # Errors
    ///
    /// Fails while the job is queued or running.
    fn remove_queue_policy(&self, policy: &Arc<dyn QueuePolicy>) -> Result<bool, WeaverError> {
        self.state().remove_queue_policy(policy)
    }

    /// The executor that will run the job.
    fn executor(&self) -> Arc<dyn Executor> {
        self.state().executor()
    }

    /// See [`JobState::set_executor`].
    ///
    /// # Errors
    ///
    /// Fails while the job is running.
    fn set_executor(&self, executor: Arc<dyn Executor>) -> Result<Arc<dyn Executor>, WeaverError> {
        self.state().set_executor(executor)
    }

    /// Block until the job finishes or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> bool {
        self.state().wait_for(timeout)
    }
}

/// Default [`Job::execute`]: mark the job running, invoke its executor with
/// panics contained, record the outcome.
pub fn execute_with_executor(job: &JobPointer, thread: &Thread) {
    let state = job.state();
    if !state.mark_running() {
        debug!(job_id = state.id(), status = %state.status(), "job not runnable, skipping");
        return;
    }
    let executor = state.executor();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        executor.begin(job, thread);
        executor.execute(job, thread)
    }));
    let (status, error) = match outcome {
        Ok(Ok(())) => (JobStatus::Success, None),
        Ok(Err(err)) if state.is_abort_requested() => (JobStatus::Aborted, Some(format!("{err:#}"))),
        Ok(Err(err)) => (JobStatus::Failed, Some(format!("{err:#}"))),
        Err(payload) => (JobStatus::Failed, Some(panic_message(payload.as_ref()))),
    };
    if let Some(message) = &error {
        warn!(
            job_id = state.id(),
            thread_id = thread.id(),
            status = %status,
            error = %message,
            "job did not succeed"
        );
    }
    end_executor(&executor, job, thread.id(), status, error.as_deref());
    state.finish(status, error);
}

/// Report the outcome to the executor chain; a panicking decorator is
/// logged and does not change the outcome.
pub(crate) fn end_executor(
    executor: &Arc<dyn Executor>,
    job: &JobPointer,
    thread: usize,
    status: JobStatus,
    error: Option<&str>,
) {
    if panic::catch_unwind(AssertUnwindSafe(|| executor.end(job, thread, status, error))).is_err() {
        warn!(job_id = job.id(), thread_id = thread, "executor panicked while ending job");
    }
}

/// Run `job` synchronously on the calling thread, bypassing weaver and
/// queue policies. Returns the final status.
pub fn blocking_execute(job: &JobPointer) -> JobStatus {
    let thread = Thread::detached();
    job.execute(job, &thread);
    job.status()
}

/// Release everything the job's policies hold for it. Called once per
/// queued job, whichever way it leaves the weaver.
pub(crate) fn free_queue_policy_resources(job: &JobPointer) {
    for policy in job.state().policies() {
        policy.free(job);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map_or_else(|| "job panicked".to_string(), |msg| format!("job panicked: {msg}"))
}
