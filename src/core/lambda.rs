//! Closure-backed job.

use super::error::AppResult;
use super::job::{Job, JobPointer, JobState};
use super::thread::Thread;

/// A job that runs a closure.
///
/// ```rust,ignore
/// let job: JobPointer = Arc::new(Lambda::new(|| {
///     compress_logs()?;
///     Ok(())
/// }));
/// ```
pub struct Lambda<F> {
    state: JobState,
    work: F,
}

impl<F> Lambda<F>
where
    F: Fn() -> AppResult<()> + Send + Sync + 'static,
{
    /// Wrap `work` with priority 0.
    pub fn new(work: F) -> Self {
        Self::with_priority(work, 0)
    }

    /// Wrap `work` with the given priority.
    pub fn with_priority(work: F, priority: i32) -> Self {
        Self {
            state: JobState::with_priority(priority),
            work,
        }
    }
}

impl<F> Job for Lambda<F>
where
    F: Fn() -> AppResult<()> + Send + Sync + 'static,
{
    fn state(&self) -> &JobState {
        &self.state
    }

    fn run(&self, _job: &JobPointer, _thread: &Thread) -> AppResult<()> {
        (self.work)()
    }
}
