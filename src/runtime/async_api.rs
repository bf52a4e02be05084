//! Awaitable wrappers around the blocking weaver and job waits.
//!
//! Each call parks one tokio blocking-pool thread for the duration of the
//! wait, keeping the async workers free.
//!
//! ```rust,ignore
//! let weaver = Weaver::with_thread_count(4)?;
//! weaver.enqueue(job.clone())?;
//! let status = wait_for_job(job, Duration::from_secs(30)).await?;
//! weaver.finish_async().await?;
//! ```

use std::time::Duration;

use tokio::task;

use crate::core::{AppResult, JobPointer, JobStatus, WeaverHandle};

impl WeaverHandle {
    /// Async [`WeaverHandle::finish`].
    ///
    /// # Errors
    ///
    /// Fails only if the blocking task could not complete.
    pub async fn finish_async(&self) -> AppResult<()> {
        let handle = self.clone();
        task::spawn_blocking(move || handle.finish()).await?;
        Ok(())
    }

    /// Async [`WeaverHandle::finish_timeout`].
    ///
    /// # Errors
    ///
    /// Fails only if the blocking task could not complete.
    pub async fn finish_timeout_async(&self, timeout: Duration) -> AppResult<bool> {
        let handle = self.clone();
        Ok(task::spawn_blocking(move || handle.finish_timeout(timeout)).await?)
    }
}

/// Wait up to `timeout` for `job` to finish and return its status, which is
/// not terminal if the wait timed out.
///
/// # Errors
///
/// Fails only if the blocking task could not complete.
pub async fn wait_for_job(job: JobPointer, timeout: Duration) -> AppResult<JobStatus> {
    let status = task::spawn_blocking(move || {
        job.wait(timeout);
        job.status()
    })
    .await?;
    Ok(status)
}
