//! Pending-job collection: priority order, FIFO within a priority.

use super::job::{JobId, JobPointer};
use super::policy::admit;

/// Jobs waiting to run. Priority is captured at insertion.
#[derive(Default)]
pub(crate) struct PendingQueue {
    jobs: Vec<(i32, JobPointer)>,
}

impl PendingQueue {
    /// Insert after every job with the same or higher priority.
    pub fn insert(&mut self, job: JobPointer) {
        let priority = job.priority();
        let index = self
            .jobs
            .iter()
            .rposition(|(queued, _)| *queued >= priority)
            .map_or(0, |i| i + 1);
        self.jobs.insert(index, (priority, job));
    }

    /// Remove and return the first job every policy admits.
    pub fn take_eligible(&mut self) -> Option<JobPointer> {
        let index = self.jobs.iter().position(|(_, job)| admit(job))?;
        Some(self.jobs.remove(index).1)
    }

    pub fn remove(&mut self, id: JobId) -> Option<JobPointer> {
        let index = self.jobs.iter().position(|(_, job)| job.id() == id)?;
        Some(self.jobs.remove(index).1)
    }

    pub fn drain(&mut self) -> Vec<JobPointer> {
        self.jobs.drain(..).map(|(_, job)| job).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
