//! Dependency ordering between jobs.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::QueuePolicy;
use crate::core::error::WeaverError;
use crate::core::job::{JobId, JobPointer, JobStatus};

/// Holds a job back until every job it depends on finished successfully.
///
/// An edge is dropped as soon as its dependee succeeds. A dependee that
/// fails or is aborted never releases its dependents; they stay queued
/// until dequeued. Cycles are not detected.
#[derive(Default)]
pub struct DependencyPolicy {
    /// Dependent job id to the jobs it waits for.
    edges: Mutex<HashMap<JobId, Vec<JobPointer>>>,
}

impl DependencyPolicy {
    /// Empty policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide shared policy.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<DependencyPolicy>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Make `dependent` wait for `dependee`, attaching this policy to
    /// `dependent`.
    ///
    /// # Errors
    ///
    /// Fails when the two are the same job or when `dependent` is already
    /// queued or running.
    pub fn add_dependency(self: &Arc<Self>, dependent: &JobPointer, dependee: &JobPointer) -> Result<(), WeaverError> {
        if dependent.id() == dependee.id() {
            return Err(WeaverError::SelfDependency(dependent.id()));
        }
        dependent.assign_queue_policy(Arc::clone(self) as Arc<dyn QueuePolicy>)?;
        {
            let mut edges = self.edges.lock();
            let dependees = edges.entry(dependent.id()).or_default();
            if dependees.iter().any(|d| d.id() == dependee.id()) {
                return Ok(());
            }
            dependees.push(Arc::clone(dependee));
        }
        debug!(dependent = dependent.id(), dependee = dependee.id(), "dependency added");

        // Runs right away if the dependee already finished.
        let policy = Arc::downgrade(self);
        let resolved = dependee.id();
        dependee.state().on_finished(move |status| {
            if status == JobStatus::Success {
                if let Some(policy) = policy.upgrade() {
                    policy.resolve(resolved);
                }
            }
        });
        Ok(())
    }

    /// Drop the edge from `dependent` to `dependee`. Returns whether it
    /// existed.
    pub fn remove_dependency(&self, dependent: &JobPointer, dependee: &JobPointer) -> bool {
        let mut edges = self.edges.lock();
        let Some(dependees) = edges.get_mut(&dependent.id()) else {
            return false;
        };
        let before = dependees.len();
        dependees.retain(|d| d.id() != dependee.id());
        let removed = dependees.len() != before;
        if dependees.is_empty() {
            edges.remove(&dependent.id());
        }
        removed
    }

    /// Drop every edge pointing at `dependee`, which succeeded.
    fn resolve(&self, dependee: JobId) {
        let mut edges = self.edges.lock();
        edges.retain(|_, dependees| {
            dependees.retain(|d| d.id() != dependee);
            !dependees.is_empty()
        });
        trace!(dependee, "dependency resolved");
    }

    /// Whether `job` still waits on a dependee that has not succeeded.
    #[must_use]
    pub fn has_unresolved_dependencies(&self, job: &JobPointer) -> bool {
        self.edges
            .lock()
            .get(&job.id())
            .is_some_and(|dependees| dependees.iter().any(|d| !d.success()))
    }

    /// The jobs `job` depends on.
    #[must_use]
    pub fn dependencies(&self, job: &JobPointer) -> Vec<JobPointer> {
        self.edges.lock().get(&job.id()).cloned().unwrap_or_default()
    }

    /// Whether no edges are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.lock().is_empty()
    }
}

impl QueuePolicy for DependencyPolicy {
    fn can_run(&self, job: &JobPointer) -> bool {
        let mut edges = self.edges.lock();
        let Some(dependees) = edges.get_mut(&job.id()) else {
            return true;
        };
        dependees.retain(|d| !d.success());
        if dependees.is_empty() {
            edges.remove(&job.id());
            return true;
        }
        false
    }

    fn free(&self, job: &JobPointer) {
        self.edges.lock().remove(&job.id());
    }
}
