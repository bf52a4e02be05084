//! Queue policies: admission control consulted before a job may run.
//!
//! The weaver calls [`QueuePolicy::about_to_be_queued`], [`QueuePolicy::can_run`]
//! and [`QueuePolicy::release`] with its lock held, so none of them may call
//! back into the weaver. [`QueuePolicy::free`] runs outside the lock, exactly
//! once per queued job, whether the job ran, failed, or was cancelled.
//!
//! A policy that denies a job does not have to signal the weaver: every job
//! completion re-runs admission, and idle workers re-poll blocked queues
//! periodically. Changes made outside any job (raising a cap, removing a
//! dependency by hand) can call [`crate::core::WeaverHandle::reschedule`] to
//! retry right away.

mod dependency;
mod resource;

use std::sync::Arc;

use super::job::JobPointer;

pub use dependency::DependencyPolicy;
pub use resource::ResourceRestrictionPolicy;

/// Admission-control rule attached to jobs.
pub trait QueuePolicy: Send + Sync {
    /// The job entered a pending queue. Lock held.
    fn about_to_be_queued(&self, _job: &JobPointer) {}

    /// Whether `job` may start now. Lock held.
    ///
    /// Granting may reserve a resource for the job; asking again for a job
    /// that already holds a grant must not reserve twice.
    fn can_run(&self, job: &JobPointer) -> bool;

    /// Undo a grant from `can_run` because another policy on the same job
    /// denied it. Lock held.
    fn release(&self, _job: &JobPointer) {}

    /// The job left the system. Called once, outside the lock.
    fn free(&self, job: &JobPointer);
}

/// Identity comparison that ignores vtable pointers.
pub(crate) fn same_policy(a: &Arc<dyn QueuePolicy>, b: &Arc<dyn QueuePolicy>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ask every policy of `job` in order. On the first denial, release the
/// grants already handed out, latest first.
pub(crate) fn admit(job: &JobPointer) -> bool {
    let policies = job.state().policies();
    for (granted, policy) in policies.iter().enumerate() {
        if !policy.can_run(job) {
            for earlier in policies[..granted].iter().rev() {
                earlier.release(job);
            }
            return false;
        }
    }
    true
}
