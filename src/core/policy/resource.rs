//! Resource restriction: at most `cap` admitted jobs at a time.

use parking_lot::Mutex;
use tracing::trace;

use super::QueuePolicy;
use crate::core::job::{JobId, JobPointer};

/// Bounds how many jobs sharing this policy run concurrently.
///
/// A grant from `can_run` reserves a slot until the job is freed. A cap of
/// zero never admits a job.
#[derive(Debug)]
pub struct ResourceRestrictionPolicy {
    name: String,
    cap: Mutex<usize>,
    customers: Mutex<Vec<JobId>>,
}

impl ResourceRestrictionPolicy {
    /// Unnamed policy with the given cap.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self::named("resource", cap)
    }

    /// Policy for a named resource, used in log output.
    #[must_use]
    pub fn named(name: impl Into<String>, cap: usize) -> Self {
        Self {
            name: name.into(),
            cap: Mutex::new(cap),
            customers: Mutex::new(Vec::new()),
        }
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current cap.
    #[must_use]
    pub fn cap(&self) -> usize {
        *self.cap.lock()
    }

    /// Change the cap. Jobs already admitted keep their slots; call
    /// `reschedule` on the weaver after raising it.
    pub fn set_cap(&self, cap: usize) {
        *self.cap.lock() = cap;
    }

    /// Number of jobs currently holding a slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.customers.lock().len()
    }

    fn vacate(&self, job: &JobPointer) {
        let id = job.id();
        self.customers.lock().retain(|customer| *customer != id);
    }
}

impl QueuePolicy for ResourceRestrictionPolicy {
    fn can_run(&self, job: &JobPointer) -> bool {
        let id = job.id();
        let cap = self.cap();
        let mut customers = self.customers.lock();
        if customers.contains(&id) {
            return true;
        }
        if customers.len() < cap {
            customers.push(id);
            trace!(resource = %self.name, job_id = id, active = customers.len(), "slot granted");
            return true;
        }
        false
    }

    fn release(&self, job: &JobPointer) {
        self.vacate(job);
    }

    fn free(&self, job: &JobPointer) {
        self.vacate(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lambda::Lambda;
    use std::sync::Arc;

    fn job() -> JobPointer {
        Arc::new(Lambda::new(|| Ok(())))
    }

    #[test]
    fn test_cap_is_enforced() {
        let policy = ResourceRestrictionPolicy::named("gpu", 2);
        let (a, b, c) = (job(), job(), job());
        assert!(policy.can_run(&a));
        assert!(policy.can_run(&b));
        assert!(!policy.can_run(&c));
        assert_eq!(policy.active(), 2);
        assert_eq!(policy.name(), "gpu");

        policy.free(&a);
        assert!(policy.can_run(&c));
    }

    #[test]
    fn test_repeated_grant_does_not_double_count() {
        let policy = ResourceRestrictionPolicy::new(1);
        let a = job();
        assert!(policy.can_run(&a));
        assert!(policy.can_run(&a));
        assert_eq!(policy.active(), 1);
        policy.release(&a);
        assert_eq!(policy.active(), 0);
    }

    #[test]
    fn test_zero_cap_blocks_and_raising_admits() {
        let policy = ResourceRestrictionPolicy::new(0);
        let a = job();
        assert!(!policy.can_run(&a));
        policy.set_cap(1);
        assert_eq!(policy.cap(), 1);
        assert!(policy.can_run(&a));
    }
}
