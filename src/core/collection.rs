//! Composite jobs.
//!
//! A [`JobCollection`] is itself a job. When a worker executes it, the
//! collection enqueues its elements into the same weaver and returns; the
//! collection finishes later, when its last element does. Created with
//! [`JobCollection::sequence`], elements are chained through a private
//! [`DependencyPolicy`] so they run strictly in order, and the first element
//! that does not succeed cancels the rest.
//!
//! ```rust,ignore
//! let build = Arc::new(JobCollection::sequence());
//! build.add_job(fetch)?;
//! build.add_job(compile)?;
//! build.add_job(package)?;
//! let build: JobPointer = build;
//! weaver.enqueue(build.clone())?;
//! weaver.finish();
//! assert!(build.success());
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::{AppResult, WeaverError};
use super::job::{
    blocking_execute, end_executor, free_queue_policy_resources, panic_message, Job, JobId, JobPointer, JobState,
    JobStatus,
};
use super::policy::DependencyPolicy;
use super::thread::Thread;
use super::weaver::WeaverHandle;

#[derive(Default)]
struct Tracker {
    launched: bool,
    remaining: usize,
    failure: Option<String>,
    stopped: bool,
    weaver: Option<WeaverHandle>,
    /// Thread the collection began on; its executor's `end` reports it.
    thread: usize,
    /// Elements that may still be cancelled.
    pending: Vec<JobPointer>,
}

impl Tracker {
    fn halted(&self, sequential: bool) -> bool {
        self.stopped || (sequential && self.failure.is_some())
    }
}

/// A job made of other jobs.
pub struct JobCollection {
    state: JobState,
    elements: Mutex<Vec<JobPointer>>,
    sequential: bool,
    dependencies: Arc<DependencyPolicy>,
    tracker: Arc<Mutex<Tracker>>,
}

impl JobCollection {
    /// Collection whose elements run in parallel.
    #[must_use]
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Collection whose elements run one after another, stopping at the
    /// first element that does not succeed.
    #[must_use]
    pub fn sequence() -> Self {
        Self::build(true)
    }

    fn build(sequential: bool) -> Self {
        Self {
            state: JobState::new(),
            elements: Mutex::new(Vec::new()),
            sequential,
            dependencies: Arc::new(DependencyPolicy::new()),
            tracker: Arc::new(Mutex::new(Tracker::default())),
        }
    }

    /// Append an element.
    ///
    /// # Errors
    ///
    /// [`WeaverError::InvalidJobState`] once the collection was queued, and
    /// [`WeaverError::DuplicateElement`] for a job that is already an
    /// element or is the collection itself.
    pub fn add_job(&self, job: JobPointer) -> Result<(), WeaverError> {
        let status = self.state.status();
        if status != JobStatus::New {
            return Err(WeaverError::InvalidJobState {
                id: self.state.id(),
                status,
            });
        }
        let mut elements = self.elements.lock();
        if job.id() == self.state.id() || elements.iter().any(|e| e.id() == job.id()) {
            return Err(WeaverError::DuplicateElement(job.id()));
        }
        elements.push(job);
        Ok(())
    }

    /// Elements in insertion order.
    #[must_use]
    pub fn elements(&self) -> Vec<JobPointer> {
        self.elements.lock().clone()
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    /// Whether the collection has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }

    /// Whether this is a sequence.
    #[must_use]
    pub const fn is_sequence(&self) -> bool {
        self.sequential
    }

    /// Cancel the elements that have not started. Running elements
    /// complete; the collection then finishes as aborted.
    pub fn stop(&self) {
        let (weaver, pending) = {
            let mut tracker = self.tracker.lock();
            tracker.stopped = true;
            (tracker.weaver.clone(), std::mem::take(&mut tracker.pending))
        };
        debug!(collection = self.state.id(), pending = pending.len(), "stopping collection");
        cancel(weaver.as_ref(), &pending);
    }

    fn enqueue_elements(&self, weaver: &WeaverHandle, elements: &[JobPointer]) {
        for element in elements {
            // Held across enqueue so a concurrent cancel cannot miss an
            // element that is about to enter the queue.
            let tracker = self.tracker.lock();
            if tracker.halted(self.sequential) {
                drop(tracker);
                abort_element(element, None);
                continue;
            }
            let queued = weaver.enqueue(Arc::clone(element));
            drop(tracker);
            if let Err(err) = queued {
                // A job queued or run by someone else still reports to the
                // collection when it finishes.
                warn!(collection = self.state.id(), job_id = element.id(), error = %err, "could not enqueue collection element");
                abort_element(element, Some(err.to_string()));
            }
        }
    }

    fn run_inline(&self, elements: &[JobPointer]) {
        for element in elements {
            if self.tracker.lock().halted(self.sequential) {
                abort_element(element, None);
                continue;
            }
            if element.status() != JobStatus::New {
                continue;
            }
            blocking_execute(element);
            free_queue_policy_resources(element);
        }
    }

    /// Finish a collection whose elements were never fanned out.
    fn finish_unlaunched(&self, job: &JobPointer, thread: &Thread, status: JobStatus, error: Option<String>) {
        let launched = std::mem::replace(&mut self.tracker.lock().launched, true);
        if launched {
            if let Some(message) = error {
                warn!(collection = self.state.id(), error = %message, "collection executor failed after starting its elements");
            }
            return;
        }
        complete(job, thread.weaver(), thread.id(), status, error);
    }
}

impl Default for JobCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl Job for JobCollection {
    fn state(&self) -> &JobState {
        &self.state
    }

    /// Fan the elements out, into the weaver running the collection or
    /// inline when there is none. Returns once they are handed over; the
    /// collection finishes when its last element does.
    fn run(&self, job: &JobPointer, thread: &Thread) -> AppResult<()> {
        let elements = self.elements();
        {
            let mut tracker = self.tracker.lock();
            if tracker.launched {
                return Ok(());
            }
            tracker.launched = true;
            tracker.remaining = elements.len();
            tracker.stopped |= self.state.is_abort_requested();
            tracker.weaver = thread.weaver().cloned();
            tracker.thread = thread.id();
            tracker.pending.clone_from(&elements);
        }
        if elements.is_empty() {
            let status = if self.state.is_abort_requested() {
                JobStatus::Aborted
            } else {
                JobStatus::Success
            };
            complete(job, thread.weaver(), thread.id(), status, None);
            return Ok(());
        }
        if self.sequential {
            for pair in elements.windows(2) {
                if let Err(err) = self.dependencies.add_dependency(&pair[1], &pair[0]) {
                    warn!(collection = self.state.id(), job_id = pair[1].id(), error = %err, "could not chain sequence element");
                }
            }
        }

        let parent = Arc::downgrade(job);
        for element in &elements {
            let tracker = Arc::clone(&self.tracker);
            let parent = parent.clone();
            let sequential = self.sequential;
            let id = element.id();
            element
                .state()
                .on_finished(move |status| element_finished(&tracker, &parent, id, status, sequential));
        }

        debug!(
            collection = self.state.id(),
            elements = elements.len(),
            sequential = self.sequential,
            "collection started"
        );
        match thread.weaver() {
            Some(weaver) => self.enqueue_elements(weaver, &elements),
            None => self.run_inline(&elements),
        }
        Ok(())
    }

    fn execute(&self, job: &JobPointer, thread: &Thread) {
        if !self.state.mark_running() {
            debug!(collection = self.state.id(), status = %self.state.status(), "collection not runnable, skipping");
            return;
        }
        let executor = self.state.executor();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            executor.begin(job, thread);
            executor.execute(job, thread)
        }));
        match outcome {
            // An executor that never called `run` leaves nothing to wait for.
            Ok(Ok(())) => self.finish_unlaunched(job, thread, JobStatus::Success, None),
            Ok(Err(err)) => self.finish_unlaunched(job, thread, JobStatus::Failed, Some(format!("{err:#}"))),
            Err(payload) => {
                self.finish_unlaunched(job, thread, JobStatus::Failed, Some(panic_message(payload.as_ref())));
            }
        }
    }

    fn request_abort(&self) {
        self.state.request_abort();
        self.stop();
        for element in self.elements() {
            element.request_abort();
        }
    }
}

/// Abort an element that was never queued. Elements someone else already
/// queued or ran are left to finish on their own.
fn abort_element(element: &JobPointer, error: Option<String>) {
    if element.state().abort_unqueued(error) {
        free_queue_policy_resources(element);
    }
}

/// Dequeue what is still queued. Elements not yet enqueued are caught by
/// the halted check; running ones complete.
fn cancel(weaver: Option<&WeaverHandle>, pending: &[JobPointer]) {
    let Some(weaver) = weaver else {
        return;
    };
    for job in pending {
        if !job.is_finished() {
            weaver.dequeue(job);
        }
    }
}

fn complete(parent: &JobPointer, weaver: Option<&WeaverHandle>, thread: usize, status: JobStatus, error: Option<String>) {
    debug!(collection = parent.id(), status = %status, "collection finished");
    end_executor(&parent.executor(), parent, thread, status, error.as_deref());
    parent.state().finish(status, error);
    if let Some(weaver) = weaver {
        weaver.core().report_outcome(thread, parent);
    }
}

fn element_finished(
    tracker: &Mutex<Tracker>,
    parent: &Weak<dyn Job>,
    element: JobId,
    status: JobStatus,
    sequential: bool,
) {
    let mut guard = tracker.lock();
    if guard.remaining == 0 {
        return;
    }
    guard.remaining -= 1;
    guard.pending.retain(|job| job.id() != element);

    let mut cancelled = Vec::new();
    if status != JobStatus::Success && guard.failure.is_none() {
        guard.failure = Some(format!("element {element} {status}"));
        if sequential && guard.remaining > 0 {
            cancelled = std::mem::take(&mut guard.pending);
        }
    }
    let weaver = guard.weaver.clone();
    let outcome = (guard.remaining == 0).then(|| {
        let stopped = guard.stopped;
        let failure = guard.failure.take();
        guard.weaver = None;
        guard.pending.clear();
        (stopped, failure, guard.thread)
    });
    drop(guard);

    if !cancelled.is_empty() {
        debug!(element, cancelled = cancelled.len(), "sequence element did not succeed, cancelling the rest");
        cancel(weaver.as_ref(), &cancelled);
    }

    let Some((stopped, failure, thread)) = outcome else {
        return;
    };
    let Some(parent) = parent.upgrade() else {
        return;
    };
    let status = match &failure {
        None => JobStatus::Success,
        Some(_) if stopped || parent.should_abort() => JobStatus::Aborted,
        Some(_) => JobStatus::Failed,
    };
    complete(&parent, weaver.as_ref(), thread, status, failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::{EventExecutor, JobEvent};
    use crate::core::lambda::Lambda;

    fn recording(log: &Arc<Mutex<String>>, tag: char) -> JobPointer {
        let log = Arc::clone(log);
        Arc::new(Lambda::new(move || {
            log.lock().push(tag);
            Ok(())
        }))
    }

    #[test]
    fn test_empty_collection_succeeds() {
        let collection: JobPointer = Arc::new(JobCollection::new());
        assert_eq!(blocking_execute(&collection), JobStatus::Success);
    }

    #[test]
    fn test_inline_sequence_runs_in_order() {
        let log = Arc::new(Mutex::new(String::new()));
        let sequence = Arc::new(JobCollection::sequence());
        for tag in ['a', 'b', 'c'] {
            sequence.add_job(recording(&log, tag)).unwrap();
        }
        let job: JobPointer = sequence.clone();
        assert_eq!(blocking_execute(&job), JobStatus::Success);
        assert_eq!(log.lock().as_str(), "abc");
        assert!(sequence.is_sequence());
        assert_eq!(sequence.len(), 3);
    }

    #[test]
    fn test_inline_sequence_stops_at_failure() {
        let log = Arc::new(Mutex::new(String::new()));
        let sequence = Arc::new(JobCollection::sequence());
        sequence.add_job(recording(&log, 'a')).unwrap();
        let failing: JobPointer = Arc::new(Lambda::new(|| Err(anyhow::anyhow!("broken"))));
        sequence.add_job(Arc::clone(&failing)).unwrap();
        let skipped = recording(&log, 'z');
        sequence.add_job(Arc::clone(&skipped)).unwrap();

        let job: JobPointer = sequence;
        assert_eq!(blocking_execute(&job), JobStatus::Failed);
        assert_eq!(log.lock().as_str(), "a");
        assert_eq!(failing.status(), JobStatus::Failed);
        assert_eq!(skipped.status(), JobStatus::Aborted);
    }

    #[test]
    fn test_parallel_collection_runs_everything() {
        let log = Arc::new(Mutex::new(String::new()));
        let collection = Arc::new(JobCollection::new());
        collection.add_job(Arc::new(Lambda::new(|| Err(anyhow::anyhow!("one bad"))))).unwrap();
        collection.add_job(recording(&log, 'x')).unwrap();

        let job: JobPointer = collection;
        assert_eq!(blocking_execute(&job), JobStatus::Failed);
        assert_eq!(log.lock().as_str(), "x");
    }

    #[test]
    fn test_add_job_rejected_after_start() {
        let collection = Arc::new(JobCollection::new());
        let job: JobPointer = collection.clone();
        blocking_execute(&job);
        assert!(collection.add_job(Arc::new(Lambda::new(|| Ok(())))).is_err());
    }

    #[test]
    fn test_abort_before_start() {
        let log = Arc::new(Mutex::new(String::new()));
        let collection = Arc::new(JobCollection::new());
        collection.add_job(recording(&log, 'a')).unwrap();
        let job: JobPointer = collection;
        job.request_abort();
        assert_eq!(blocking_execute(&job), JobStatus::Aborted);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_duplicate_elements_rejected() {
        let collection = Arc::new(JobCollection::new());
        let element: JobPointer = Arc::new(Lambda::new(|| Ok(())));
        collection.add_job(Arc::clone(&element)).unwrap();
        assert!(matches!(
            collection.add_job(Arc::clone(&element)),
            Err(WeaverError::DuplicateElement(id)) if id == element.id()
        ));
        let itself: JobPointer = collection.clone();
        assert!(collection.add_job(itself).is_err());
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_executor_brackets_the_whole_sequence() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let log = Arc::new(Mutex::new(String::new()));
        let sequence = Arc::new(JobCollection::sequence());
        let (a, b) = (recording(&log, 'a'), recording(&log, 'b'));
        for element in [&a, &b] {
            EventExecutor::attach(element, tx.clone()).unwrap();
            sequence.add_job(Arc::clone(element)).unwrap();
        }
        let job: JobPointer = sequence;
        EventExecutor::attach(&job, tx).unwrap();

        assert_eq!(blocking_execute(&job), JobStatus::Success);
        let order: Vec<(bool, JobId)> = rx
            .try_iter()
            .map(|event| match event {
                JobEvent::Started { job, .. } => (true, job),
                JobEvent::Done { job, .. } | JobEvent::Failed { job, .. } => (false, job),
            })
            .collect();
        assert_eq!(
            order,
            vec![
                (true, job.id()),
                (true, a.id()),
                (false, a.id()),
                (true, b.id()),
                (false, b.id()),
                (false, job.id()),
            ]
        );
    }

    #[test]
    fn test_empty_collection_reports_to_its_executor() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let job: JobPointer = Arc::new(JobCollection::new());
        EventExecutor::attach(&job, tx).unwrap();
        assert_eq!(blocking_execute(&job), JobStatus::Success);

        let events: Vec<JobEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], JobEvent::Done { job: id, .. } if id == job.id()));
    }

    #[test]
    fn test_failed_sequence_reports_failure_to_its_executor() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sequence = Arc::new(JobCollection::sequence());
        sequence.add_job(Arc::new(Lambda::new(|| Err(anyhow::anyhow!("broken"))))).unwrap();
        let job: JobPointer = sequence;
        EventExecutor::attach(&job, tx).unwrap();
        assert_eq!(blocking_execute(&job), JobStatus::Failed);

        let last = rx.try_iter().last();
        assert!(matches!(last, Some(JobEvent::Failed { job: id, .. }) if id == job.id()));
    }
}
