//! Weaver coordinator: shared state, the dequeue loop and the public handles.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{WeaverCounters, WeaverState, WeaverStats};
use crate::config::{SpawnMode, WeaverConfig};
use crate::core::error::WeaverError;
use crate::core::job::{free_queue_policy_resources, JobPointer, JobStatus};
use crate::core::observer::{ObserverId, ObserverRegistry, WeaverEvent, WeaverObserver};
use crate::core::queue::PendingQueue;
use crate::core::thread::{spawn_worker, ThreadStatus};

static GLOBAL: Mutex<Option<Arc<Weaver>>> = parking_lot::const_mutex(None);

struct ThreadSlot {
    id: usize,
    status: ThreadStatus,
    job: Option<JobPointer>,
}

struct Inner {
    state: WeaverState,
    queue: PendingQueue,
    max_threads: usize,
    threads: Vec<ThreadSlot>,
    /// Threads between dequeue and `job_done`.
    active: usize,
    next_thread_id: usize,
}

impl Inner {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active == 0
    }

    fn slot_mut(&mut self, id: usize) -> Option<&mut ThreadSlot> {
        self.threads.iter_mut().find(|slot| slot.id == id)
    }

    fn has_idle_thread(&self) -> bool {
        self.threads.iter().any(|slot| slot.status == ThreadStatus::Idle)
    }

    fn retire(&mut self, id: usize) {
        self.threads.retain(|slot| slot.id != id);
    }
}

/// State shared by the owning [`Weaver`], its handles and its threads.
pub(crate) struct WeaverCore {
    id: Uuid,
    config: WeaverConfig,
    inner: Mutex<Inner>,
    wakeup: Condvar,
    observers: ObserverRegistry,
    counters: WeaverCounters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WeaverCore {
    fn new(config: WeaverConfig) -> Self {
        let max_threads = config.thread_count;
        Self {
            id: Uuid::new_v4(),
            config,
            inner: Mutex::new(Inner {
                state: WeaverState::InConstruction,
                queue: PendingQueue::default(),
                max_threads,
                threads: Vec::with_capacity(max_threads),
                active: 0,
                next_thread_id: 0,
            }),
            wakeup: Condvar::new(),
            observers: ObserverRegistry::default(),
            counters: WeaverCounters::default(),
            workers: Mutex::new(Vec::with_capacity(max_threads)),
        }
    }

    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) const fn config(&self) -> &WeaverConfig {
        &self.config
    }

    pub(crate) const fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    fn spawn_thread(self: &Arc<Self>, inner: &mut Inner) -> Result<(), WeaverError> {
        let id = inner.next_thread_id;
        inner.next_thread_id += 1;
        inner.threads.push(ThreadSlot {
            id,
            status: ThreadStatus::Idle,
            job: None,
        });
        match spawn_worker(self, id) {
            Ok(handle) => {
                let mut workers = self.workers.lock();
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
                Ok(())
            }
            Err(err) => {
                inner.retire(id);
                Err(WeaverError::ThreadSpawn(err))
            }
        }
    }

    /// Spawn up to the maximum thread count.
    fn fill_threads(self: &Arc<Self>, inner: &mut Inner) -> Result<(), WeaverError> {
        while inner.threads.len() < inner.max_threads {
            self.spawn_thread(inner)?;
        }
        Ok(())
    }

    /// Block until a job is admitted for `thread_id`. `None` tells the
    /// thread to exit.
    pub(crate) fn next_job(&self, thread_id: usize) -> Option<JobPointer> {
        let mut inner = self.inner.lock();
        let mut announced = false;
        loop {
            if inner.threads.len() > inner.max_threads {
                inner.retire(thread_id);
                drop(inner);
                debug!(weaver = %self.id, thread_id = thread_id, "retiring surplus worker thread");
                self.wakeup.notify_all();
                return None;
            }

            let state = inner.state;
            if matches!(state, WeaverState::WorkingHard | WeaverState::ShuttingDown) {
                if let Some(job) = inner.queue.take_eligible() {
                    job.about_to_be_dequeued_locked();
                    inner.active += 1;
                    if let Some(slot) = inner.slot_mut(thread_id) {
                        slot.status = ThreadStatus::Busy;
                        slot.job = Some(Arc::clone(&job));
                    }
                    return Some(job);
                }
            }

            if matches!(state, WeaverState::ShuttingDown | WeaverState::Destructed) && inner.queue.is_empty() {
                inner.retire(thread_id);
                drop(inner);
                self.wakeup.notify_all();
                return None;
            }

            let parked = matches!(state, WeaverState::Suspending | WeaverState::Suspended);
            if let Some(slot) = inner.slot_mut(thread_id) {
                slot.status = if parked {
                    ThreadStatus::Suspended
                } else {
                    ThreadStatus::Idle
                };
            }
            if !parked {
                announced = false;
            } else if !announced {
                announced = true;
                MutexGuard::unlocked(&mut inner, || {
                    self.observers
                        .dispatch(&[WeaverEvent::ThreadSuspended { thread: thread_id }]);
                });
                continue;
            }

            match self.config.repoll_interval() {
                Some(interval) if !parked && !inner.queue.is_empty() => {
                    self.wakeup.wait_for(&mut inner, interval);
                }
                _ => self.wakeup.wait(&mut inner),
            }
        }
    }

    /// Bookkeeping after `thread_id` ran `job` and freed its policies.
    /// Count a finished job and tell observers, once per job. Collections
    /// reach this twice: when their `execute` returns and again when their
    /// last element finishes.
    pub(crate) fn report_outcome(&self, thread_id: usize, job: &JobPointer) {
        let status = job.status();
        if !status.is_finished() || !job.state().claim_outcome_report() {
            return;
        }
        let event = match status {
            JobStatus::Success => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                WeaverEvent::JobDone {
                    job: job.id(),
                    thread: thread_id,
                }
            }
            _ => {
                let counter = if status == JobStatus::Failed {
                    &self.counters.failed
                } else {
                    &self.counters.aborted
                };
                counter.fetch_add(1, Ordering::Relaxed);
                WeaverEvent::JobFailed {
                    job: job.id(),
                    thread: thread_id,
                    error: job.state().error(),
                }
            }
        };
        self.observers.dispatch(&[event]);
    }

    pub(crate) fn job_done(&self, thread_id: usize, job: &JobPointer) {
        self.report_outcome(thread_id, job);

        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.active = inner.active.saturating_sub(1);
            if let Some(slot) = inner.slot_mut(thread_id) {
                slot.status = ThreadStatus::Idle;
                slot.job = None;
            }
            if inner.state == WeaverState::Suspending && inner.active == 0 {
                inner.state = WeaverState::Suspended;
                info!(weaver = %self.id, "weaver suspended");
                events.push(WeaverEvent::StateChanged {
                    state: WeaverState::Suspended,
                });
            }
        }
        self.wakeup.notify_all();
        self.observers.dispatch(&events);
    }

    /// Finish jobs that left the queue without running.
    fn abort_unstarted(&self, jobs: Vec<JobPointer>) {
        if jobs.is_empty() {
            return;
        }
        let mut events = Vec::with_capacity(jobs.len());
        for job in jobs {
            free_queue_policy_resources(&job);
            if job.state().finish(JobStatus::Aborted, None) && job.state().claim_outcome_report() {
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
                events.push(WeaverEvent::JobAborted { job: job.id() });
            }
            debug!(weaver = %self.id, job_id = job.id(), "job dequeued before running");
        }
        self.wakeup.notify_all();
        self.observers.dispatch(&events);
    }

    fn set_state(&self, state: WeaverState) {
        self.inner.lock().state = state;
        self.wakeup.notify_all();
        self.observers.dispatch(&[WeaverEvent::StateChanged { state }]);
    }

    /// Join worker threads, detaching any that outlive `timeout`.
    fn join_workers(&self, timeout: Duration) {
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            let name = worker.thread().name().unwrap_or("worker").to_string();
            let (tx, rx) = crossbeam_channel::bounded(1);
            let joiner = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });
            match rx.recv_timeout(timeout) {
                Ok(true) => debug!(weaver = %self.id, thread = %name, "worker joined"),
                Ok(false) => warn!(weaver = %self.id, thread = %name, "worker panicked"),
                Err(_) => {
                    warn!(weaver = %self.id, thread = %name, "worker did not exit within timeout, detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }
    }
}

/// Cheap, cloneable access to a weaver's queue.
///
/// Handles never shut the weaver down; only the owning [`Weaver`] does.
#[derive(Clone)]
pub struct WeaverHandle {
    core: Arc<WeaverCore>,
}

impl WeaverHandle {
    pub(crate) const fn from_core(core: Arc<WeaverCore>) -> Self {
        Self { core }
    }

    pub(crate) const fn core(&self) -> &Arc<WeaverCore> {
        &self.core
    }

    /// Identifier used in log output.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Queue a job.
    ///
    /// # Errors
    ///
    /// [`WeaverError::NotAcceptingWork`] once shutdown started;
    /// [`WeaverError::InvalidJobState`] if the job is not new.
    pub fn enqueue(&self, job: JobPointer) -> Result<(), WeaverError> {
        let core = &self.core;
        let mut inner = core.inner.lock();
        if !inner.state.accepts_work() {
            warn!(weaver = %core.id, job_id = job.id(), state = ?inner.state, "rejecting job, weaver is not accepting work");
            return Err(WeaverError::NotAcceptingWork);
        }
        job.state().mark_queued()?;
        for policy in job.state().policies() {
            policy.about_to_be_queued(&job);
        }
        job.about_to_be_queued_locked();
        let job_id = job.id();
        inner.queue.insert(job);
        core.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if core.config.spawn_mode == SpawnMode::Lazy
            && !inner.has_idle_thread()
            && inner.threads.len() < inner.max_threads
        {
            if let Err(err) = core.spawn_thread(&mut inner) {
                error!(weaver = %core.id, error = %err, "failed to spawn worker thread on demand");
            }
        }
        debug!(weaver = %core.id, job_id = job_id, queued = inner.queue.len(), "job enqueued");
        drop(inner);
        core.wakeup.notify_all();
        Ok(())
    }

    /// Queue several jobs in order, stopping at the first rejection. Jobs
    /// queued before the failure stay queued.
    ///
    /// # Errors
    ///
    /// The first error from [`WeaverHandle::enqueue`].
    pub fn enqueue_all(&self, jobs: impl IntoIterator<Item = JobPointer>) -> Result<(), WeaverError> {
        jobs.into_iter().try_for_each(|job| self.enqueue(job))
    }

    /// Cancel a job that has not started. Its policies are freed and it
    /// finishes as aborted. Returns false if the job was not pending.
    pub fn dequeue(&self, job: &JobPointer) -> bool {
        let removed = {
            let mut inner = self.core.inner.lock();
            let removed = inner.queue.remove(job.id());
            if let Some(job) = &removed {
                job.about_to_be_dequeued_locked();
            }
            removed
        };
        match removed {
            Some(job) => {
                self.core.abort_unstarted(vec![job]);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending job. Returns how many were removed.
    pub fn dequeue_all(&self) -> usize {
        let removed = {
            let mut inner = self.core.inner.lock();
            let removed = inner.queue.drain();
            for job in &removed {
                job.about_to_be_dequeued_locked();
            }
            removed
        };
        let count = removed.len();
        self.core.abort_unstarted(removed);
        count
    }

    /// Stop starting new jobs. Running jobs complete; the weaver reports
    /// `Suspended` once the last of them finished. No-op unless working.
    pub fn suspend(&self) {
        let state = {
            let mut inner = self.core.inner.lock();
            if inner.state != WeaverState::WorkingHard {
                return;
            }
            inner.state = if inner.active == 0 {
                WeaverState::Suspended
            } else {
                WeaverState::Suspending
            };
            inner.state
        };
        info!(weaver = %self.core.id, state = ?state, "suspend requested");
        self.core.wakeup.notify_all();
        self.core
            .observers
            .dispatch(&[WeaverEvent::StateChanged { state }]);
    }

    /// Resume after [`WeaverHandle::suspend`]. No-op unless suspended.
    pub fn resume(&self) {
        {
            let mut inner = self.core.inner.lock();
            if !matches!(inner.state, WeaverState::Suspending | WeaverState::Suspended) {
                return;
            }
            inner.state = WeaverState::WorkingHard;
        }
        info!(weaver = %self.core.id, "weaver resumed");
        self.core.wakeup.notify_all();
        self.core.observers.dispatch(&[WeaverEvent::StateChanged {
            state: WeaverState::WorkingHard,
        }]);
    }

    /// Block until the queue is empty and no thread runs a job.
    ///
    /// Blocks forever if a pending job is never admitted by its policies,
    /// or while the weaver stays suspended with jobs pending. Must not be
    /// called from a job running on this weaver.
    pub fn finish(&self) {
        let mut inner = self.core.inner.lock();
        while !inner.is_idle() {
            self.core.wakeup.wait(&mut inner);
        }
    }

    /// [`WeaverHandle::finish`] with an upper bound. Returns whether the
    /// weaver became idle.
    pub fn finish_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.core.inner.lock();
        while !inner.is_idle() {
            if self.core.wakeup.wait_until(&mut inner, deadline).timed_out() {
                return inner.is_idle();
            }
        }
        true
    }

    /// Whether the queue is empty and no thread runs a job.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.core.inner.lock().is_idle()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.inner.lock().queue.is_empty()
    }

    /// Number of pending jobs.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.core.inner.lock().queue.len()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WeaverState {
        self.core.inner.lock().state
    }

    /// Live worker threads.
    #[must_use]
    pub fn current_number_of_threads(&self) -> usize {
        self.core.inner.lock().threads.len()
    }

    /// Configured maximum number of threads.
    #[must_use]
    pub fn maximum_number_of_threads(&self) -> usize {
        self.core.inner.lock().max_threads
    }

    /// Resize the pool. Growing spawns threads right away in eager mode;
    /// shrinking retires threads as they become idle, never mid-job.
    ///
    /// # Errors
    ///
    /// [`WeaverError::InvalidConfig`] for zero, or
    /// [`WeaverError::ThreadSpawn`] when a new thread cannot start.
    pub fn set_maximum_number_of_threads(&self, count: usize) -> Result<(), WeaverError> {
        if count == 0 {
            return Err(WeaverError::InvalidConfig(
                "maximum number of threads must be greater than 0".into(),
            ));
        }
        {
            let mut inner = self.core.inner.lock();
            inner.max_threads = count;
            if inner.state.accepts_work() {
                match self.core.config.spawn_mode {
                    SpawnMode::Eager => self.core.fill_threads(&mut inner)?,
                    SpawnMode::Lazy => {
                        if !inner.queue.is_empty() && !inner.has_idle_thread() && inner.threads.len() < count {
                            self.core.spawn_thread(&mut inner)?;
                        }
                    }
                }
            }
        }
        info!(weaver = %self.core.id, max_threads = count, "thread pool resized");
        self.core.wakeup.notify_all();
        Ok(())
    }

    /// Attach an observer.
    pub fn register_observer(&self, observer: Arc<dyn WeaverObserver>) -> ObserverId {
        self.core.observers.register(observer)
    }

    /// Detach an observer. Returns whether it was attached.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.core.observers.unregister(id)
    }

    /// Number of attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.core.observers.len()
    }

    /// Wake every thread to re-run admission, e.g. after a policy changed
    /// outside any job.
    pub fn reschedule(&self) {
        self.core.wakeup.notify_all();
    }

    /// Ask every running job to abort. Advisory.
    pub fn request_abort(&self) {
        let running: Vec<JobPointer> = self
            .core
            .inner
            .lock()
            .threads
            .iter()
            .filter_map(|slot| slot.job.clone())
            .collect();
        for job in running {
            job.request_abort();
        }
    }

    /// Utilisation snapshot.
    #[must_use]
    pub fn stats(&self) -> WeaverStats {
        let inner = self.core.inner.lock();
        self.core
            .counters
            .snapshot(inner.threads.len(), inner.max_threads, inner.active, inner.queue.len())
    }
}

impl fmt::Debug for WeaverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeaverHandle").field("id", &self.core.id).finish()
    }
}

/// Owner of a weaver. Dropping it shuts the weaver down.
///
/// Queue operations live on [`WeaverHandle`], which `Weaver` dereferences to.
pub struct Weaver {
    handle: WeaverHandle,
}

impl Weaver {
    /// Start a weaver.
    ///
    /// # Errors
    ///
    /// [`WeaverError::InvalidConfig`] for an invalid configuration,
    /// [`WeaverError::ThreadSpawn`] when a worker cannot start.
    pub fn new(config: WeaverConfig) -> Result<Self, WeaverError> {
        config.validate().map_err(WeaverError::InvalidConfig)?;
        let core = Arc::new(WeaverCore::new(config));
        let weaver = Self {
            handle: WeaverHandle::from_core(Arc::clone(&core)),
        };
        {
            let mut inner = core.inner.lock();
            inner.state = WeaverState::WorkingHard;
            if core.config.spawn_mode == SpawnMode::Eager {
                core.fill_threads(&mut inner)?;
            }
        }
        info!(
            weaver = %core.id,
            max_threads = core.config.thread_count,
            spawn_mode = ?core.config.spawn_mode,
            "weaver initialized"
        );
        Ok(weaver)
    }

    /// Start a weaver with default settings and `count` threads.
    ///
    /// # Errors
    ///
    /// See [`Weaver::new`].
    pub fn with_thread_count(count: usize) -> Result<Self, WeaverError> {
        Self::new(WeaverConfig::default().with_thread_count(count))
    }

    /// The process-wide weaver, created on first use from `WEAVER_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Configuration or thread spawn failures on first use.
    pub fn instance() -> Result<Arc<Self>, WeaverError> {
        let mut global = GLOBAL.lock();
        if let Some(weaver) = global.as_ref() {
            return Ok(Arc::clone(weaver));
        }
        let config = WeaverConfig::from_env().map_err(WeaverError::InvalidConfig)?;
        let weaver = Arc::new(Self::new(config)?);
        *global = Some(Arc::clone(&weaver));
        Ok(weaver)
    }

    /// Forget the process-wide weaver. It shuts down once the last `Arc`
    /// handed out by [`Weaver::instance`] is dropped. Returns whether one
    /// existed.
    pub fn release_instance() -> bool {
        let released = GLOBAL.lock().take();
        released.is_some()
    }

    /// A cloneable handle to this weaver's queue.
    #[must_use]
    pub fn handle(&self) -> WeaverHandle {
        self.handle.clone()
    }

    /// Stop accepting work, drain the queue, abort what is left once
    /// `shutdown_timeout_secs` passed, and join the threads. Idempotent.
    pub fn shutdown(&self) {
        let core = self.handle.core();
        {
            let mut inner = core.inner.lock();
            if matches!(inner.state, WeaverState::ShuttingDown | WeaverState::Destructed) {
                return;
            }
            inner.state = WeaverState::ShuttingDown;
        }
        info!(weaver = %core.id, "shutting down weaver");
        core.wakeup.notify_all();
        core.observers.dispatch(&[WeaverEvent::StateChanged {
            state: WeaverState::ShuttingDown,
        }]);

        let timeout = core.config.shutdown_timeout();
        if !self.handle.finish_timeout(timeout) {
            warn!(
                weaver = %core.id,
                pending = self.handle.queue_length(),
                "jobs still pending at shutdown timeout, aborting them"
            );
        }
        self.handle.dequeue_all();
        self.handle.request_abort();
        core.join_workers(timeout);
        core.set_state(WeaverState::Destructed);
        info!(weaver = %core.id, "weaver shut down");
    }
}

impl Deref for Weaver {
    type Target = WeaverHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Weaver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Weaver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weaver").field("id", &self.handle.core.id).finish()
    }
}
