//! Worker threads and the context jobs run with.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self as std_thread, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::job::{free_queue_policy_resources, panic_message, JobPointer, JobStatus};
use super::observer::WeaverEvent;
use super::weaver::{WeaverCore, WeaverHandle};

/// Id reported by the context of [`crate::core::blocking_execute`].
pub const DETACHED_THREAD_ID: usize = usize::MAX;

/// What a worker thread is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Waiting for an eligible job.
    Idle,
    /// Executing a job.
    Busy,
    /// Parked while the weaver is suspended.
    Suspended,
}

/// The thread a job is running on, as seen by the job.
#[derive(Debug)]
pub struct Thread {
    id: usize,
    name: String,
    weaver: Option<WeaverHandle>,
}

impl Thread {
    pub(crate) fn new(id: usize, name: String, weaver: WeaverHandle) -> Self {
        Self {
            id,
            name,
            weaver: Some(weaver),
        }
    }

    /// Context for jobs run outside any weaver.
    pub(crate) fn detached() -> Self {
        Self {
            id: DETACHED_THREAD_ID,
            name: "detached".to_string(),
            weaver: None,
        }
    }

    /// Thread id, unique within its weaver.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// OS thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The weaver owning this thread; `None` for [`crate::core::blocking_execute`].
    #[must_use]
    pub const fn weaver(&self) -> Option<&WeaverHandle> {
        self.weaver.as_ref()
    }
}

pub(crate) fn spawn_worker(core: &Arc<WeaverCore>, id: usize) -> io::Result<JoinHandle<()>> {
    let config = core.config();
    let name = format!("{}-{id}", config.thread_name_prefix);
    let stack_size = config.thread_stack_size;
    let thread = Thread::new(id, name.clone(), WeaverHandle::from_core(Arc::clone(core)));
    std_thread::Builder::new()
        .name(name)
        .stack_size(stack_size)
        .spawn(move || worker_loop(&thread))
}

fn worker_loop(thread: &Thread) {
    let Some(weaver) = thread.weaver() else {
        return;
    };
    let core = weaver.core();
    let id = thread.id();
    debug!(weaver = %core.id(), thread_id = id, "worker thread started");
    core.observers()
        .dispatch(&[WeaverEvent::ThreadStarted { thread: id }]);

    while let Some(job) = core.next_job(id) {
        core.observers().dispatch(&[
            WeaverEvent::ThreadBusy { thread: id, job: job.id() },
            WeaverEvent::JobStarted { job: job.id(), thread: id },
        ]);
        debug!(weaver = %core.id(), thread_id = id, job_id = job.id(), "executing job");
        run_contained(&job, thread);
        core.job_done(id, &job);
    }

    core.observers()
        .dispatch(&[WeaverEvent::ThreadExited { thread: id }]);
    debug!(weaver = %core.id(), thread_id = id, "worker thread exiting");
}

/// Execute and free the job's policies; panics from either are logged and
/// never take the worker down.
fn run_contained(job: &JobPointer, thread: &Thread) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.execute(job, thread))) {
        let message = panic_message(payload.as_ref());
        warn!(thread_id = thread.id(), job_id = job.id(), error = %message, "job execution panicked");
        job.state().finish(JobStatus::Failed, Some(message));
    }
    if panic::catch_unwind(AssertUnwindSafe(|| free_queue_policy_resources(job))).is_err() {
        warn!(thread_id = thread.id(), job_id = job.id(), "queue policy panicked while freeing");
    }
}
