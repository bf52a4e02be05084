//! Passive observers of weaver activity.
//!
//! Observers are told about state changes, thread activity and job outcomes.
//! They are called outside the weaver's lock and may attach or detach at any
//! time. A panicking observer is logged and skipped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use super::job::JobId;
use super::weaver::WeaverState;

/// Handle returned when an observer is registered.
pub type ObserverId = u64;

/// Something that happened inside a weaver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WeaverEvent {
    /// The weaver entered a new state.
    StateChanged {
        /// New state.
        state: WeaverState,
    },
    /// A worker thread came up.
    ThreadStarted {
        /// Thread id.
        thread: usize,
    },
    /// A worker thread picked up a job.
    ThreadBusy {
        /// Thread id.
        thread: usize,
        /// Job id.
        job: JobId,
    },
    /// A worker thread is parked because the weaver is suspended.
    ThreadSuspended {
        /// Thread id.
        thread: usize,
    },
    /// A worker thread exited.
    ThreadExited {
        /// Thread id.
        thread: usize,
    },
    /// A job started executing.
    JobStarted {
        /// Job id.
        job: JobId,
        /// Thread id.
        thread: usize,
    },
    /// A job finished successfully.
    JobDone {
        /// Job id.
        job: JobId,
        /// Thread id.
        thread: usize,
    },
    /// A job finished without success.
    JobFailed {
        /// Job id.
        job: JobId,
        /// Thread id.
        thread: usize,
        /// Recorded failure message.
        error: Option<String>,
    },
    /// A job was removed from the queue before it ran.
    JobAborted {
        /// Job id.
        job: JobId,
    },
}

/// Receives weaver events.
pub trait WeaverObserver: Send + Sync {
    /// Handle one event. Must not block for long.
    fn on_event(&self, event: &WeaverEvent);
}

impl<F> WeaverObserver for F
where
    F: Fn(&WeaverEvent) + Send + Sync,
{
    fn on_event(&self, event: &WeaverEvent) {
        self(event);
    }
}

/// Observer that forwards every event into a channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    events: Sender<WeaverEvent>,
}

impl ChannelObserver {
    /// Observer with an unbounded channel, plus its receiving end.
    #[must_use]
    pub fn unbounded() -> (Self, Receiver<WeaverEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        (Self { events }, rx)
    }

    /// Observer writing into an existing sender.
    #[must_use]
    pub const fn with_sender(events: Sender<WeaverEvent>) -> Self {
        Self { events }
    }
}

impl WeaverObserver for ChannelObserver {
    fn on_event(&self, event: &WeaverEvent) {
        let _ = self.events.send(event.clone());
    }
}

/// Registered observers of one weaver.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Arc<dyn WeaverObserver>)>>,
}

impl ObserverRegistry {
    pub fn register(&self, observer: Arc<dyn WeaverObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        id
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver `events` to a snapshot of the observers, so callbacks may
    /// register or unregister without deadlocking.
    pub fn dispatch(&self, events: &[WeaverEvent]) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn WeaverObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in &observers {
            for event in events {
                if panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
                    warn!(?event, "observer panicked while handling event");
                }
            }
        }
    }
}
