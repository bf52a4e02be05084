//! Jobs, queue policies, executors and the weaver that runs them.

pub mod collection;
pub mod error;
pub mod executor;
pub mod job;
pub mod lambda;
pub mod observer;
pub mod policy;
mod queue;
pub mod thread;
pub mod weaver;

pub use collection::JobCollection;
pub use error::{AppResult, WeaverError};
pub use executor::{DefaultExecutor, EventExecutor, Executor, JobEvent, TimingExecutor};
pub use job::{blocking_execute, execute_with_executor, Job, JobId, JobPointer, JobState, JobStatus};
pub use lambda::Lambda;
pub use observer::{ChannelObserver, ObserverId, WeaverEvent, WeaverObserver};
pub use policy::{DependencyPolicy, QueuePolicy, ResourceRestrictionPolicy};
pub use thread::{Thread, ThreadStatus, DETACHED_THREAD_ID};
pub use weaver::{Weaver, WeaverHandle, WeaverState, WeaverStats};
