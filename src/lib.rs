//! # Prometheus Weaver
//!
//! A thread-pool job scheduler with pluggable admission control.
//!
//! Work is submitted as jobs to a [`core::Weaver`], which keeps them in a
//! priority-ordered queue and hands them to a fixed pool of worker threads.
//! Before a job may start, every [`core::QueuePolicy`] attached to it must
//! admit it, which is how concurrency caps and ordering constraints are
//! expressed without the jobs knowing about each other.
//!
//! ## Key Features
//!
//! - **Priority queue**: higher priority first, FIFO within a priority
//! - **Resource restriction**: at most N jobs sharing a policy run at once
//! - **Dependencies**: a job starts only after the jobs it depends on succeeded
//! - **Collections and sequences**: composite jobs that fan out into the weaver
//! - **Suspend, resume and finish**: pause dispatch or wait for the pool to drain
//! - **Observers**: thread and job lifecycle events, in-process or over a channel
//! - **Executors**: decorate how a job runs (timing, event streams)
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_weaver::core::{JobPointer, Lambda, ResourceRestrictionPolicy, Weaver};
//!
//! prometheus_weaver::util::init_tracing();
//! let weaver = Weaver::with_thread_count(8)?;
//!
//! // Never more than two uploads at a time.
//! let uploads = Arc::new(ResourceRestrictionPolicy::named("uploads", 2));
//! for file in files {
//!     let job: JobPointer = Arc::new(Lambda::new(move || upload(&file)));
//!     job.assign_queue_policy(uploads.clone())?;
//!     weaver.enqueue(job)?;
//! }
//! weaver.finish();
//! ```
//!
//! ## Configuration
//!
//! [`config::WeaverConfig`] can be built in code, parsed from JSON or read
//! from `WEAVER_*` environment variables. [`core::Weaver::instance`] creates
//! a process-wide weaver from the environment on first use.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Configuration models for weavers.
pub mod config;
/// Jobs, queue policies, executors and the weaver.
pub mod core;
/// Async bridges for tokio callers.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
