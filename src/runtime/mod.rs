//! Bridges for async callers.

pub mod async_api;

pub use async_api::wait_for_job;
