//! Configuration models for weavers.

pub mod weaver;

pub use weaver::{SpawnMode, WeaverConfig};
