//! Weaver configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When worker threads are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// All threads start with the weaver.
    #[default]
    Eager,
    /// Threads start on enqueue when none is idle, up to the maximum.
    Lazy,
}

impl FromStr for SpawnMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(Self::Eager),
            "lazy" => Ok(Self::Lazy),
            other => Err(format!("unknown spawn mode `{other}`")),
        }
    }
}

/// Weaver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaverConfig {
    /// Maximum number of worker threads.
    pub thread_count: usize,
    /// When threads are created.
    pub spawn_mode: SpawnMode,
    /// Stack size for worker threads in bytes.
    pub thread_stack_size: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
    /// How often idle workers re-check blocked jobs, in milliseconds.
    /// Zero waits for an explicit wake-up only.
    pub repoll_interval_ms: u64,
    /// Upper bound for draining jobs and joining threads at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            thread_count: num_cpus::get().max(1),
            spawn_mode: SpawnMode::Eager,
            thread_stack_size: 2 * 1024 * 1024,
            thread_name_prefix: "weaver".to_string(),
            repoll_interval_ms: 50,
            shutdown_timeout_secs: 5,
        }
    }
}

impl WeaverConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of threads.
    #[must_use]
    pub const fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    /// Set the spawn mode.
    #[must_use]
    pub const fn with_spawn_mode(mut self, mode: SpawnMode) -> Self {
        self.spawn_mode = mode;
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the re-poll interval.
    #[must_use]
    pub const fn with_repoll_interval_ms(mut self, ms: u64) -> Self {
        self.repoll_interval_ms = ms;
        self
    }

    /// Set the shutdown timeout.
    #[must_use]
    pub const fn with_shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    /// Re-poll interval, if enabled.
    #[must_use]
    pub const fn repoll_interval(&self) -> Option<Duration> {
        if self.repoll_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.repoll_interval_ms))
        }
    }

    /// Shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.thread_count == 0 {
            return Err("thread_count must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.thread_name_prefix.is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        if self.shutdown_timeout_secs == 0 {
            return Err("shutdown_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load overrides from `WEAVER_*` environment variables, reading a
    /// `.env` file first if present.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or the
    /// validation failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, starting from defaults.
    ///
    /// Recognised keys: `WEAVER_THREAD_COUNT`, `WEAVER_SPAWN_MODE`,
    /// `WEAVER_THREAD_STACK_SIZE`, `WEAVER_THREAD_NAME_PREFIX`,
    /// `WEAVER_REPOLL_INTERVAL_MS`, `WEAVER_SHUTDOWN_TIMEOUT_SECS`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or the
    /// validation failure.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut cfg = Self::default();
        if let Some(v) = parse_var(&lookup, "WEAVER_THREAD_COUNT")? {
            cfg.thread_count = v;
        }
        if let Some(v) = parse_var(&lookup, "WEAVER_SPAWN_MODE")? {
            cfg.spawn_mode = v;
        }
        if let Some(v) = parse_var(&lookup, "WEAVER_THREAD_STACK_SIZE")? {
            cfg.thread_stack_size = v;
        }
        if let Some(v) = lookup("WEAVER_THREAD_NAME_PREFIX") {
            cfg.thread_name_prefix = v;
        }
        if let Some(v) = parse_var(&lookup, "WEAVER_REPOLL_INTERVAL_MS")? {
            cfg.repoll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WEAVER_SHUTDOWN_TIMEOUT_SECS")? {
            cfg.shutdown_timeout_secs = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().map_err(|e| format!("{key}: {e}")))
        .transpose()
}
