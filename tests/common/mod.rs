//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus_weaver::config::WeaverConfig;
use prometheus_weaver::core::{AppResult, JobPointer, Lambda, QueuePolicy, Weaver};

/// Weaver with `threads` workers, a short re-poll interval and a short
/// shutdown timeout.
pub fn weaver(threads: usize) -> Weaver {
    let config = WeaverConfig::new()
        .with_thread_count(threads)
        .with_repoll_interval_ms(10)
        .with_shutdown_timeout_secs(2);
    Weaver::new(config).unwrap()
}

/// Job running `work`.
pub fn job(work: impl Fn() -> AppResult<()> + Send + Sync + 'static) -> JobPointer {
    Arc::new(Lambda::new(work))
}

/// Job appending `tag` to `log`.
pub fn recorder(log: &Arc<Mutex<String>>, tag: char) -> JobPointer {
    let log = Arc::clone(log);
    job(move || {
        log.lock().push(tag);
        Ok(())
    })
}

/// Job that sleeps for `ms` milliseconds.
pub fn sleeper(ms: u64) -> JobPointer {
    job(move || {
        thread::sleep(Duration::from_millis(ms));
        Ok(())
    })
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Policy that admits jobs only while open and counts `free` calls.
#[derive(Default)]
pub struct CountingGate {
    open: AtomicBool,
    frees: AtomicUsize,
}

impl CountingGate {
    pub fn open() -> Arc<Self> {
        let gate = Self::default();
        gate.open.store(true, Ordering::SeqCst);
        Arc::new(gate)
    }

    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl QueuePolicy for CountingGate {
    fn can_run(&self, _job: &JobPointer) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn free(&self, _job: &JobPointer) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}
