//! Integration tests for the tokio bridge.

mod common;

use std::time::Duration;

use common::{sleeper, weaver};
use prometheus_weaver::core::JobStatus;
use prometheus_weaver::runtime::wait_for_job;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finish_async_waits_for_jobs() {
    let weaver = weaver(2);
    let jobs: Vec<_> = (0..4).map(|_| sleeper(20)).collect();
    weaver.enqueue_all(jobs.iter().cloned()).unwrap();

    weaver.finish_async().await.unwrap();
    assert!(jobs.iter().all(|j| j.success()));
    assert!(weaver.finish_timeout_async(Duration::from_millis(10)).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_for_job() {
    let weaver = weaver(1);
    let job = sleeper(10);
    weaver.enqueue(job.clone()).unwrap();
    let status = wait_for_job(job, Duration::from_secs(2)).await.unwrap();
    assert_eq!(status, JobStatus::Success);

    let never_queued = sleeper(1);
    let status = wait_for_job(never_queued, Duration::from_millis(20)).await.unwrap();
    assert_eq!(status, JobStatus::New);
}
