//! Integration tests for collections and sequences.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{job, recorder, wait_until, weaver, CountingGate};
use parking_lot::Mutex;
use prometheus_weaver::core::{
    blocking_execute, ChannelObserver, EventExecutor, JobCollection, JobEvent, JobPointer, JobStatus, WeaverError,
    WeaverEvent,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn sequence_of(log: &Arc<Mutex<String>>, tags: &str) -> Arc<JobCollection> {
    let sequence = Arc::new(JobCollection::sequence());
    for tag in tags.chars() {
        sequence.add_job(recorder(log, tag)).unwrap();
    }
    sequence
}

#[test]
fn test_collection_runs_all_elements() {
    let weaver = weaver(4);
    let log = Arc::new(Mutex::new(String::new()));
    let collection = Arc::new(JobCollection::new());
    for tag in "abcdefgh".chars() {
        collection.add_job(recorder(&log, tag)).unwrap();
    }
    let job: JobPointer = collection.clone();
    weaver.enqueue(job.clone()).unwrap();
    weaver.finish();

    assert!(job.success());
    let mut seen: Vec<char> = log.lock().chars().collect();
    seen.sort_unstable();
    assert_eq!(seen.into_iter().collect::<String>(), "abcdefgh");
    assert!(collection.elements().iter().all(|e| e.success()));
}

#[test]
fn test_empty_collection_in_weaver() {
    let weaver = weaver(2);
    let job: JobPointer = Arc::new(JobCollection::new());
    weaver.enqueue(job.clone()).unwrap();
    weaver.finish();
    assert_eq!(job.status(), JobStatus::Success);
}

#[test]
fn test_nested_sequences_keep_order() {
    let weaver = weaver(4);
    let log = Arc::new(Mutex::new(String::new()));
    let outer = Arc::new(JobCollection::sequence());
    outer.add_job(recorder(&log, 'a')).unwrap();
    outer.add_job(sequence_of(&log, "bcd")).unwrap();
    outer.add_job(recorder(&log, 'e')).unwrap();
    outer.add_job(sequence_of(&log, "fg")).unwrap();
    outer.add_job(sequence_of(&log, "hij")).unwrap();

    let job: JobPointer = outer;
    weaver.enqueue(job.clone()).unwrap();
    weaver.finish();
    assert!(job.success());
    assert_eq!(log.lock().as_str(), "abcdefghij");
}

#[test]
fn test_sequence_stops_at_first_failure() {
    let weaver = weaver(4);
    let log = Arc::new(Mutex::new(String::new()));
    let sequence = sequence_of(&log, "abcd");
    let failing = job(|| Err(anyhow::anyhow!("step failed")));
    sequence.add_job(failing.clone()).unwrap();
    let e = recorder(&log, 'e');
    let f = recorder(&log, 'f');
    sequence.add_job(e.clone()).unwrap();
    sequence.add_job(f.clone()).unwrap();

    let job: JobPointer = sequence;
    weaver.enqueue(job.clone()).unwrap();
    weaver.finish();

    assert_eq!(log.lock().as_str(), "abcd");
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(failing.status(), JobStatus::Failed);
    assert_eq!(e.status(), JobStatus::Aborted);
    assert_eq!(f.status(), JobStatus::Aborted);
    assert!(weaver.is_empty());
}

#[test]
fn test_long_random_sequence() {
    let weaver = weaver(8);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let expected: String = (0..1024).map(|_| char::from(rng.random_range(b'a'..=b'z'))).collect();

    let log = Arc::new(Mutex::new(String::with_capacity(expected.len())));
    let job: JobPointer = sequence_of(&log, &expected);
    weaver.enqueue(job.clone()).unwrap();
    weaver.finish();

    assert!(job.success());
    assert_eq!(*log.lock(), expected);
}

#[test]
fn test_stop_cancels_elements_not_started() {
    let weaver = weaver(2);
    let (started_tx, started_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
    let log = Arc::new(Mutex::new(String::new()));

    let sequence = Arc::new(JobCollection::sequence());
    sequence
        .add_job(job(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(())
        }))
        .unwrap();
    let x = recorder(&log, 'x');
    sequence.add_job(x.clone()).unwrap();
    sequence.add_job(recorder(&log, 'y')).unwrap();

    let job: JobPointer = sequence.clone();
    weaver.enqueue(job.clone()).unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || weaver.queue_length() == 2));

    sequence.stop();
    release_tx.send(()).unwrap();
    weaver.finish();

    assert!(log.lock().is_empty());
    assert_eq!(x.status(), JobStatus::Aborted);
    assert_eq!(job.status(), JobStatus::Aborted);
}

#[test]
fn test_blocking_execute_nested_sequence() {
    let log = Arc::new(Mutex::new(String::new()));
    let outer = Arc::new(JobCollection::sequence());
    outer.add_job(sequence_of(&log, "abc")).unwrap();
    outer.add_job(recorder(&log, 'd')).unwrap();
    outer.add_job(sequence_of(&log, "ef")).unwrap();

    let job: JobPointer = outer;
    assert_eq!(blocking_execute(&job), JobStatus::Success);
    assert_eq!(log.lock().as_str(), "abcdef");
}

#[test]
fn test_collection_executor_and_observers_see_one_outcome() {
    let weaver = weaver(4);
    let (observer, events) = ChannelObserver::unbounded();
    weaver.register_observer(Arc::new(observer));
    let log = Arc::new(Mutex::new(String::new()));
    let collection = Arc::new(JobCollection::new());
    collection.add_job(recorder(&log, 'a')).unwrap();
    collection.add_job(recorder(&log, 'b')).unwrap();

    let job: JobPointer = collection;
    let (tx, rx) = crossbeam_channel::unbounded();
    EventExecutor::attach(&job, tx).unwrap();
    weaver.enqueue(job.clone()).unwrap();
    weaver.finish();

    assert!(job.success());
    assert_eq!(log.lock().len(), 2);
    let executor_events: Vec<JobEvent> = rx.try_iter().collect();
    assert_eq!(executor_events.len(), 2, "{executor_events:?}");
    assert!(matches!(executor_events[0], JobEvent::Started { job: id, .. } if id == job.id()));
    assert!(matches!(executor_events[1], JobEvent::Done { job: id, .. } if id == job.id()));

    let done = events
        .try_iter()
        .filter(|e| matches!(e, WeaverEvent::JobDone { job: id, .. } if *id == job.id()))
        .count();
    assert_eq!(done, 1);
    assert_eq!(weaver.stats().completed_jobs, 3);
}

#[test]
fn test_failed_collection_reports_failure_to_its_executor() {
    let weaver = weaver(2);
    let sequence = Arc::new(JobCollection::sequence());
    sequence.add_job(job(|| Err(anyhow::anyhow!("step failed")))).unwrap();
    sequence.add_job(job(|| Ok(()))).unwrap();

    let job: JobPointer = sequence;
    let (tx, rx) = crossbeam_channel::unbounded();
    EventExecutor::attach(&job, tx).unwrap();
    weaver.enqueue(job.clone()).unwrap();
    weaver.finish();

    assert_eq!(job.status(), JobStatus::Failed);
    let last = rx.try_iter().last();
    assert!(matches!(last, Some(JobEvent::Failed { job: id, .. }) if id == job.id()));
    assert_eq!(weaver.stats().failed_jobs, 2);
}

#[test]
fn test_same_job_cannot_be_added_twice() {
    let log = Arc::new(Mutex::new(String::new()));
    let element = recorder(&log, 'a');
    let collection = Arc::new(JobCollection::new());
    collection.add_job(element.clone()).unwrap();
    assert!(matches!(
        collection.add_job(element.clone()),
        Err(WeaverError::DuplicateElement(_))
    ));
    assert_eq!(collection.len(), 1);
}

#[test]
fn test_element_queued_elsewhere_is_left_to_its_owner() {
    let weaver = weaver(2);
    let log = Arc::new(Mutex::new(String::new()));
    let counting = CountingGate::open();
    let shared = recorder(&log, 's');
    shared.assign_queue_policy(counting.clone()).unwrap();

    let collection = Arc::new(JobCollection::new());
    collection.add_job(shared.clone()).unwrap();
    collection.add_job(recorder(&log, 'x')).unwrap();
    let job: JobPointer = collection;

    weaver.suspend();
    weaver.enqueue(shared.clone()).unwrap();
    weaver.enqueue(job.clone()).unwrap();
    weaver.resume();
    weaver.finish();

    assert!(shared.success());
    assert!(job.success());
    assert_eq!(log.lock().matches('s').count(), 1);
    assert_eq!(counting.frees(), 1);
}
