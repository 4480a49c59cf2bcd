//! Integration tests for status and log persistence.
//!
//! These tests validate that:
//! - Logs are flushed by size as soon as a batch fills, and by time otherwise,
//!   with every record written exactly once.
//! - The batch in progress is flushed on shutdown.
//! - A full intake queue drops records instead of blocking.
//! - Status updates increment the execution counter only for finished
//!   recurring attempts.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cron_lite::config::LogConfig;
use cron_lite::persist::{LogMgr, StatusMgr};
use cron_lite::scheduler::job::JobStatusEvent;
use cron_lite::scheduler::{Job, JobStatus};
use cron_lite::store::{JobLog, MemoryStore, RelationalStore};
use test_harness::{assert_eventually, job_record};

fn log(name: &str) -> JobLog {
    let now = Utc::now();
    JobLog {
        job_name: name.to_string(),
        command: "true".to_string(),
        output: String::new(),
        err: String::new(),
        plan_time: now,
        schedule_time: now,
        start_time: now,
        end_time: now,
        success: true,
    }
}

fn log_config(batch_size: usize, commit_timeout: Duration) -> LogConfig {
    LogConfig {
        batch_size,
        commit_timeout,
        ..LogConfig::default()
    }
}

#[tokio::test]
async fn test_size_trigger_then_timer_flush() {
    let store = Arc::new(MemoryStore::new());
    let (mgr, sink) = LogMgr::new(store.clone(), &log_config(3, Duration::from_millis(400)));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(mgr.run(shutdown.clone()));

    // 2 * batch_size - 1 records inside one commit window
    for i in 0..5 {
        assert!(sink.append(log(&format!("job{i}"))));
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.log_insert_count(), 1, "only the size trigger has fired");
    assert_eq!(store.all_logs().await.len(), 3);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.log_insert_count(), 2);
    let logs = store.all_logs().await;
    let names: Vec<_> = logs.iter().map(|l| l.job_name.as_str()).collect();
    assert_eq!(names, ["job0", "job1", "job2", "job3", "job4"]);

    // The timer of the first batch never produces a second write
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.log_insert_count(), 2);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_timer_flushes_partial_batch() {
    let store = Arc::new(MemoryStore::new());
    let (mgr, sink) = LogMgr::new(store.clone(), &log_config(100, Duration::from_millis(100)));
    let shutdown = CancellationToken::new();
    tokio::spawn(mgr.run(shutdown.clone()));

    sink.append(log("a"));
    sink.append(log("b"));

    let store_ref = store.clone();
    assert_eventually(
        || {
            let store = store_ref.clone();
            async move { store.all_logs().await.len() == 2 }
        },
        Duration::from_secs(2),
        "partial batch should be flushed by the commit timer",
    )
    .await;
    assert_eq!(store.log_insert_count(), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_flushes_current_batch() {
    let store = Arc::new(MemoryStore::new());
    let (mgr, sink) = LogMgr::new(store.clone(), &log_config(100, Duration::from_secs(60)));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(mgr.run(shutdown.clone()));

    sink.append(log("a"));
    sink.append(log("b"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.log_insert_count(), 0);

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(store.all_logs().await.len(), 2);
}

#[tokio::test]
async fn test_failed_flush_is_not_retried() {
    let store = Arc::new(MemoryStore::new());
    let (mgr, sink) = LogMgr::new(store.clone(), &log_config(2, Duration::from_millis(100)));
    let shutdown = CancellationToken::new();
    tokio::spawn(mgr.run(shutdown.clone()));

    store.set_failing(true);
    sink.append(log("lost1"));
    sink.append(log("lost2"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    store.set_failing(false);
    sink.append(log("kept1"));
    sink.append(log("kept2"));

    let store_ref = store.clone();
    assert_eventually(
        || {
            let store = store_ref.clone();
            async move { store.log_insert_count() == 1 }
        },
        Duration::from_secs(2),
        "second batch should be written",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let names: Vec<_> = store.all_logs().await.into_iter().map(|l| l.job_name).collect();
    assert_eq!(names, ["kept1", "kept2"]);
    shutdown.cancel();
}

#[tokio::test]
async fn test_append_drops_when_queue_full() {
    let store = Arc::new(MemoryStore::new());
    let config = LogConfig {
        queue_capacity: 2,
        ..LogConfig::default()
    };
    // Loop not started: nothing drains the queue
    let (_mgr, sink) = LogMgr::new(store, &config);

    assert!(sink.append(log("a")));
    assert!(sink.append(log("b")));
    assert!(!sink.append(log("c")));
}

#[tokio::test]
async fn test_status_updates_reach_store() {
    let store = Arc::new(MemoryStore::new());
    let recurring = Job::recurring("ping", "true", "* * * * *");
    let one_shot = Job::one_shot("once1", "true");
    store.upsert_job(&job_record(&recurring)).await.unwrap();
    store.upsert_job(&job_record(&one_shot)).await.unwrap();

    let (mgr, sender) = StatusMgr::new(store.clone(), 16);
    let shutdown = CancellationToken::new();
    let handles = mgr.spawn(shutdown.clone());
    assert_eq!(handles.len(), 2);

    let recurring = Arc::new(recurring);
    let one_shot = Arc::new(one_shot);
    let next = Utc::now();
    sender.push(JobStatusEvent::new(JobStatus::Executing, recurring.clone(), next, false));
    sender.push(JobStatusEvent::new(JobStatus::PendingExecution, recurring.clone(), next, true));
    sender.push(JobStatusEvent::new(JobStatus::Executing, one_shot.clone(), next, false));
    sender.push(JobStatusEvent::new(JobStatus::Completed, one_shot.clone(), next, true));

    let store_ref = store.clone();
    assert_eventually(
        || {
            let store = store_ref.clone();
            async move {
                let ping = store.get_job("ping").await.unwrap().unwrap();
                let once = store.get_job("once1").await.unwrap().unwrap();
                ping.status == JobStatus::PendingExecution && once.status == JobStatus::Completed
            }
        },
        Duration::from_secs(2),
        "both queues should be drained",
    )
    .await;

    let ping = store.get_job("ping").await.unwrap().unwrap();
    assert_eq!(ping.executions, 1);
    assert_eq!(ping.next_time, Some(next));
    let once = store.get_job("once1").await.unwrap().unwrap();
    assert_eq!(once.executions, 0);

    shutdown.cancel();
    futures::future::join_all(handles).await;
}

#[tokio::test]
async fn test_status_store_failure_is_survived() {
    let store = Arc::new(MemoryStore::new());
    let job = Job::recurring("ping", "true", "* * * * *");
    store.upsert_job(&job_record(&job)).await.unwrap();

    let (mgr, sender) = StatusMgr::new(store.clone(), 16);
    let shutdown = CancellationToken::new();
    mgr.spawn(shutdown.clone());

    let job = Arc::new(job);
    store.set_failing(true);
    sender.push(JobStatusEvent::new(JobStatus::Executing, job.clone(), Utc::now(), false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.set_failing(false);
    sender.push(JobStatusEvent::new(JobStatus::ExecutionError, job, Utc::now(), true));

    let store_ref = store.clone();
    assert_eventually(
        || {
            let store = store_ref.clone();
            async move {
                store
                    .get_job("ping")
                    .await
                    .unwrap()
                    .is_some_and(|job| job.status == JobStatus::ExecutionError && job.executions == 1)
            }
        },
        Duration::from_secs(2),
        "loop keeps going after a failed write",
    )
    .await;
    shutdown.cancel();
}
