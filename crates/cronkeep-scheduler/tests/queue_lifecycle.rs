// Queue, cron and history behaviour through the public API only.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use cronkeep_core::ManualClock;
use cronkeep_scheduler::{
    CronSpec, Job, JobHistory, JobQueue, JobRegistry, Priority, QueueState,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap()
}

fn open_queue(dir: &std::path::Path) -> (JobQueue, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    (JobQueue::new(dir, 1000, clock.clone()).unwrap(), clock)
}

#[test]
fn stepped_range_matches_only_inside_the_window() {
    let spec = CronSpec::parse("10-30/5 12 * * *").unwrap();
    let inside = Utc.with_ymd_and_hms(2012, 7, 1, 12, 15, 20).unwrap();
    let wrong_hour = Utc.with_ymd_and_hms(2012, 7, 1, 13, 25, 10).unwrap();
    let off_step = Utc.with_ymd_and_hms(2012, 7, 1, 12, 16, 0).unwrap();

    assert!(spec.is_due(&inside));
    assert!(!spec.is_due(&wrong_hour));
    assert!(!spec.is_due(&off_step));
}

#[tokio::test]
async fn push_then_pop_returns_the_same_item() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, _clock) = open_queue(dir.path());
    let job = Job::shell("echo hello").with_id("hello");

    let queue_id = queue.push(&job, Priority::Normal).await.unwrap();
    assert_eq!(queue.size(), 1);

    let popped = queue.pop(&JobRegistry::new()).await.unwrap().unwrap();
    assert_eq!(popped.queue_id, queue_id);
    assert_eq!(popped.job.id(), "hello");
    assert_eq!(queue.location(&queue_id), Some(QueueState::Processing));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn equal_timestamps_pop_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, _clock) = open_queue(dir.path());

    // The manual clock does not move, so all three share one timestamp.
    queue.push(&Job::shell("echo low").with_id("low"), Priority::Low).await.unwrap();
    queue.push(&Job::shell("echo normal").with_id("normal"), Priority::Normal).await.unwrap();
    queue.push(&Job::shell("echo high").with_id("high"), Priority::High).await.unwrap();

    let registry = JobRegistry::new();
    let mut order = Vec::new();
    while let Some(item) = queue.pop(&registry).await.unwrap() {
        order.push(item.job.id().to_string());
    }
    assert_eq!(order, ["high", "normal", "low"]);
}

#[tokio::test]
async fn item_failing_max_attempts_times_is_dead_lettered() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, clock) = open_queue(dir.path());
    let registry = JobRegistry::new();
    let job = Job::shell("false").with_id("flaky").max_attempts(2).unwrap();

    let queue_id = queue.push(&job, Priority::Normal).await.unwrap();

    queue.pop(&registry).await.unwrap().unwrap();
    queue.fail(&queue_id, "exit status 1").await.unwrap();

    assert_eq!(queue.location(&queue_id), Some(QueueState::Pending));
    let item = &queue.list(QueueState::Pending)[0];
    assert_eq!(item.attempts, 1);
    assert!(item.scheduled_for.unwrap() > t0());
    assert_eq!(item.last_error.as_deref(), Some("exit status 1"));

    // Not ready until the back-off has elapsed.
    assert!(queue.pop(&registry).await.unwrap().is_none());
    clock.advance(std::time::Duration::from_secs(120));

    queue.pop(&registry).await.unwrap().unwrap();
    queue.fail(&queue_id, "exit status 1").await.unwrap();

    assert_eq!(queue.location(&queue_id), Some(QueueState::Failed));
    let stats = queue.statistics();
    assert_eq!((stats.pending, stats.processing, stats.failed), (0, 0, 1));
}

#[tokio::test]
async fn history_keeps_original_length_of_truncated_output() {
    let dir = tempfile::tempdir().unwrap();
    let history = JobHistory::new(dir.path(), 30, 64).unwrap();
    let long = "x".repeat(500);
    let mut job = Job::closure("chatty", move |_| Ok(long.clone()));
    job.run(&cronkeep_scheduler::ExecEnv::system()).await.unwrap();

    history
        .log_execution(&job, t0(), Default::default())
        .unwrap();

    let entry = &history.get_job_history("chatty", 1)[0];
    assert!(entry.success);
    assert!(entry.output.truncated);
    assert_eq!(entry.output.length, 500);
    assert_eq!(entry.output.content.len(), 64);
}

#[tokio::test(start_paused = true)]
async fn pop_gives_up_quietly_while_another_process_holds_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, _clock) = open_queue(dir.path());
    let queue_id = queue
        .push(&Job::shell("echo busy").with_id("busy"), Priority::Normal)
        .await
        .unwrap();

    // A fresh lock is never treated as stale.
    let lock = dir.path().join(".lock");
    std::fs::write(&lock, "other").unwrap();

    assert!(queue.pop(&JobRegistry::new()).await.unwrap().is_none());
    assert_eq!(queue.location(&queue_id), Some(QueueState::Pending));
    assert!(lock.exists());

    std::fs::remove_file(&lock).unwrap();
    let popped = queue.pop(&JobRegistry::new()).await.unwrap().unwrap();
    assert_eq!(popped.queue_id, queue_id);
}
