// End-to-end runs with a scripted process spawner and a manual clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cronkeep_core::config::SchedulerConfig;
use cronkeep_core::ManualClock;
use cronkeep_exec::{CommandLine, ExecOptions, ExecResult, ProcessHandle, ProcessSpawner};
use cronkeep_scheduler::{
    CallableError, ExecEnv, Job, JobState, Priority, QueueState, RetryStrategy, Scheduler,
};

/// Hands out canned results in order and remembers every command it saw.
#[derive(Default)]
struct ScriptedSpawner {
    script: Mutex<VecDeque<ExecResult>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSpawner {
    fn with(results: Vec<ExecResult>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessSpawner for ScriptedSpawner {
    async fn start(
        &self,
        command: &CommandLine,
        _options: &ExecOptions,
    ) -> cronkeep_exec::Result<ProcessHandle> {
        self.calls.lock().unwrap().push(command.to_string());
        let result = self.script.lock().unwrap().pop_front().unwrap_or(ok(""));
        Ok(ProcessHandle::new(
            Some(4242),
            tokio::spawn(async move { Ok(result) }),
        ))
    }
}

fn ok(stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> ExecResult {
    ExecResult {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 12, 15, 0).unwrap()
}

fn config(dir: &std::path::Path, modern: bool) -> SchedulerConfig {
    let mut cfg = SchedulerConfig {
        status_path: dir.display().to_string(),
        ..Default::default()
    };
    cfg.modern.enabled = modern;
    cfg.modern.workers = 2;
    cfg
}

#[tokio::test]
async fn retries_until_exhausted_with_capped_backoff() {
    let clock = Arc::new(ManualClock::new(t0()));
    let env = ExecEnv::system().with_clock(clock.clone());
    let calls = Arc::new(AtomicU32::new(0));
    let seen_retry_counts = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    let seen = seen_retry_counts.clone();
    let f = failures.clone();
    let mut job = Job::closure("unreliable", move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Err(CallableError::Recoverable("upstream timeout".into()))
    })
    .max_attempts(11)
    .unwrap()
    .retry_delay(60, RetryStrategy::Exponential)
    .on_retry(move |job, _attempt, _err| seen.lock().unwrap().push(job.retry_count()))
    .on_failure(move |_job, err| {
        assert_eq!(err, "upstream timeout");
        f.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!job.run_with_retry(&env).await);

    assert_eq!(calls.load(Ordering::SeqCst), 11);
    assert_eq!(job.retry_count(), 10);
    assert_eq!(job.state(), JobState::Exhausted);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(*seen_retry_counts.lock().unwrap(), (0..10).collect::<Vec<u32>>());

    let sleeps: Vec<u64> = clock.sleeps().iter().map(Duration::as_secs).collect();
    assert_eq!(sleeps.len(), 10);
    assert_eq!(&sleeps[..4], &[60, 120, 240, 480]);
    // Attempt 10 would be 30720 seconds without the cap.
    assert_eq!(sleeps[9], 3600);
}

#[tokio::test]
async fn chained_jobs_follow_the_outcome() {
    let env = ExecEnv::system().with_clock(Arc::new(ManualClock::new(t0())));
    let ran = Arc::new(Mutex::new(Vec::new()));

    let (a, b) = (ran.clone(), ran.clone());
    let mut job = Job::closure("parent", |_| Err(CallableError::Recoverable("no".into())))
        .max_attempts(1)
        .unwrap()
        .chain(
            Job::closure("on-success", move |_| {
                a.lock().unwrap().push("on-success");
                Ok(String::new())
            }),
            true,
        )
        .chain(
            Job::closure("always", move |_| {
                b.lock().unwrap().push("always");
                Ok(String::new())
            }),
            false,
        );

    assert!(!job.run_with_retry(&env).await);
    assert_eq!(*ran.lock().unwrap(), ["always"]);
}

#[tokio::test]
async fn overlapping_job_is_refused_until_the_lock_goes_away() {
    let dir = tempfile::tempdir().unwrap();
    let spawner = ScriptedSpawner::with(vec![ok("done")]);
    let env = ExecEnv::system().with_spawner(spawner.clone());

    let mut job = Job::shell("backup.sh")
        .with_id("backup")
        .in_foreground()
        .only_one(Some(dir.path()), None);
    let lock = dir.path().join("backup.lock");
    std::fs::write(&lock, "backup").unwrap();

    assert!(!job.run(&env).await.unwrap());
    assert!(spawner.calls().is_empty());
    assert_eq!(job.output_text(), "Job is already running");

    std::fs::remove_file(&lock).unwrap();
    assert!(job.run(&env).await.unwrap());
    assert!(job.is_successful());
    assert_eq!(spawner.calls(), ["backup.sh"]);
    assert!(!lock.exists());
}

#[tokio::test]
async fn direct_mode_finalizes_background_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let spawner = ScriptedSpawner::with(vec![ok("synced"), failed("no space left")]);
    let env = ExecEnv::system()
        .with_spawner(spawner.clone())
        .with_clock(Arc::new(ManualClock::new(t0())));

    let mut scheduler = Scheduler::new(config(dir.path(), false), env).unwrap();
    scheduler.schedule(Job::shell("sync.sh").with_id("sync").at("*/15 * * * *").unwrap());
    scheduler.schedule(Job::shell("prune.sh").with_id("prune").at("10-30/5 12 * * *").unwrap());
    scheduler.schedule(Job::shell("report.sh").with_id("report").at("0 6 * * *").unwrap());

    let summary = scheduler.run(None, false).await.unwrap();

    assert_eq!(summary.jobs_run, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(spawner.calls(), ["sync.sh", "prune.sh"]);

    let states = scheduler.job_states();
    assert_eq!(states["prune"].error.as_deref(), Some("no space left"));
    assert!(!states.contains_key("report"));
    assert!(scheduler.all_jobs().unwrap().iter().all(|j| !j.has_pending_process()));
}

#[tokio::test]
async fn queue_mode_settles_every_item() {
    let dir = tempfile::tempdir().unwrap();
    let spawner = ScriptedSpawner::with(vec![ok("a"), ok("b"), failed("c broke")]);
    let clock = Arc::new(ManualClock::new(t0()));
    let env = ExecEnv::system()
        .with_spawner(spawner.clone())
        .with_clock(clock.clone());

    let mut scheduler = Scheduler::new(config(dir.path(), true), env).unwrap();
    scheduler.schedule(Job::shell("a.sh").with_id("a").priority(Priority::High));
    scheduler.schedule(Job::shell("b.sh").with_id("b"));
    scheduler.schedule(
        Job::shell("c.sh")
            .with_id("c")
            .priority(Priority::Low)
            .max_attempts(1)
            .unwrap(),
    );

    let summary = scheduler.run(None, false).await.unwrap();
    assert_eq!(summary.queued, 3);
    assert_eq!(summary.jobs_run, 3);
    assert_eq!(summary.failed, 1);
    assert!(summary.errors.is_empty());

    let queue = scheduler.queue().unwrap();
    let stats = queue.statistics();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed_today, 2);

    let dead = queue.list(QueueState::Failed);
    assert_eq!(dead[0].job_id, "c");
    assert_eq!(dead[0].last_error.as_deref(), Some("c broke"));

    let history = scheduler.history().unwrap();
    let entry = &history.get_job_history("c", 1)[0];
    assert!(!entry.success);
    assert!(entry.metadata.contains_key("queue_id"));

    let report = scheduler.health_status().await.unwrap();
    assert_eq!(report.failed_jobs_24h, 1);
    assert_eq!(report.queue_size, 0);
    assert!(report.modern_features);
}

#[tokio::test]
async fn truth_test_skip_after_a_success_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let env = ExecEnv::system().with_clock(Arc::new(ManualClock::new(t0())));
    let gate = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(AtomicU32::new(0));

    let (g, c) = (gate.clone(), calls.clone());
    let mut scheduler = Scheduler::new(config(dir.path(), false), env).unwrap();
    scheduler.schedule(
        Job::closure("gated", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok("ran".to_string())
        })
        .when(move || g.load(Ordering::SeqCst)),
    );

    let first = scheduler.run(None, false).await.unwrap();
    assert_eq!((first.jobs_run, first.succeeded), (1, 1));

    gate.store(false, Ordering::SeqCst);
    let second = scheduler.run(None, false).await.unwrap();
    assert_eq!(second.jobs_run, 0);
    assert_eq!(second.succeeded, 0);

    let forced = scheduler.force_run("gated").await.unwrap();
    assert!(!forced.success);
    assert_eq!(forced.output, "");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let history = scheduler.history().unwrap();
    assert_eq!(history.get_job_history("gated", 0).len(), 1);
}

#[tokio::test]
async fn queue_mode_runs_one_attempt_per_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let spawner = ScriptedSpawner::with(vec![failed("e1"), failed("e2"), failed("e3")]);
    let clock = Arc::new(ManualClock::new(t0()));
    let env = ExecEnv::system()
        .with_spawner(spawner.clone())
        .with_clock(clock.clone());

    let mut scheduler = Scheduler::new(config(dir.path(), true), env).unwrap();
    scheduler.schedule(
        Job::shell("flaky.sh")
            .with_id("flaky")
            .max_attempts(3)
            .unwrap()
            .retry_delay(60, RetryStrategy::Exponential),
    );

    let summary = scheduler.run(None, false).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(spawner.calls().len(), 1);
    {
        let pending = scheduler.queue().unwrap().list(QueueState::Pending);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("e1"));
    }

    // Not ready again until the queue back-off has elapsed.
    scheduler.process_queue().await;
    assert_eq!(spawner.calls().len(), 1);

    clock.advance(Duration::from_secs(120));
    scheduler.process_queue().await;
    assert_eq!(spawner.calls().len(), 2);

    clock.advance(Duration::from_secs(240));
    scheduler.process_queue().await;
    assert_eq!(spawner.calls().len(), 3);

    let queue = scheduler.queue().unwrap();
    let dead = queue.list(QueueState::Failed);
    assert_eq!(dead[0].job_id, "flaky");
    assert_eq!(dead[0].last_error.as_deref(), Some("e3"));
    assert_eq!(queue.statistics().pending, 0);

    // The job itself never slept between deliveries.
    assert!(clock.sleeps().is_empty());
}
