//! The orchestrator.
//!
//! [`Scheduler`] owns the job list, loads persisted definitions once, and on
//! every [`Scheduler::run`] executes the due jobs. Without the queue jobs run
//! directly; with `scheduler.modern.enabled` they are pushed to the
//! [`JobQueue`] and drained by up to `workers` concurrent runners. Either way
//! the results land in `status.json`, the history and `last_run.txt`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronkeep_core::config::SchedulerConfig;
use cronkeep_core::CoreError;
use cronkeep_exec::{CommandLine, ExecOptions};
use futures_util::future::join_all;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::deps::{DependencyCheck, OutcomeTracker};
use crate::env::ExecEnv;
use crate::error::{Result, SchedulerError};
use crate::health::{
    self, CrontabStatus, HealthReport, HealthStatus, SchedulerStatistics, TriggerMethod,
    EXTERNAL_TRIGGER_WINDOW_SECS,
};
use crate::history::{read_json, round, write_json, JobHistory};
use crate::job::Job;
use crate::queue::{JobQueue, QueuedJob};
use crate::registry::JobRegistry;
use crate::state::JobState;

pub const STATUS_FILE: &str = "status.json";
/// Creating this file in the status directory stops a running daemon.
pub const SHUTDOWN_FILE: &str = "shutdown";
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Success,
    Failure,
}

/// One entry of `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub state: RunState,
    pub last_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of one `run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub ran_at: DateTime<Utc>,
    /// Jobs that got past their truth test.
    pub jobs_run: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items pushed to the queue this run.
    pub queued: usize,
    /// Persistence problems that did not stop the run.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForcedRun {
    pub job_id: String,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Executed,
    Disabled,
    Unauthorized,
    NotFound,
    /// Authenticated, but the run itself errored.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookResult {
    #[serde(skip)]
    pub status: WebhookStatus,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_run: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl WebhookResult {
    pub fn rejected(status: WebhookStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            success: false,
            message: message.into(),
            job_id: None,
            forced: false,
            output: None,
            jobs_run: None,
            timestamp: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    config: SchedulerConfig,
    env: ExecEnv,
    jobs: Vec<Job>,
    loaded: bool,
    registry: JobRegistry,
    queue: Option<JobQueue>,
    history: Option<Arc<JobHistory>>,
    outcomes: Arc<OutcomeTracker>,
    executed: Vec<Job>,
    failed: Vec<Job>,
    output_lines: Vec<String>,
}

impl Scheduler {
    /// Build a scheduler over `config`. Creates the status, queue and history
    /// directories as needed. Dependency checks in `env` are replaced by the
    /// scheduler's own outcome tracker.
    pub fn new(config: SchedulerConfig, env: ExecEnv) -> Result<Self> {
        std::fs::create_dir_all(config.status_dir())?;

        let history = if config.modern.history.enabled {
            Some(Arc::new(JobHistory::new(
                config.history_dir(),
                config.modern.history.retention_days,
                config.modern.history.max_output_length,
            )?))
        } else {
            None
        };

        let queue = if config.modern.enabled {
            Some(JobQueue::new(
                config.queue_dir(),
                config.modern.queue.max_size,
                env.clock.clone(),
            )?)
        } else {
            None
        };

        let outcomes = Arc::new(OutcomeTracker::new(history.clone()));
        let deps: Arc<dyn DependencyCheck> = outcomes.clone();
        let env = env.with_deps(deps);

        info!(
            modern = config.modern.enabled,
            workers = config.modern.workers,
            history = history.is_some(),
            "scheduler initialised"
        );

        Ok(Self {
            config,
            env,
            jobs: Vec::new(),
            loaded: false,
            registry: JobRegistry::new(),
            queue,
            history,
            outcomes,
            executed: Vec::new(),
            failed: Vec::new(),
            output_lines: Vec::new(),
        })
    }

    // --- job list ------------------------------------------------------------

    /// Build jobs from `custom_jobs`. Runs once per instance; a bad definition
    /// fails the load and nothing from it is kept.
    pub fn load_saved_jobs(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }

        let mut loaded = Vec::with_capacity(self.config.custom_jobs.len());
        for def in &self.config.custom_jobs {
            let job = Job::from_definition(def)?.configure(&self.config.defaults);
            loaded.push(job);
        }
        for job in loaded {
            self.add(job);
        }

        self.loaded = true;
        debug!(jobs = self.jobs.len(), "saved jobs loaded");
        Ok(())
    }

    /// Add a job built in code. Scheduler defaults and the configured
    /// enable/disable override are applied. Returns the stored job.
    pub fn schedule(&mut self, job: Job) -> &Job {
        let job = job.configure(&self.config.defaults);
        self.add(job)
    }

    /// Shorthand for `schedule(Job::shell(command).with_args(args))`.
    pub fn add_command(&mut self, command: &str, args: Vec<String>, id: Option<&str>) -> &Job {
        let mut job = Job::shell(command).with_args(args);
        if let Some(id) = id {
            job = job.with_id(id);
        }
        self.schedule(job)
    }

    fn add(&mut self, mut job: Job) -> &Job {
        if !self.config.is_enabled(job.id()) {
            job.set_enabled(false);
        }
        self.registry.register(&job);
        self.jobs.push(job);
        let last = self.jobs.len() - 1;
        &self.jobs[last]
    }

    /// Every known job, enabled or not, after loading saved definitions.
    pub fn all_jobs(&mut self) -> Result<&[Job]> {
        self.load_saved_jobs()?;
        Ok(&self.jobs)
    }

    pub fn get_job(&mut self, id: &str) -> Result<Option<&Job>> {
        self.load_saved_jobs()?;
        Ok(self.jobs.iter().find(|j| j.id() == id))
    }

    /// Enabled jobs split into (background, foreground); `all` includes disabled ones.
    pub fn queued_jobs(&self, all: bool) -> (Vec<&Job>, Vec<&Job>) {
        self.jobs
            .iter()
            .filter(|j| all || j.is_enabled())
            .partition(|j| j.runs_in_background())
    }

    pub fn clear_jobs(&mut self) {
        self.jobs.clear();
        self.registry.clear();
    }

    /// Forget the executed/failed lists and the verbose output.
    pub fn reset_run(&mut self) {
        self.executed.clear();
        self.failed.clear();
        self.output_lines.clear();
    }

    pub fn executed_jobs(&self) -> &[Job] {
        &self.executed
    }

    pub fn failed_jobs(&self) -> &[Job] {
        &self.failed
    }

    pub fn verbose_output(&self) -> &[String] {
        &self.output_lines
    }

    pub fn queue(&self) -> Option<&JobQueue> {
        self.queue.as_ref()
    }

    pub fn history(&self) -> Option<&Arc<JobHistory>> {
        self.history.as_ref()
    }

    pub fn env(&self) -> &ExecEnv {
        &self.env
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // --- running -------------------------------------------------------------

    /// Run every enabled job that is due at `at` (default: now), or every
    /// enabled job when `force` is set.
    pub async fn run(&mut self, at: Option<DateTime<Utc>>, force: bool) -> Result<RunSummary> {
        self.load_saved_jobs()?;
        let now = at.unwrap_or_else(|| self.env.clock.now());
        let mut summary = RunSummary {
            ran_at: now,
            ..Default::default()
        };

        let finished = if self.queue.is_some() {
            self.run_queued(now, force, &mut summary).await
        } else {
            self.run_direct(now, force).await
        };

        self.record(finished, now, &mut summary);
        self.touch_last_run(now, &mut summary);

        info!(
            jobs_run = summary.jobs_run,
            succeeded = summary.succeeded,
            failed = summary.failed,
            queued = summary.queued,
            "scheduler run finished"
        );
        Ok(summary)
    }

    /// Legacy mode: start background jobs, run foreground jobs, then wait
    /// for the background ones.
    async fn run_direct(&mut self, now: DateTime<Utc>, force: bool) -> Vec<Job> {
        let env = self.env.clone();
        let (background, foreground): (Vec<usize>, Vec<usize>) = (0..self.jobs.len())
            .filter(|&i| self.jobs[i].is_enabled() && (force || self.jobs[i].is_due(now)))
            .partition(|&i| self.jobs[i].runs_in_background());

        for &i in background.iter().chain(&foreground) {
            let job = &mut self.jobs[i];
            if let Err(e) = job.run(&env).await {
                error!(job_id = %job.id(), "job run failed: {e}");
            }
            if !job.has_pending_process() {
                self.outcomes.note(job);
            }
        }

        for &i in &background {
            let job = &mut self.jobs[i];
            if !job.has_pending_process() {
                continue;
            }
            if let Err(e) = job.finalize(&env).await {
                error!(job_id = %job.id(), "cannot finalize background job: {e}");
            }
            self.outcomes.note(job);
        }

        background
            .iter()
            .chain(&foreground)
            .map(|&i| self.jobs[i].clone())
            .collect()
    }

    /// Queue mode: drain leftovers, enqueue the due jobs, drain again.
    async fn run_queued(
        &mut self,
        now: DateTime<Utc>,
        force: bool,
        summary: &mut RunSummary,
    ) -> Vec<Job> {
        let mut finished = self.drain(&mut summary.errors).await;

        if let Some(ref queue) = self.queue {
            let due = self
                .jobs
                .iter()
                .filter(|j| j.is_enabled() && (force || j.is_due(now)));
            for job in due {
                match queue.push(job, job.get_priority()).await {
                    Ok(_) => summary.queued += 1,
                    Err(e) => {
                        warn!(job_id = %job.id(), "cannot queue job: {e}");
                        summary.errors.push(e.to_string());
                    }
                }
            }
        }

        finished.extend(self.drain(&mut summary.errors).await);
        finished
    }

    /// Run whatever the queue holds right now and record the results.
    pub async fn process_queue(&mut self) -> RunSummary {
        let now = self.env.clock.now();
        let mut summary = RunSummary {
            ran_at: now,
            ..Default::default()
        };
        let finished = self.drain(&mut summary.errors).await;
        if !finished.is_empty() {
            self.record(finished, now, &mut summary);
        }
        summary
    }

    /// Pop up to `workers` items, run one attempt of each concurrently, settle
    /// each against the queue, repeat until nothing is ready.
    async fn drain(&self, errors: &mut Vec<String>) -> Vec<Job> {
        let Some(ref queue) = self.queue else {
            return Vec::new();
        };
        let workers = self.config.modern.workers.max(1);
        let mut finished = Vec::new();

        loop {
            let mut batch: Vec<QueuedJob> = Vec::with_capacity(workers);
            while batch.len() < workers {
                match queue.pop(&self.registry).await {
                    Ok(Some(item)) => batch.push(item),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("cannot pop queue: {e}");
                        errors.push(e.to_string());
                        break;
                    }
                }
            }
            if batch.is_empty() {
                break;
            }

            // One attempt per delivery; the queue owns the back-off between them.
            join_all(
                batch
                    .iter_mut()
                    .map(|item| item.job.run_delivery(&self.env, item.attempts + 1)),
            )
            .await;

            for QueuedJob { queue_id, job, .. } in batch {
                let settled = match job.state() {
                    JobState::Succeeded | JobState::Pending => queue.complete(&queue_id).await,
                    _ => queue.fail(&queue_id, job.output_text()).await,
                };
                if let Err(e) = settled {
                    warn!(%queue_id, "cannot settle queue item: {e}");
                    errors.push(e.to_string());
                }
                self.outcomes.note(&job);
                finished.push(job);
            }
        }

        finished
    }

    /// Run one job now in the foreground, ignoring its schedule and enabled
    /// flag. Overlap and dependency checks still apply.
    pub async fn force_run(&mut self, job_id: &str) -> Result<ForcedRun> {
        self.load_saved_jobs()?;
        let mut job = self
            .jobs
            .iter()
            .find(|j| j.id() == job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })?
            .in_foreground();

        let now = self.env.clock.now();
        let started = std::time::Instant::now();
        let ran = job.run(&self.env).await;
        info!(job_id = %job.id(), elapsed_ms = started.elapsed().as_millis() as u64, "job force-run");

        let (success, output) = match ran {
            Ok(true) => (job.is_successful(), job.output_text().to_string()),
            Ok(false) => (false, job.output_text().to_string()),
            Err(e) => (false, e.to_string()),
        };
        self.outcomes.note(&job);

        let mut summary = RunSummary::default();
        self.record(vec![job], now, &mut summary);
        self.touch_last_run(now, &mut summary);

        Ok(ForcedRun {
            job_id: job_id.to_string(),
            success,
            output,
        })
    }

    /// Authenticate a webhook call, then run one job (forced) or the due jobs.
    pub async fn process_webhook_trigger(
        &mut self,
        token: Option<&str>,
        job_id: Option<&str>,
    ) -> WebhookResult {
        let webhook = &self.config.modern.webhook;
        if !webhook.enabled {
            return WebhookResult::rejected(
                WebhookStatus::Disabled,
                "Webhook triggers are not enabled",
            );
        }
        if let Some(ref expected) = webhook.token {
            if !token.is_some_and(|t| token_matches(t, expected)) {
                warn!("webhook rejected: invalid token");
                return WebhookResult::rejected(WebhookStatus::Unauthorized, "Invalid webhook token");
            }
        }
        self.trigger(job_id).await
    }

    /// Webhook body for an already authenticated caller.
    pub async fn trigger(&mut self, job_id: Option<&str>) -> WebhookResult {
        match job_id {
            Some(id) => match self.force_run(id).await {
                Ok(forced) => WebhookResult {
                    status: WebhookStatus::Executed,
                    success: forced.success,
                    message: if forced.success {
                        "Job force-executed successfully".to_string()
                    } else {
                        "Job execution failed".to_string()
                    },
                    job_id: Some(forced.job_id),
                    forced: true,
                    output: Some(forced.output),
                    jobs_run: None,
                    timestamp: None,
                },
                Err(SchedulerError::JobNotFound { id }) => WebhookResult::rejected(
                    WebhookStatus::NotFound,
                    format!("Job not found: {id}"),
                ),
                Err(e) => WebhookResult::rejected(WebhookStatus::Error, e.to_string()),
            },
            None => match self.run(None, false).await {
                Ok(summary) => WebhookResult {
                    status: WebhookStatus::Executed,
                    success: true,
                    message: "Scheduler executed (due jobs only)".to_string(),
                    job_id: None,
                    forced: false,
                    output: None,
                    jobs_run: Some(summary.jobs_run),
                    timestamp: Some(summary.ran_at),
                },
                Err(e) => WebhookResult::rejected(WebhookStatus::Error, e.to_string()),
            },
        }
    }

    // --- persistence ---------------------------------------------------------

    /// Fold finished jobs into the summary, verbose output, `status.json`
    /// and history. Write failures are logged and collected, never fatal.
    fn record(&mut self, finished: Vec<Job>, now: DateTime<Utc>, summary: &mut RunSummary) {
        let mut states = BTreeMap::new();

        for job in finished {
            // Truth test said no: nothing ran.
            if job.state() == JobState::Pending {
                continue;
            }
            summary.jobs_run += 1;

            if let Some(ref history) = self.history {
                let mut meta = BTreeMap::new();
                if let Some(queue_id) = job.queue_id() {
                    meta.insert("queue_id".to_string(), serde_json::Value::from(queue_id));
                }
                if let Err(e) = history.log_execution(&job, now, meta) {
                    warn!(job_id = %job.id(), "cannot write history entry: {e}");
                    summary.errors.push(e.to_string());
                }
            }

            let command = job.command_line();
            if job.is_successful() {
                summary.succeeded += 1;
                states.insert(
                    job.id().to_string(),
                    JobStatusRecord {
                        state: RunState::Success,
                        last_run: now,
                        error: None,
                    },
                );
                let line = format!("Success: {} {}", command, job.args().join(" "));
                self.verbose(now, line.trim_end());
                self.executed.push(job);
            } else {
                summary.failed += 1;
                states.insert(
                    job.id().to_string(),
                    JobStatusRecord {
                        state: RunState::Failure,
                        last_run: now,
                        error: Some(job.output_text().to_string()),
                    },
                );
                let line = format!("Error: {} → {}", command, job.output_text().trim());
                self.verbose(now, &line);
                self.failed.push(job);
            }
        }

        if !states.is_empty() {
            if let Err(e) = self.save_job_states(states) {
                warn!("cannot save job states: {e}");
                summary.errors.push(e.to_string());
            }
        }

        if let Some(ref history) = self.history {
            if let Err(e) = history.clean_old_history(now) {
                warn!("cannot clean old history: {e}");
                summary.errors.push(e.to_string());
            }
        }
    }

    fn touch_last_run(&self, now: DateTime<Utc>, summary: &mut RunSummary) {
        if let Err(e) = health::write_last_run(&self.config.status_dir(), now) {
            warn!("cannot write last run marker: {e}");
            summary.errors.push(e.to_string());
        }
    }

    fn verbose(&mut self, now: DateTime<Utc>, line: &str) {
        self.output_lines.push(format!("[{}] {line}", now.to_rfc3339()));
    }

    fn status_file(&self) -> PathBuf {
        self.config.status_dir().join(STATUS_FILE)
    }

    /// Last recorded state per job id.
    pub fn job_states(&self) -> BTreeMap<String, JobStatusRecord> {
        read_json(&self.status_file()).unwrap_or_default()
    }

    fn save_job_states(&self, states: BTreeMap<String, JobStatusRecord>) -> Result<()> {
        let mut saved = self.job_states();
        saved.extend(states);
        write_json(&self.status_file(), &saved)
    }

    // --- reporting -------------------------------------------------------------

    pub async fn health_status(&mut self) -> Result<HealthReport> {
        let scheduled_jobs = self.all_jobs()?.len();
        let now = self.env.clock.now();
        let last_run = health::read_last_run(&self.config.status_dir());
        let last_run_age = last_run.map(|t| (now - t).num_seconds());

        Ok(HealthReport {
            status: HealthStatus::from_age(last_run_age),
            last_run,
            last_run_age,
            queue_size: self.queue.as_ref().map_or(0, JobQueue::size),
            failed_jobs_24h: self
                .history
                .as_ref()
                .map_or(0, |h| h.count_recent_failures(now)),
            scheduled_jobs,
            modern_features: self.config.modern.enabled,
            workers: self.config.modern.workers,
            trigger_methods: self.active_triggers().await,
        })
    }

    pub async fn active_triggers(&self) -> Vec<TriggerMethod> {
        let mut triggers = Vec::new();

        if self.crontab_status().await == CrontabStatus::Installed {
            triggers.push(TriggerMethod::Cron);
        }
        if self.systemd_timer_active().await {
            triggers.push(TriggerMethod::Systemd);
        }
        if self.config.modern.webhook.enabled {
            triggers.push(TriggerMethod::Webhook);
        }
        if let Some(last) = health::read_last_run(&self.config.status_dir()) {
            if (self.env.clock.now() - last).num_seconds() < EXTERNAL_TRIGGER_WINDOW_SECS {
                triggers.push(TriggerMethod::External);
            }
        }

        triggers
    }

    /// Whether `crontab -l` lists the scheduler.
    pub async fn crontab_status(&self) -> CrontabStatus {
        let listing = CommandLine::new("crontab", vec!["-l".to_string()]);
        match self
            .env
            .spawner
            .run(&listing, &ExecOptions::with_timeout(Duration::from_secs(10)))
            .await
        {
            Ok(r) => CrontabStatus::from_listing(r.success(), &r.stdout, &r.stderr),
            Err(e) => {
                debug!("crontab unavailable: {e}");
                CrontabStatus::Error
            }
        }
    }

    async fn systemd_timer_active(&self) -> bool {
        if cfg!(windows) {
            return false;
        }
        let probe = CommandLine::new(
            "systemctl",
            vec!["is-active".to_string(), self.config.systemd_unit.clone()],
        );
        match self
            .env
            .spawner
            .run(&probe, &ExecOptions::with_timeout(Duration::from_secs(10)))
            .await
        {
            Ok(r) => r.success() && r.stdout.trim() == "active",
            Err(_) => false,
        }
    }

    pub fn statistics(&mut self) -> Result<SchedulerStatistics> {
        let (total_jobs, enabled_jobs) = {
            let jobs = self.all_jobs()?;
            (jobs.len(), jobs.iter().filter(|j| j.is_enabled()).count())
        };
        let mut stats = SchedulerStatistics {
            total_jobs,
            enabled_jobs,
            disabled_jobs: total_jobs - enabled_jobs,
            queue_size: self.queue.as_ref().map_or(0, JobQueue::size),
            ..Default::default()
        };

        if let Some(ref history) = self.history {
            let today = self.env.clock.now().date_naive();
            let entries = history.get_history_range(today, today, None);
            stats.executions_today = entries.len();
            stats.failures_today = entries.iter().filter(|e| !e.success).count();

            let times: Vec<f64> = entries
                .iter()
                .map(|e| e.execution_time)
                .filter(|t| *t > 0.0)
                .collect();
            if !times.is_empty() {
                stats.average_execution_time =
                    round(times.iter().sum::<f64>() / times.len() as f64, 2);
            }
        }

        Ok(stats)
    }

    /// Crontab line that runs `binary run` every minute.
    pub fn cron_command(binary: &str, config_path: Option<&str>) -> String {
        let mut command = format!("{binary} run");
        if let Some(path) = config_path {
            command.push_str(&format!(" --config {}", path.replace(' ', "\\ ")));
        }
        format!("(crontab -l; echo \"* * * * * {command} 1>> /dev/null 2>&1\") | crontab -")
    }

    // --- daemon ----------------------------------------------------------------

    /// Run the due jobs every `interval` and drain the queue every
    /// [`QUEUE_POLL_INTERVAL`] until `shutdown` flips to `true` or a
    /// [`SHUTDOWN_FILE`] appears in the status directory. Needs queue mode.
    pub async fn run_daemon(
        &mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if self.queue.is_none() {
            return Err(SchedulerError::Config(CoreError::Config(
                "daemon mode requires scheduler.modern.enabled".to_string(),
            )));
        }

        info!(interval_secs = interval.as_secs(), "scheduler daemon started");
        let mut run_tick = tokio::time::interval(interval);
        run_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut queue_tick = tokio::time::interval(QUEUE_POLL_INTERVAL);
        queue_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = run_tick.tick() => {
                    if let Err(e) = self.run(None, false).await {
                        error!("scheduled run failed: {e}");
                    }
                }
                _ = queue_tick.tick() => {
                    let summary = self.process_queue().await;
                    if summary.jobs_run > 0 {
                        debug!(jobs_run = summary.jobs_run, "queue drained");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler daemon shutting down");
                        break;
                    }
                }
            }

            if self.take_shutdown_marker() {
                info!("shutdown file found, scheduler daemon stopping");
                break;
            }
        }
        Ok(())
    }

    fn take_shutdown_marker(&self) -> bool {
        let marker = self.config.status_dir().join(SHUTDOWN_FILE);
        if !marker.exists() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(&marker) {
            warn!("cannot remove shutdown marker: {e}");
        }
        true
    }
}

/// Token check whose timing does not depend on how much of the token matches.
fn token_matches(provided: &str, expected: &str) -> bool {
    let tag = |token: &str| {
        Hmac::<Sha256>::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(token.as_bytes());
            mac
        })
    };
    match (tag(provided), tag(expected)) {
        (Ok(mac), Ok(reference)) => mac.verify_slice(&reference.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cronkeep_core::config::{JobDefinition, JobToggle};
    use cronkeep_core::ManualClock;

    use crate::job::CallableError;

    fn config(dir: &std::path::Path) -> SchedulerConfig {
        SchedulerConfig {
            status_path: dir.display().to_string(),
            ..Default::default()
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn env() -> ExecEnv {
        ExecEnv::system().with_clock(Arc::new(ManualClock::new(noon())))
    }

    #[test]
    fn saved_jobs_load_once_and_honour_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        let mut def = JobDefinition::new("echo hi");
        def.id = Some("greet".into());
        cfg.custom_jobs.push(def);
        cfg.status.insert("greet".into(), JobToggle::Disabled);

        let mut scheduler = Scheduler::new(cfg, env()).unwrap();
        scheduler.load_saved_jobs().unwrap();
        scheduler.load_saved_jobs().unwrap();

        let jobs = scheduler.all_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].is_enabled());
    }

    #[test]
    fn bad_definition_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        let mut def = JobDefinition::new("echo hi");
        def.at = Some("61 * * *".into());
        cfg.custom_jobs.push(def);

        let mut scheduler = Scheduler::new(cfg, env()).unwrap();
        assert!(scheduler.load_saved_jobs().is_err());
    }

    #[tokio::test]
    async fn direct_run_records_status_history_and_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(config(dir.path()), env()).unwrap();
        scheduler.schedule(Job::closure("ok", |_| Ok("fine".into())).every_minute());
        scheduler.schedule(
            Job::closure("broken", |_| Err(CallableError::Recoverable("disk full".into())))
                .at("30 * * * *")
                .unwrap(),
        );

        let summary = scheduler.run(Some(noon()), false).await.unwrap();
        assert_eq!(summary.jobs_run, 1);
        assert_eq!(summary.succeeded, 1);

        let summary = scheduler.run(Some(noon()), true).await.unwrap();
        assert_eq!(summary.jobs_run, 2);
        assert_eq!(summary.failed, 1);

        let states = scheduler.job_states();
        assert_eq!(states["ok"].state, RunState::Success);
        assert_eq!(states["broken"].error.as_deref(), Some("disk full"));

        assert_eq!(health::read_last_run(dir.path()), Some(noon()));
        assert_eq!(scheduler.history().unwrap().get_job_history("ok", 0).len(), 2);
        assert!(scheduler.verbose_output()[0].ends_with("Success: Closure"));
        assert!(scheduler.verbose_output()[2].contains("Error: Closure → disk full"));

        scheduler.reset_run();
        assert!(scheduler.executed_jobs().is_empty());
        assert!(scheduler.failed_jobs().is_empty());
    }

    #[tokio::test]
    async fn dependency_waits_for_a_successful_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(config(dir.path()), env()).unwrap();
        scheduler.schedule(Job::closure("child", |_| Ok("child".into())).depends_on("parent"));

        let forced = scheduler.force_run("child").await.unwrap();
        assert!(!forced.success);
        assert_eq!(forced.output, "Dependencies not met");

        scheduler.schedule(Job::closure("parent", |_| Ok("parent".into())));
        assert!(scheduler.force_run("parent").await.unwrap().success);
        assert!(scheduler.force_run("child").await.unwrap().success);
    }

    #[test]
    fn webhook_token_must_match_exactly() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cre", "s3cret"));
        assert!(!token_matches("s3cret!", "s3cret"));
        assert!(!token_matches("S3CRET", "s3cret"));
        assert!(!token_matches("", "s3cret"));
    }

    #[tokio::test]
    async fn webhook_checks_enablement_token_and_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        let mut scheduler = Scheduler::new(cfg.clone(), env()).unwrap();
        let result = scheduler.process_webhook_trigger(None, None).await;
        assert_eq!(result.status, WebhookStatus::Disabled);

        cfg.modern.webhook.enabled = true;
        cfg.modern.webhook.token = Some("s3cret".into());
        let mut scheduler = Scheduler::new(cfg, env()).unwrap();
        scheduler.schedule(Job::closure("ping", |_| Ok("pong".into())));

        let result = scheduler.process_webhook_trigger(Some("nope"), None).await;
        assert_eq!(result.status, WebhookStatus::Unauthorized);
        assert_eq!(result.message, "Invalid webhook token");

        let result = scheduler.process_webhook_trigger(Some("s3cret"), Some("missing")).await;
        assert_eq!(result.status, WebhookStatus::NotFound);
        assert_eq!(result.message, "Job not found: missing");

        let result = scheduler.process_webhook_trigger(Some("s3cret"), Some("ping")).await;
        assert!(result.success && result.forced);
        assert_eq!(result.output.as_deref(), Some("pong"));

        let result = scheduler.process_webhook_trigger(Some("s3cret"), None).await;
        assert_eq!(result.message, "Scheduler executed (due jobs only)");
        assert_eq!(result.jobs_run, Some(1));
    }

    #[tokio::test]
    async fn statistics_count_enabled_jobs_and_todays_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(config(dir.path()), env()).unwrap();
        scheduler.schedule(Job::closure("a", |_| Ok(String::new())));
        scheduler.schedule(Job::closure("b", |_| Ok(String::new())).enabled(false));
        scheduler.run(Some(noon()), false).await.unwrap();

        let stats = scheduler.statistics().unwrap();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.enabled_jobs, 1);
        assert_eq!(stats.disabled_jobs, 1);
        assert_eq!(stats.executions_today, 1);
        assert_eq!(stats.failures_today, 0);
    }

    #[tokio::test]
    async fn daemon_requires_queue_mode_and_stops_on_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(config(dir.path()), env()).unwrap();
        assert!(scheduler
            .run_daemon(Duration::from_secs(60), rx.clone())
            .await
            .is_err());

        let mut cfg = config(dir.path());
        cfg.modern.enabled = true;
        let mut scheduler = Scheduler::new(cfg, env()).unwrap();
        std::fs::write(dir.path().join(SHUTDOWN_FILE), "").unwrap();
        scheduler.run_daemon(Duration::from_secs(60), rx).await.unwrap();
        assert!(!dir.path().join(SHUTDOWN_FILE).exists());
    }

    #[test]
    fn cron_command_escapes_spaces() {
        let line = Scheduler::cron_command("/usr/local/bin/cronkeep", Some("/etc/my conf.toml"));
        assert_eq!(
            line,
            "(crontab -l; echo \"* * * * * /usr/local/bin/cronkeep run --config /etc/my\\ conf.toml 1>> /dev/null 2>&1\") | crontab -"
        );
    }
}
