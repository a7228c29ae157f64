//! A unit of schedulable work.
//!
//! A [`Job`] wraps a shell command, a registered static method, or a closure,
//! together with its cron timing, overlap lock, retry policy and callbacks.
//! Jobs are built with consuming builder methods and mutated in place by
//! [`Job::run`] / [`Job::run_with_retry`].

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cronkeep_core::config::{JobDefaults, JobDefinition, OutputMode};
use cronkeep_exec::{CommandLine, ExecOptions, ExecResult, ProcessHandle};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cron::CronSpec;
use crate::env::ExecEnv;
use crate::error::{Result, SchedulerError};
use crate::policy::{Priority, RetryPolicy, RetryStrategy, DEFAULT_TIMEOUT_SECS};
use crate::registry::JobRegistry;
use crate::state::{JobEvent, JobState};

pub type Callable = Arc<dyn Fn(&[String]) -> std::result::Result<String, CallableError> + Send + Sync>;
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;
pub type Hook = Arc<dyn Fn() + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&str, i32) + Send + Sync>;
/// Receives the lock file mtime; returns `true` to run despite the lock.
pub type OverlapFn = Arc<dyn Fn(DateTime<Utc>) -> bool + Send + Sync>;
pub type JobHook = Arc<dyn Fn(&Job) + Send + Sync>;
pub type FailureHook = Arc<dyn Fn(&Job, &str) + Send + Sync>;
pub type RetryHook = Arc<dyn Fn(&Job, u32, &str) + Send + Sync>;

/// Error raised by an in-process job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallableError {
    /// Marks the run failed; retries apply.
    #[error("{0}")]
    Recoverable(String),
    /// Aborts the run and propagates to the caller of `run`.
    #[error("{0}")]
    Fatal(String),
}

// ---------------------------------------------------------------------------
// JobCommand
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum JobCommand {
    Shell(String),
    StaticMethod { target: String, method: String },
    Closure(Callable),
}

impl JobCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            JobCommand::Shell(_) => CommandKind::Shell,
            JobCommand::StaticMethod { .. } => CommandKind::StaticMethod,
            JobCommand::Closure(_) => CommandKind::Closure,
        }
    }

    pub fn is_callable(&self) -> bool {
        !matches!(self, JobCommand::Shell(_))
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobCommand::Shell(cmd) => write!(f, "{cmd}"),
            JobCommand::StaticMethod { target, method } => write!(f, "{target}::{method}"),
            JobCommand::Closure(_) => write!(f, "Closure"),
        }
    }
}

impl fmt::Debug for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({self})", self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Shell,
    StaticMethod,
    Closure,
}

// ---------------------------------------------------------------------------
// JobDescriptor
// ---------------------------------------------------------------------------

/// Plain-data form of a job, as stored in queue items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub kind: CommandKind,
    /// Shell string, `target::method`, or `Closure`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub at: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub run_in_background: bool,
    #[serde(default)]
    pub output_to: Vec<PathBuf>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub email_to: Vec<String>,
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChainedJob {
    pub job: Job,
    pub only_on_success: bool,
}

pub struct Job {
    id: String,
    command: JobCommand,
    args: Vec<String>,
    at: Option<CronSpec>,
    enabled: bool,
    run_in_background: bool,
    temp_dir: PathBuf,
    lock_file: Option<PathBuf>,
    when_overlapping: Option<OverlapFn>,
    truth_test: Option<Predicate>,
    output_to: Vec<PathBuf>,
    output_mode: OutputMode,
    email_to: Vec<String>,
    before: Option<Hook>,
    after: Option<AfterHook>,
    backlink: Option<String>,

    priority: Priority,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    dependencies: Vec<String>,
    chained: Vec<ChainedJob>,
    tags: Vec<String>,
    metadata: BTreeMap<String, serde_json::Value>,
    on_success: Option<JobHook>,
    on_failure: Option<FailureHook>,
    on_retry: Option<RetryHook>,

    state: JobState,
    retry_count: u32,
    output: String,
    return_code: i32,
    execution_time: Duration,
    process: Option<ProcessHandle>,
    queue_id: Option<String>,
}

/// How far a single attempt got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Truth test said no. Nothing changed.
    Skipped,
    /// Dependencies or overlap stopped the run. State is `Failed`.
    Refused,
    /// Background process started; `finalize` pending.
    Started,
    /// Ran to completion. State is `Succeeded` or `Failed`.
    Finished,
}

impl Job {
    fn with_command(command: JobCommand, args: Vec<String>, id: String) -> Self {
        Self {
            id,
            command,
            args,
            at: None,
            enabled: true,
            run_in_background: true,
            temp_dir: std::env::temp_dir(),
            lock_file: None,
            when_overlapping: None,
            truth_test: None,
            output_to: Vec::new(),
            output_mode: OutputMode::Overwrite,
            email_to: Vec::new(),
            before: None,
            after: None,
            backlink: None,
            priority: Priority::Normal,
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            dependencies: Vec::new(),
            chained: Vec::new(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            on_success: None,
            on_failure: None,
            on_retry: None,
            state: JobState::Pending,
            retry_count: 0,
            output: String::new(),
            return_code: 0,
            execution_time: Duration::ZERO,
            process: None,
            queue_id: None,
        }
    }

    /// A shell command. The id is derived from the command string.
    pub fn shell(command: impl Into<String>) -> Self {
        let command = command.into();
        let id = hash_id(&command);
        Self::with_command(JobCommand::Shell(command), Vec::new(), id)
    }

    /// A method registered in the [`MethodTable`](crate::registry::MethodTable).
    pub fn static_method(target: impl Into<String>, method: impl Into<String>) -> Self {
        let (target, method) = (target.into(), method.into());
        let id = hash_id(&format!("{target}::{method}"));
        Self::with_command(JobCommand::StaticMethod { target, method }, Vec::new(), id)
    }

    /// An in-process closure. Closures carry no stable identity, so the id
    /// is required.
    pub fn closure<F>(id: &str, f: F) -> Self
    where
        F: Fn(&[String]) -> std::result::Result<String, CallableError> + Send + Sync + 'static,
    {
        Self::with_command(JobCommand::Closure(Arc::new(f)), Vec::new(), hyphenize(id))
    }

    /// Build a shell job from a persisted definition. Fails on a bad cron
    /// expression or policy value.
    pub fn from_definition(def: &JobDefinition) -> Result<Self> {
        if def.command.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("command is required".into()));
        }

        let mut job = Job::shell(def.command.clone()).with_args(def.args.clone());
        if let Some(ref id) = def.id {
            job = job.with_id(id);
        }
        if let Some(ref at) = def.at {
            job = job.at(at)?;
        }
        if !def.output.is_empty() {
            job = job.output(
                def.output.iter().map(PathBuf::from).collect(),
                def.output_mode == OutputMode::Append,
            );
        }
        if !def.email.is_empty() {
            job = job.email(def.email.clone());
        }
        if let Some(ref p) = def.priority {
            job = job.priority(p.parse()?);
        }
        if let Some(n) = def.max_attempts {
            job = job.max_attempts(n)?;
        }
        if def.retry_delay.is_some() || def.retry_strategy.is_some() {
            let strategy = match def.retry_strategy {
                Some(ref s) => s.parse()?,
                None => job.retry.strategy,
            };
            let delay = def.retry_delay.unwrap_or(job.retry.delay_secs);
            job = job.retry_delay(delay, strategy);
        }
        if let Some(secs) = def.timeout {
            job = job.timeout(secs);
        }
        for dep in &def.depends_on {
            job = job.depends_on(dep);
        }
        job = job.with_tags(def.tags.clone());
        if def.only_one {
            job = job.only_one(None, None);
        }
        Ok(job)
    }

    // --- identity and timing ---------------------------------------------

    /// Explicit id, normalised to lowercase-hyphenated form.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = hyphenize(id);
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn at(mut self, expression: &str) -> Result<Self> {
        self.at = Some(CronSpec::parse(expression)?);
        Ok(self)
    }

    pub fn every_minute(mut self) -> Self {
        self.at = Some(CronSpec::every_minute());
        self
    }

    pub fn hourly(self, minute: u32) -> Result<Self> {
        let minute = check_range(minute, 0, 59)?;
        self.at(&format!("{minute} * * * *"))
    }

    pub fn daily(self, hour: u32, minute: u32) -> Result<Self> {
        let (hour, minute) = (check_range(hour, 0, 23)?, check_range(minute, 0, 59)?);
        self.at(&format!("{minute} {hour} * * *"))
    }

    /// `daily_at("14:30")`; the minutes part is optional.
    pub fn daily_at(self, time: &str) -> Result<Self> {
        let (hour, minute) = parse_hh_mm(time)?;
        self.daily(hour, minute)
    }

    /// `weekday` is 0 (Sunday) to 6 (Saturday).
    pub fn weekly(self, weekday: u32, hour: u32, minute: u32) -> Result<Self> {
        let weekday = check_range(weekday, 0, 6)?;
        let (hour, minute) = (check_range(hour, 0, 23)?, check_range(minute, 0, 59)?);
        self.at(&format!("{minute} {hour} * * {weekday}"))
    }

    /// `month = None` means every month.
    pub fn monthly(self, month: Option<u32>, day: u32, hour: u32, minute: u32) -> Result<Self> {
        let month = match month {
            Some(m) => check_range(m, 1, 12)?.to_string(),
            None => "*".to_string(),
        };
        let day = check_range(day, 1, 31)?;
        let (hour, minute) = (check_range(hour, 0, 23)?, check_range(minute, 0, 59)?);
        self.at(&format!("{minute} {hour} {day} {month} *"))
    }

    pub fn sunday(self, hour: u32, minute: u32) -> Result<Self> {
        self.weekly(0, hour, minute)
    }
    pub fn monday(self, hour: u32, minute: u32) -> Result<Self> {
        self.weekly(1, hour, minute)
    }
    pub fn tuesday(self, hour: u32, minute: u32) -> Result<Self> {
        self.weekly(2, hour, minute)
    }
    pub fn wednesday(self, hour: u32, minute: u32) -> Result<Self> {
        self.weekly(3, hour, minute)
    }
    pub fn thursday(self, hour: u32, minute: u32) -> Result<Self> {
        self.weekly(4, hour, minute)
    }
    pub fn friday(self, hour: u32, minute: u32) -> Result<Self> {
        self.weekly(5, hour, minute)
    }
    pub fn saturday(self, hour: u32, minute: u32) -> Result<Self> {
        self.weekly(6, hour, minute)
    }

    pub fn january(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(1), day, hour, minute)
    }
    pub fn february(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(2), day, hour, minute)
    }
    pub fn march(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(3), day, hour, minute)
    }
    pub fn april(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(4), day, hour, minute)
    }
    pub fn may(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(5), day, hour, minute)
    }
    pub fn june(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(6), day, hour, minute)
    }
    pub fn july(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(7), day, hour, minute)
    }
    pub fn august(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(8), day, hour, minute)
    }
    pub fn september(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(9), day, hour, minute)
    }
    pub fn october(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(10), day, hour, minute)
    }
    pub fn november(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(11), day, hour, minute)
    }
    pub fn december(self, day: u32, hour: u32, minute: u32) -> Result<Self> {
        self.monthly(Some(12), day, hour, minute)
    }

    // --- execution options -------------------------------------------------

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn in_foreground(mut self) -> Self {
        self.run_in_background = false;
        self
    }

    /// Apply scheduler-wide defaults. `temp_dir` only applies if it exists.
    /// A lock file already placed in the old temp dir moves with it.
    pub fn configure(mut self, defaults: &JobDefaults) -> Self {
        if let Some(ref dir) = defaults.temp_dir {
            let dir = PathBuf::from(dir);
            if dir.is_dir() {
                if let Some(ref lock) = self.lock_file {
                    if lock.parent() == Some(self.temp_dir.as_path()) {
                        self.lock_file = Some(dir.join(format!("{}.lock", self.id.trim())));
                    }
                }
                self.temp_dir = dir;
            }
        }
        self
    }

    /// Guard against concurrent runs with a lock file `<dir>/<id>.lock`.
    ///
    /// `dir` falls back to the job's temp dir when unset or missing.
    /// `when_overlapping` gets the lock's mtime and returns `true` to run anyway.
    pub fn only_one(mut self, dir: Option<&Path>, when_overlapping: Option<OverlapFn>) -> Self {
        let dir = match dir {
            Some(d) if d.is_dir() => d.to_path_buf(),
            _ => self.temp_dir.clone(),
        };
        self.lock_file = Some(dir.join(format!("{}.lock", self.id.trim())));
        self.when_overlapping = Some(when_overlapping.unwrap_or_else(|| Arc::new(|_| false)));
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.truth_test = Some(Arc::new(predicate));
        self
    }

    pub fn before<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(f));
        self
    }

    /// Called with `(output, return_code)` after the run. Forces the job
    /// into the foreground unless `run_in_background` is set.
    pub fn then<F>(mut self, f: F, run_in_background: bool) -> Self
    where
        F: Fn(&str, i32) + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(f));
        if !run_in_background {
            self.run_in_background = false;
        }
        self
    }

    pub fn output(mut self, files: Vec<PathBuf>, append: bool) -> Self {
        self.output_to = files;
        self.output_mode = if append {
            OutputMode::Append
        } else {
            OutputMode::Overwrite
        };
        self
    }

    /// Mail the output to `targets`. Forces the job into the foreground.
    pub fn email(mut self, targets: Vec<String>) -> Self {
        self.email_to = targets;
        self.run_in_background = false;
        self
    }

    pub fn backlink(mut self, link: impl Into<String>) -> Self {
        self.backlink = Some(link.into());
        self
    }

    // --- policy ------------------------------------------------------------

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Result<Self> {
        if attempts == 0 {
            return Err(SchedulerError::InvalidJob(
                "max_attempts must be at least 1".into(),
            ));
        }
        self.retry.max_attempts = attempts;
        Ok(self)
    }

    pub fn retry_delay(mut self, secs: u64, strategy: RetryStrategy) -> Self {
        self.retry.delay_secs = secs;
        self.retry.strategy = strategy;
        self
    }

    /// `0` disables the timeout.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    pub fn depends_on(mut self, job_id: &str) -> Self {
        self.dependencies.push(job_id.to_string());
        self
    }

    pub fn chain(mut self, job: Job, only_on_success: bool) -> Self {
        self.chained.push(ChainedJob {
            job,
            only_on_success,
        });
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job, &str) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    /// Called with `(job, attempt, error)` before sleeping for the next attempt.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job, u32, &str) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn set_queue_id(&mut self, queue_id: impl Into<String>) {
        self.queue_id = Some(queue_id.into());
    }

    // --- accessors ---------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &JobCommand {
        &self.command
    }

    /// Display form of the command, without arguments.
    pub fn command_line(&self) -> String {
        self.command.to_string()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cron(&self) -> Option<&CronSpec> {
        self.at.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }

    pub fn get_backlink(&self) -> Option<&str> {
        self.backlink.as_deref()
    }

    pub fn get_priority(&self) -> Priority {
        self.priority
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_successful(&self) -> bool {
        self.state == JobState::Succeeded
    }

    pub fn output_text(&self) -> &str {
        &self.output
    }

    pub fn return_code(&self) -> i32 {
        self.return_code
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn queue_id(&self) -> Option<&str> {
        self.queue_id.as_deref()
    }

    /// A background process has been started and not yet finalized.
    pub fn has_pending_process(&self) -> bool {
        self.process.is_some()
    }

    /// Shell commands run in the background unless forced to the foreground.
    pub fn runs_in_background(&self) -> bool {
        !self.command.is_callable() && self.run_in_background
    }

    /// Due at `now`. A job with no schedule is due every minute.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.at {
            Some(ref spec) => spec.is_due(&now),
            None => true,
        }
    }

    /// A lock file exists and the overlap callback did not allow the run.
    pub fn is_overlapping(&self) -> bool {
        let Some(ref lock) = self.lock_file else {
            return false;
        };
        let Ok(meta) = std::fs::metadata(lock) else {
            return false;
        };
        match (&self.when_overlapping, meta.modified()) {
            (Some(cb), Ok(mtime)) => !cb(DateTime::<Utc>::from(mtime)),
            _ => true,
        }
    }

    // --- running -----------------------------------------------------------

    /// Run once. Returns `Ok(true)` when the command was executed or started,
    /// `Ok(false)` when the truth test, a dependency, or an overlap lock
    /// stopped it.
    ///
    /// A started background process must be collected with [`Job::finalize`].
    pub async fn run(&mut self, env: &ExecEnv) -> Result<bool> {
        let attempt = self.attempt(env).await?;
        Ok(matches!(attempt, Attempt::Started | Attempt::Finished))
    }

    async fn attempt(&mut self, env: &ExecEnv) -> Result<Attempt> {
        if let Some(ref test) = self.truth_test {
            if !test() {
                debug!(job_id = %self.id, "truth test failed, skipping");
                // Nothing ran, so nothing from an earlier run may be reported.
                self.state = JobState::Pending;
                self.output.clear();
                self.return_code = 0;
                return Ok(Attempt::Skipped);
            }
        }

        self.state = self.state.transition(JobEvent::Start)?;

        if let Some(missing) = self.dependencies.iter().find(|d| !env.deps.is_satisfied(d)) {
            warn!(job_id = %self.id, dependency = %missing, "dependencies not met");
            self.output = "Dependencies not met".to_string();
            self.state = self.state.transition(JobEvent::Fail)?;
            return Ok(Attempt::Refused);
        }

        if self.is_overlapping() {
            warn!(job_id = %self.id, "job is overlapping, skipping");
            self.output = "Job is already running".to_string();
            self.state = self.state.transition(JobEvent::Fail)?;
            return Ok(Attempt::Refused);
        }

        // A lock still present here was accepted by the overlap callback.
        let replace = self.lock_file.as_deref().is_some_and(Path::exists);
        match self.create_lock_file(replace) {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %self.id, "lock taken by a concurrent run, skipping");
                self.output = "Job is already running".to_string();
                self.state = self.state.transition(JobEvent::Fail)?;
                return Ok(Attempt::Refused);
            }
            Err(e) => {
                self.state = self.state.transition(JobEvent::Fail)?;
                return Err(e);
            }
        }

        if let Some(ref before) = self.before {
            before();
        }

        match self.command.clone() {
            JobCommand::Shell(program) => {
                let command = CommandLine::new(program, self.args.clone());
                let options = ExecOptions {
                    timeout: self.timeout,
                    cwd: None,
                };

                if self.runs_in_background() {
                    match env.spawner.start(&command, &options).await {
                        Ok(handle) => {
                            info!(job_id = %self.id, command = %command, pid = ?handle.pid(), "job started");
                            self.process = Some(handle);
                            Ok(Attempt::Started)
                        }
                        Err(e) => {
                            self.complete_process(Err(e), env)?;
                            Ok(Attempt::Finished)
                        }
                    }
                } else {
                    info!(job_id = %self.id, command = %command, "job running");
                    let result = env.spawner.run(&command, &options).await;
                    self.complete_process(result, env)?;
                    Ok(Attempt::Finished)
                }
            }
            JobCommand::StaticMethod { target, method } => {
                let result = match env.methods.resolve(&target, &method) {
                    Some(f) => f(&self.args),
                    None => Err(CallableError::Recoverable(format!(
                        "unknown method {target}::{method}"
                    ))),
                };
                self.complete_callable(result, env)?;
                Ok(Attempt::Finished)
            }
            JobCommand::Closure(f) => {
                let result = f(&self.args);
                self.complete_callable(result, env)?;
                Ok(Attempt::Finished)
            }
        }
    }

    /// Wait for a started background process and run the post-run steps.
    /// No-op when nothing was started.
    pub async fn finalize(&mut self, env: &ExecEnv) -> Result<()> {
        if let Some(handle) = self.process.take() {
            let result = handle.wait().await;
            self.complete_process(result, env)?;
        }
        Ok(())
    }

    fn complete_process(
        &mut self,
        result: std::result::Result<ExecResult, cronkeep_exec::ExecError>,
        env: &ExecEnv,
    ) -> Result<()> {
        let succeeded = match result {
            Ok(r) if r.success() => {
                self.return_code = r.exit_code;
                self.output = r.stdout;
                true
            }
            Ok(r) => {
                self.return_code = r.exit_code;
                self.output = r.stderr;
                false
            }
            Err(e) => {
                self.return_code = -1;
                self.output = e.to_string();
                false
            }
        };
        self.settle(succeeded, env)
    }

    fn complete_callable(
        &mut self,
        result: std::result::Result<String, CallableError>,
        env: &ExecEnv,
    ) -> Result<()> {
        match result {
            Ok(out) => {
                self.return_code = 0;
                self.output = out;
                self.settle(true, env)
            }
            Err(CallableError::Recoverable(msg)) => {
                self.return_code = 1;
                self.output = msg;
                self.settle(false, env)
            }
            Err(CallableError::Fatal(message)) => {
                self.return_code = 1;
                self.output = message.clone();
                self.state = self.state.transition(JobEvent::Fail)?;
                self.remove_lock_file();
                Err(SchedulerError::CallableAborted {
                    id: self.id.clone(),
                    message,
                })
            }
        }
    }

    fn settle(&mut self, succeeded: bool, env: &ExecEnv) -> Result<()> {
        let event = if succeeded {
            JobEvent::Succeed
        } else {
            JobEvent::Fail
        };
        self.state = self.state.transition(event)?;
        if succeeded {
            info!(job_id = %self.id, "job succeeded");
        } else {
            warn!(job_id = %self.id, return_code = self.return_code, "job failed");
        }
        self.post_run(env);
        Ok(())
    }

    /// Output files, mail, `after` hook, then release the lock.
    fn post_run(&mut self, env: &ExecEnv) {
        for file in &self.output_to {
            if let Err(e) = write_output(file, &self.output, self.output_mode) {
                warn!(job_id = %self.id, file = %file.display(), "cannot write job output: {e}");
            }
        }

        if !self.output_to.is_empty() && !self.email_to.is_empty() {
            let subject = format!("Scheduled Job [{}]", self.id);
            let body = format!(
                "Output from Job ID: {}\nCommand: {}\n\n{}",
                self.id, self.command, self.output
            );
            env.mailer.send(&subject, &body, &self.email_to);
        }

        if let Some(ref after) = self.after {
            after(&self.output, self.return_code);
        }

        self.remove_lock_file();
    }

    /// Take the overlap lock. `Ok(false)` when another run created it first;
    /// `replace` overwrites a lock the caller has already judged stale.
    fn create_lock_file(&self, replace: bool) -> Result<bool> {
        let Some(ref lock) = self.lock_file else {
            return Ok(true);
        };
        if replace {
            std::fs::write(lock, &self.id)?;
            return Ok(true);
        }
        match std::fs::OpenOptions::new().write(true).create_new(true).open(lock) {
            Ok(mut file) => {
                file.write_all(self.id.as_bytes())?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_lock_file(&self) {
        if let Some(ref lock) = self.lock_file {
            if lock.exists() {
                if let Err(e) = std::fs::remove_file(lock) {
                    warn!(job_id = %self.id, "cannot remove lock file: {e}");
                }
            }
        }
    }

    /// Run up to `max_attempts` times, sleeping between failed attempts.
    ///
    /// Never errors: the outcome is reported through the return value, the
    /// callbacks, and the chained jobs.
    pub fn run_with_retry<'a>(&'a mut self, env: &'a ExecEnv) -> BoxFuture<'a, bool> {
        let max = self.retry.max_attempts.max(1);
        self.run_attempts(env, 1, max)
    }

    /// Run a single attempt numbered `attempt` (1-based) for a queue that
    /// schedules the next delivery itself. Nothing sleeps here; the failure
    /// callback and chained jobs fire only once `max_attempts` is reached.
    pub fn run_delivery<'a>(&'a mut self, env: &'a ExecEnv, attempt: u32) -> BoxFuture<'a, bool> {
        let attempt = attempt.max(1);
        self.run_attempts(env, attempt, attempt)
    }

    fn run_attempts<'a>(
        &'a mut self,
        env: &'a ExecEnv,
        first: u32,
        last: u32,
    ) -> BoxFuture<'a, bool> {
        async move {
            let max = self.retry.max_attempts.max(1);

            for attempt in first..=last {
                self.retry_count = attempt - 1;
                let started = Instant::now();

                let outcome = match self.attempt(env).await {
                    Ok(Attempt::Started) => self.finalize(env).await.map(|_| Attempt::Finished),
                    other => other,
                };
                self.execution_time = started.elapsed();

                let error = match outcome {
                    Ok(Attempt::Skipped) => return false,
                    Ok(Attempt::Finished) if self.is_successful() => {
                        if let Some(cb) = self.on_success.clone() {
                            cb(&*self);
                        }
                        self.run_chained(true, env).await;
                        return true;
                    }
                    Ok(_) => self.output.clone(),
                    Err(e) => {
                        if self.state == JobState::Running {
                            self.state = JobState::Failed;
                        }
                        self.output = e.to_string();
                        self.output.clone()
                    }
                };

                if attempt < max {
                    if let Some(cb) = self.on_retry.clone() {
                        cb(&*self, attempt, &error);
                    }
                    if attempt == last {
                        debug!(job_id = %self.id, attempt, "job attempt failed, left to the queue");
                        break;
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        job_id = %self.id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "job attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        env.clock.sleep(delay).await;
                    }
                } else {
                    if let Ok(s) = self.state.transition(JobEvent::Exhaust) {
                        self.state = s;
                    }
                    warn!(job_id = %self.id, attempts = max, "job exhausted its retries");
                    if let Some(cb) = self.on_failure.clone() {
                        cb(&*self, &error);
                    }
                    self.run_chained(false, env).await;
                }
            }

            false
        }
        .boxed()
    }

    async fn run_chained(&mut self, success: bool, env: &ExecEnv) {
        for chained in self.chained.iter_mut() {
            if chained.only_on_success && !success {
                continue;
            }
            debug!(parent = %self.id, job_id = %chained.job.id, "running chained job");
            chained.job.run_with_retry(env).await;
        }
    }

    // --- descriptors -------------------------------------------------------

    pub fn to_descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            id: self.id.clone(),
            kind: self.command.kind(),
            command: self.command.to_string(),
            args: self.args.clone(),
            at: self.at.as_ref().map(|c| c.source().to_string()),
            enabled: self.enabled,
            priority: self.priority,
            retry: self.retry,
            timeout_secs: self.timeout.map(|t| t.as_secs()),
            dependencies: self.dependencies.clone(),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            run_in_background: self.run_in_background,
            output_to: self.output_to.clone(),
            output_mode: self.output_mode,
            email_to: self.email_to.clone(),
            lock_file: self.lock_file.clone(),
        }
    }

    /// Rebuild a job. A template in `registry` wins; otherwise shell and
    /// static-method jobs are reconstructed from the descriptor. Closures
    /// cannot be reconstructed.
    pub fn from_descriptor(desc: &JobDescriptor, registry: &JobRegistry) -> Result<Self> {
        if let Some(template) = registry.get(&desc.id) {
            let mut job = template.clone();
            job.priority = desc.priority;
            return Ok(job);
        }

        let command = match desc.kind {
            CommandKind::Shell => JobCommand::Shell(desc.command.clone()),
            CommandKind::StaticMethod => {
                let (target, method) = desc.command.split_once("::").ok_or_else(|| {
                    SchedulerError::InvalidJob(format!("bad method reference '{}'", desc.command))
                })?;
                JobCommand::StaticMethod {
                    target: target.to_string(),
                    method: method.to_string(),
                }
            }
            CommandKind::Closure => {
                return Err(SchedulerError::JobNotFound {
                    id: desc.id.clone(),
                })
            }
        };

        let mut job = Job::with_command(command, desc.args.clone(), desc.id.clone());
        if let Some(ref at) = desc.at {
            job.at = Some(CronSpec::parse(at)?);
        }
        job.enabled = desc.enabled;
        job.priority = desc.priority;
        job.retry = desc.retry;
        job.timeout = desc.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs);
        job.dependencies = desc.dependencies.clone();
        job.tags = desc.tags.clone();
        job.metadata = desc.metadata.clone();
        job.run_in_background = desc.run_in_background;
        job.output_to = desc.output_to.clone();
        job.output_mode = desc.output_mode;
        job.email_to = desc.email_to.clone();
        if desc.lock_file.is_some() {
            job.lock_file = desc.lock_file.clone();
            job.when_overlapping = Some(Arc::new(|_| false));
        }
        Ok(job)
    }
}

impl Clone for Job {
    /// Copies configuration and last outcome. A running process is not shared.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            at: self.at.clone(),
            enabled: self.enabled,
            run_in_background: self.run_in_background,
            temp_dir: self.temp_dir.clone(),
            lock_file: self.lock_file.clone(),
            when_overlapping: self.when_overlapping.clone(),
            truth_test: self.truth_test.clone(),
            output_to: self.output_to.clone(),
            output_mode: self.output_mode,
            email_to: self.email_to.clone(),
            before: self.before.clone(),
            after: self.after.clone(),
            backlink: self.backlink.clone(),
            priority: self.priority,
            retry: self.retry,
            timeout: self.timeout,
            dependencies: self.dependencies.clone(),
            chained: self.chained.clone(),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
            on_retry: self.on_retry.clone(),
            state: if self.state == JobState::Running {
                JobState::Pending
            } else {
                self.state
            },
            retry_count: self.retry_count,
            output: self.output.clone(),
            return_code: self.return_code,
            execution_time: self.execution_time,
            process: None,
            queue_id: self.queue_id.clone(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("at", &self.at.as_ref().map(|c| c.source().to_string()))
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_output(file: &Path, output: &str, mode: OutputMode) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(mode == OutputMode::Append)
        .truncate(mode == OutputMode::Overwrite)
        .open(file)?;
    f.write_all(output.as_bytes())
}

fn hash_id(command: &str) -> String {
    let digest = Sha256::digest(command.as_bytes());
    hex::encode(&digest[..16])
}

/// `BackupSite` / `backup_site` / `backup site` → `backup-site`.
pub fn hyphenize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev: Option<char> = None;
    for c in raw.trim().chars() {
        if c.is_uppercase() && prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit()) {
            out.push('-');
        }
        if c == '_' || c.is_whitespace() || c == '-' {
            if !out.ends_with('-') {
                out.push('-');
            }
        } else {
            out.extend(c.to_lowercase());
        }
        prev = Some(c);
    }
    out
}

fn check_range(value: u32, min: u32, max: u32) -> Result<u32> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(SchedulerError::InvalidJob(format!(
            "invalid value {value}: it should be between {min} and {max}"
        )))
    }
}

fn parse_hh_mm(time: &str) -> Result<(u32, u32)> {
    let bad = || SchedulerError::InvalidJob(format!("invalid time '{time}', expected HH:MM"));
    let (h, m) = time.split_once(':').unwrap_or((time, "0"));
    Ok((
        h.trim().parse().map_err(|_| bad())?,
        m.trim().parse().map_err(|_| bad())?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn env() -> ExecEnv {
        ExecEnv::system()
    }

    #[test]
    fn ids_are_hyphenized_or_hashed() {
        assert_eq!(Job::shell("ls").with_id("BackupSite").id(), "backup-site");
        assert_eq!(Job::shell("ls").with_id("clear_cache now").id(), "clear-cache-now");

        let a = Job::shell("echo a");
        let b = Job::shell("echo a");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
        assert_ne!(a.id(), Job::shell("echo b").id());
    }

    #[test]
    fn interval_builders_produce_expected_expressions() {
        let job = Job::shell("ls").daily_at("14:30").unwrap();
        assert_eq!(job.cron().unwrap().source(), "30 14 * * *");

        let job = Job::shell("ls").friday(9, 5).unwrap();
        assert_eq!(job.cron().unwrap().source(), "5 9 * * 5");

        let job = Job::shell("ls").monthly(None, 1, 0, 0).unwrap();
        assert_eq!(job.cron().unwrap().source(), "0 0 1 * *");

        assert!(Job::shell("ls").hourly(60).is_err());
        assert!(Job::shell("ls").weekly(7, 0, 0).is_err());
        assert!(Job::shell("ls").daily_at("noon").is_err());
    }

    #[test]
    fn undefined_schedule_is_every_minute() {
        let job = Job::shell("ls");
        assert!(job.is_due(Utc.with_ymd_and_hms(2024, 5, 1, 3, 17, 0).unwrap()));
    }

    #[test]
    fn callables_never_run_in_background() {
        assert!(Job::shell("ls").runs_in_background());
        assert!(!Job::shell("ls").in_foreground().runs_in_background());
        assert!(!Job::shell("ls").email(vec!["a@b.c".into()]).runs_in_background());
        assert!(!Job::closure("c", |_| Ok(String::new())).runs_in_background());
    }

    #[tokio::test]
    async fn closure_output_and_after_hook() {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let seen2 = seen.clone();
        let mut job = Job::closure("greet", |args| Ok(format!("hi {}", args.join(","))))
            .with_args(vec!["a".into(), "b".into()])
            .then(move |out, code| *seen2.lock().unwrap() = format!("{out}/{code}"), false);

        assert!(job.run(&env()).await.unwrap());
        assert!(job.is_successful());
        assert_eq!(job.output_text(), "hi a,b");
        assert_eq!(*seen.lock().unwrap(), "hi a,b/0");
    }

    #[tokio::test]
    async fn recoverable_error_marks_failure() {
        let mut job = Job::closure("bad", |_| Err(CallableError::Recoverable("nope".into())));
        assert!(job.run(&env()).await.unwrap());
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.output_text(), "nope");
    }

    #[tokio::test]
    async fn fatal_error_propagates_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::closure("boom", |_| Err(CallableError::Fatal("kaput".into())))
            .only_one(Some(dir.path()), None);

        let err = job.run(&env()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::CallableAborted { .. }));
        assert!(!dir.path().join("boom.lock").exists());
    }

    #[tokio::test]
    async fn truth_test_skips_silently() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut job = Job::closure("gated", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        })
        .when(|| false);

        assert!(!job.run(&env()).await.unwrap());
        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skipped_run_forgets_the_previous_outcome() {
        let gate = Arc::new(AtomicBool::new(true));
        let g = gate.clone();
        let mut job = Job::closure("gated", |_| Ok("fresh".to_string()))
            .when(move || g.load(Ordering::SeqCst));

        assert!(job.run(&env()).await.unwrap());
        assert!(job.is_successful());

        gate.store(false, Ordering::SeqCst);
        assert!(!job.run(&env()).await.unwrap());
        assert_eq!(job.state(), JobState::Pending);
        assert!(!job.is_successful());
        assert_eq!(job.output_text(), "");
    }

    #[tokio::test]
    async fn unknown_dependency_is_a_soft_failure() {
        let mut job = Job::closure("child", |_| Ok(String::new())).depends_on("parent");
        assert!(!job.run(&env()).await.unwrap());
        assert_eq!(job.output_text(), "Dependencies not met");
        assert_eq!(job.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn output_files_overwrite_or_append() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.log");

        let mut job = Job::closure("w", |_| Ok("line\n".into())).output(vec![file.clone()], true);
        job.run(&env()).await.unwrap();
        job.run(&env()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "line\nline\n");

        let mut job = Job::closure("w", |_| Ok("once\n".into())).output(vec![file.clone()], false);
        job.run(&env()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "once\n");
    }

    #[tokio::test]
    async fn overlap_callback_can_allow_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("ov.lock");
        std::fs::write(&lock, "ov").unwrap();

        let mut blocked = Job::closure("ov", |_| Ok(String::new())).only_one(Some(dir.path()), None);
        assert!(blocked.is_overlapping());
        assert!(!blocked.run(&env()).await.unwrap());
        assert!(lock.exists());

        let mut allowed = Job::closure("ov", |_| Ok(String::new()))
            .only_one(Some(dir.path()), Some(Arc::new(|_| true)));
        assert!(!allowed.is_overlapping());
        assert!(allowed.run(&env()).await.unwrap());
        assert!(!lock.exists());
    }

    #[test]
    fn lock_file_is_created_exclusively() {
        let dir = tempfile::tempdir().unwrap();
        let first = Job::closure("excl", |_| Ok(String::new())).only_one(Some(dir.path()), None);
        let second = Job::closure("excl", |_| Ok(String::new())).only_one(Some(dir.path()), None);
        let lock = dir.path().join("excl.lock");

        assert!(first.create_lock_file(false).unwrap());
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "excl");
        // The loser of a race between two runs sees the winner's lock.
        assert!(!second.create_lock_file(false).unwrap());
        assert!(second.create_lock_file(true).unwrap());

        first.remove_lock_file();
        assert!(!lock.exists());
    }

    #[test]
    fn descriptor_rebuilds_shell_jobs_but_not_closures() {
        let job = Job::shell("backup.sh")
            .with_id("backup")
            .with_args(vec!["--full".into()])
            .at("0 3 * * *")
            .unwrap()
            .priority(Priority::High)
            .with_tags(vec!["nightly".into()]);
        let desc = job.to_descriptor();

        let rebuilt = Job::from_descriptor(&desc, &JobRegistry::new()).unwrap();
        assert_eq!(rebuilt.id(), "backup");
        assert_eq!(rebuilt.args(), ["--full"]);
        assert_eq!(rebuilt.get_priority(), Priority::High);
        assert!(rebuilt.has_tag("nightly"));
        assert_eq!(rebuilt.to_descriptor(), desc);

        let closure = Job::closure("mem", |_| Ok(String::new())).to_descriptor();
        assert!(Job::from_descriptor(&closure, &JobRegistry::new()).is_err());

        let mut registry = JobRegistry::new();
        registry.register(&Job::closure("mem", |_| Ok("x".into())));
        assert!(Job::from_descriptor(&closure, &registry).is_ok());
    }

    #[test]
    fn definition_with_bad_policy_fails_fast() {
        let mut def = JobDefinition::new("ls");
        def.at = Some("* * *".into());
        assert!(Job::from_definition(&def).is_err());

        let mut def = JobDefinition::new("ls");
        def.priority = Some("urgent".into());
        assert!(Job::from_definition(&def).is_err());

        let mut def = JobDefinition::new("ls");
        def.id = Some("list".into());
        def.retry_strategy = Some("linear".into());
        let job = Job::from_definition(&def).unwrap();
        assert_eq!(job.retry_policy().strategy, RetryStrategy::Linear);
        assert_eq!(job.retry_policy().delay_secs, 60);
    }
}
