//! `cronkeep-scheduler`: cron matching, jobs, a file-backed queue, execution
//! history and the orchestrator that ties them together.
//!
//! # Overview
//!
//! A [`Scheduler`] holds [`Job`]s. Each `run` executes the jobs whose
//! [`CronSpec`] is due. In queue mode the due jobs go through the [`JobQueue`]
//! (priority order, retry back-off, dead letter) and are drained by a bounded
//! number of concurrent workers. Every execution is recorded in the
//! [`JobHistory`].
//!
//! # Files
//!
//! | Path (under `status_path`) | Contents                                    |
//! |----------------------------|---------------------------------------------|
//! | `status.json`              | Last state per job id                       |
//! | `last_run.txt`             | RFC 3339 time of the last completed run     |
//! | `queue/{pending,processing,completed,failed}/` | One JSON file per queue item |
//! | `history/YYYY-MM-DD.json`  | Executions of that day                      |
//! | `history/jobs/<id>.json`   | Last 100 executions of one job              |

pub mod cron;
pub mod deps;
pub mod env;
pub mod error;
pub mod health;
pub mod history;
pub mod job;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use cron::{CronKind, CronSpec};
pub use deps::{DependencyCheck, OutcomeTracker};
pub use env::{ExecEnv, LogMailer, Mailer};
pub use error::{Result, SchedulerError};
pub use health::{CrontabStatus, HealthReport, HealthStatus, SchedulerStatistics, TriggerMethod};
pub use history::{HistoryEntry, JobHistory, JobStatistics, SearchCriteria};
pub use job::{CallableError, Job, JobCommand, JobDescriptor};
pub use policy::{Priority, RetryPolicy, RetryStrategy};
pub use queue::{JobQueue, QueueItem, QueueState, QueueStatistics, QueuedJob};
pub use registry::{JobRegistry, MethodTable};
pub use scheduler::{ForcedRun, RunSummary, Scheduler, WebhookResult, WebhookStatus};
pub use state::{JobEvent, JobState};
