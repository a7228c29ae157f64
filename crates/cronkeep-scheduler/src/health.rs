//! Health, trigger and statistics reports.
//!
//! These are derived views over the status directory, the queue and the
//! history. Missing files degrade the report (`unknown`, zero counts) instead
//! of failing it.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// No run for longer than this is a warning.
pub const WARNING_AFTER_SECS: i64 = 600;
/// No run for longer than this is critical.
pub const CRITICAL_AFTER_SECS: i64 = 3600;
/// A run this recent counts as an external trigger.
pub const EXTERNAL_TRIGGER_WINDOW_SECS: i64 = 120;

/// Text searched for in `crontab -l` output to detect an installed entry.
pub const CRONTAB_MARKER: &str = "cronkeep run";

pub const LAST_RUN_FILE: &str = "last_run.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthStatus {
    /// Classify by seconds since the last recorded run.
    pub fn from_age(age_secs: Option<i64>) -> Self {
        match age_secs {
            None => HealthStatus::Unknown,
            Some(age) if age > CRITICAL_AFTER_SECS => HealthStatus::Critical,
            Some(age) if age > WARNING_AFTER_SECS => HealthStatus::Warning,
            Some(_) => HealthStatus::Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMethod {
    Cron,
    Systemd,
    Webhook,
    /// Something ran the scheduler recently without a known trigger.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrontabStatus {
    Installed,
    NotInstalled,
    Error,
}

impl CrontabStatus {
    /// Interpret the result of `crontab -l`.
    pub fn from_listing(success: bool, stdout: &str, stderr: &str) -> Self {
        if success {
            if stdout.contains(CRONTAB_MARKER) {
                CrontabStatus::Installed
            } else {
                CrontabStatus::NotInstalled
            }
        } else if stderr.starts_with("crontab: no crontab") {
            CrontabStatus::NotInstalled
        } else {
            CrontabStatus::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub last_run: Option<DateTime<Utc>>,
    /// Seconds since `last_run`.
    pub last_run_age: Option<i64>,
    pub queue_size: usize,
    pub failed_jobs_24h: usize,
    pub scheduled_jobs: usize,
    pub modern_features: bool,
    pub workers: usize,
    pub trigger_methods: Vec<TriggerMethod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub disabled_jobs: usize,
    pub executions_today: usize,
    pub failures_today: usize,
    /// Seconds, two decimals.
    pub average_execution_time: f64,
    pub queue_size: usize,
}

/// Timestamp written by the last completed `run`, if any.
pub fn read_last_run(status_dir: &Path) -> Option<DateTime<Utc>> {
    let raw = std::fs::read_to_string(status_dir.join(LAST_RUN_FILE)).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn write_last_run(status_dir: &Path, at: DateTime<Utc>) -> std::io::Result<()> {
    std::fs::write(status_dir.join(LAST_RUN_FILE), at.to_rfc3339())
}
