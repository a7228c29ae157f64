use std::collections::HashMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 1000;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_MAX_OUTPUT_LENGTH: usize = 5000;
pub const DEFAULT_SYSTEMD_UNIT: &str = "cronkeep-scheduler.timer";

/// Top-level config (cronkeep.toml + CRONKEEP_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronkeepConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Directory holding `status.json`, `last_run.txt` and the `shutdown` marker.
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default)]
    pub defaults: JobDefaults,
    /// Per-job enable/disable overrides keyed by job id.
    #[serde(default)]
    pub status: HashMap<String, JobToggle>,
    #[serde(default)]
    pub custom_jobs: Vec<JobDefinition>,
    #[serde(default)]
    pub modern: ModernConfig,
    /// systemd unit probed when reporting active triggers.
    #[serde(default = "default_systemd_unit")]
    pub systemd_unit: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            status_path: default_status_path(),
            defaults: JobDefaults::default(),
            status: HashMap::new(),
            custom_jobs: Vec::new(),
            modern: ModernConfig::default(),
            systemd_unit: default_systemd_unit(),
        }
    }
}

impl SchedulerConfig {
    /// Whether the job with `id` is enabled. Jobs without an override are enabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        !matches!(self.status.get(id), Some(JobToggle::Disabled))
    }

    pub fn status_dir(&self) -> PathBuf {
        PathBuf::from(&self.status_path)
    }

    /// Queue root; relative to `status_path` unless configured.
    pub fn queue_dir(&self) -> PathBuf {
        self.modern
            .queue
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.status_dir().join("queue"))
    }

    /// History root; relative to `status_path` unless configured.
    pub fn history_dir(&self) -> PathBuf {
        self.modern
            .history
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.status_dir().join("history"))
    }
}

/// Defaults applied to every job the scheduler creates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDefaults {
    /// Directory for `only_one` lock files. Falls back to the OS temp dir.
    #[serde(default)]
    pub temp_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobToggle {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Overwrite,
    Append,
}

/// One persisted job definition.
///
/// Only `command` is required. Policy fields are kept as plain strings and
/// validated when the scheduler builds the job, so a typo fails the load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    /// Accepts a list or a whitespace-separated string.
    #[serde(default, deserialize_with = "split_args")]
    pub args: Vec<String>,
    /// Cron expression; every minute when absent.
    #[serde(default)]
    pub at: Option<String>,
    /// Output file(s); accepts a single path or a list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub output: Vec<String>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default, deserialize_with = "one_or_many")]
    pub email: Vec<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<u64>,
    #[serde(default)]
    pub retry_strategy: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub only_one: bool,
}

impl JobDefinition {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            args: Vec::new(),
            at: None,
            output: Vec::new(),
            output_mode: OutputMode::Overwrite,
            email: Vec::new(),
            priority: None,
            max_attempts: None,
            retry_delay: None,
            retry_strategy: None,
            timeout: None,
            depends_on: Vec::new(),
            tags: Vec::new(),
            only_one: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModernConfig {
    /// Queue + workers + history. Off means legacy direct execution.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for ModernConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: DEFAULT_WORKERS,
            queue: QueueConfig::default(),
            history: HistoryConfig::default(),
            webhook: WebhookConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_size: DEFAULT_QUEUE_MAX_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Output bytes kept per history entry.
    #[serde(default = "default_max_output_length")]
    pub max_output_length: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            max_output_length: DEFAULT_MAX_OUTPUT_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bearer token compared against the caller's token. No check when unset.
    #[serde(default)]
    pub token: Option<String>,
    /// HMAC-SHA256 secret accepted as an alternative to the bearer token.
    #[serde(default)]
    pub hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

fn split_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<StringOrList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(StringOrList::One(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(StringOrList::Many(v)) => v,
    })
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<StringOrList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(StringOrList::One(s)) => vec![s],
        Some(StringOrList::Many(v)) => v,
    })
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_queue_max_size() -> usize {
    DEFAULT_QUEUE_MAX_SIZE
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_max_output_length() -> usize {
    DEFAULT_MAX_OUTPUT_LENGTH
}
fn default_systemd_unit() -> String {
    DEFAULT_SYSTEMD_UNIT.to_string()
}
fn default_status_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronkeep/scheduler", home)
}

impl CronkeepConfig {
    /// Load config from a TOML file with CRONKEEP_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. CRONKEEP_CONFIG env var
    ///   3. ~/.cronkeep/cronkeep.toml
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `CRONKEEP_SCHEDULER__MODERN__ENABLED=true`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CRONKEEP_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        if !std::path::Path::new(&path).exists() {
            tracing::warn!(%path, "config file not found, using defaults");
        }

        let config: CronkeepConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONKEEP_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronkeep/cronkeep.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = CronkeepConfig::load(Some("does-not-exist.toml")).expect("load");
            assert!(!config.scheduler.modern.enabled);
            assert_eq!(config.scheduler.modern.workers, 1);
            assert_eq!(config.scheduler.modern.history.retention_days, 30);
            assert_eq!(config.server.port, DEFAULT_PORT);
            Ok(())
        });
    }

    #[test]
    fn custom_jobs_tolerate_missing_optional_fields() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cronkeep.toml",
                r#"
                [scheduler]
                status_path = "/var/lib/cronkeep"

                [scheduler.status]
                backup = "disabled"

                [[scheduler.custom_jobs]]
                command = "ls"

                [[scheduler.custom_jobs]]
                id = "backup"
                command = "tar"
                args = "-czf /tmp/site.tgz /srv/site"
                at = "0 3 * * *"
                output = "/tmp/backup.log"
                output_mode = "append"
                "#,
            )?;

            let config = CronkeepConfig::load(Some("cronkeep.toml")).expect("load");
            let jobs = &config.scheduler.custom_jobs;
            assert_eq!(jobs.len(), 2);
            assert!(jobs[0].id.is_none());
            assert!(jobs[0].args.is_empty());
            assert_eq!(jobs[1].args, vec!["-czf", "/tmp/site.tgz", "/srv/site"]);
            assert_eq!(jobs[1].output, vec!["/tmp/backup.log"]);
            assert_eq!(jobs[1].output_mode, OutputMode::Append);
            assert!(!config.scheduler.is_enabled("backup"));
            assert!(config.scheduler.is_enabled("other"));
            assert_eq!(
                config.scheduler.queue_dir(),
                PathBuf::from("/var/lib/cronkeep/queue")
            );
            Ok(())
        });
    }

    #[test]
    fn env_overrides_nested_keys() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CRONKEEP_SCHEDULER__MODERN__ENABLED", "true");
            jail.set_env("CRONKEEP_SCHEDULER__MODERN__WORKERS", "4");
            let config = CronkeepConfig::load(Some("absent.toml")).expect("load");
            assert!(config.scheduler.modern.enabled);
            assert_eq!(config.scheduler.modern.workers, 4);
            Ok(())
        });
    }

    #[test]
    fn job_without_command_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "bad.toml",
                r#"
                [[scheduler.custom_jobs]]
                id = "nothing"
                "#,
            )?;
            assert!(CronkeepConfig::load(Some("bad.toml")).is_err());
            Ok(())
        });
    }
}
