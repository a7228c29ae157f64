//! Append-only execution log.
//!
//! Every execution is written twice: into the day file `<root>/YYYY-MM-DD.json`
//! and into `<root>/jobs/<job_id>.json`, which keeps the last
//! [`JOB_HISTORY_LIMIT`] entries for that job.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job::Job;
use crate::policy::Priority;

pub const JOB_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub content: String,
    pub truncated: bool,
    /// Byte length of the untruncated output.
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub job_id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub executed_at: DateTime<Utc>,
    /// Unix seconds of `executed_at`.
    pub timestamp: i64,
    pub success: bool,
    pub output: CapturedOutput,
    /// Seconds.
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatistics {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    /// Percentage, two decimals.
    pub success_rate: f64,
    /// Seconds, three decimals, over entries with a positive duration.
    pub average_execution_time: f64,
    pub last_run: Option<HistoryEntry>,
    pub last_success: Option<HistoryEntry>,
    pub last_failure: Option<HistoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub runs: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStatistics {
    pub total_executions: usize,
    pub unique_jobs: usize,
    pub job_statistics: BTreeMap<String, JobCounts>,
    pub period_days: u32,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    ExecutedAt,
    ExecutionTime,
    RetryCount,
    JobId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filters for [`JobHistory::search`]. The date range defaults to the last 7 days.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub job_id: Option<String>,
    pub success: Option<bool>,
    /// Case-insensitive substring of the stored output.
    pub output_contains: Option<String>,
    /// Matches entries sharing at least one tag.
    pub tags: Option<Vec<String>>,
    pub sort_by: Option<SortField>,
    pub sort_order: SortOrder,
    pub limit: Option<usize>,
}

pub struct JobHistory {
    root: PathBuf,
    retention_days: u32,
    max_output_length: usize,
    write_lock: Mutex<()>,
}

impl JobHistory {
    pub fn new(root: impl Into<PathBuf>, retention_days: u32, max_output_length: usize) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("jobs"))?;
        Ok(Self {
            root,
            retention_days,
            max_output_length,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record the current outcome of `job`. Returns the entry id.
    pub fn log_execution(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        let mut merged = job.metadata().clone();
        merged.extend(metadata);

        let entry = HistoryEntry {
            id: format!("{}_{}", job.id(), Uuid::now_v7().simple()),
            job_id: job.id().to_string(),
            command: job.command_line(),
            arguments: job.args().to_vec(),
            executed_at: now,
            timestamp: now.timestamp(),
            success: job.is_successful(),
            output: self.capture(job.output_text()),
            execution_time: job.execution_time().as_secs_f64(),
            retry_count: job.retry_count(),
            priority: job.get_priority(),
            tags: job.tags().to_vec(),
            metadata: merged,
        };
        self.append(entry)
    }

    /// Write a prepared entry to both indices.
    pub fn append(&self, entry: HistoryEntry) -> Result<String> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let day_file = self.day_file(entry.executed_at.date_naive());
        let mut day = load_index(&day_file, entry.executed_at)?;
        day.push(entry.clone());
        write_json(&day_file, &day)?;

        let job_file = self.job_file(&entry.job_id);
        let mut per_job = load_index(&job_file, entry.executed_at)?;
        per_job.push(entry.clone());
        if per_job.len() > JOB_HISTORY_LIMIT {
            per_job.drain(..per_job.len() - JOB_HISTORY_LIMIT);
        }
        write_json(&job_file, &per_job)?;

        debug!(job_id = %entry.job_id, entry_id = %entry.id, "history entry written");
        Ok(entry.id)
    }

    fn capture(&self, output: &str) -> CapturedOutput {
        let length = output.len();
        if length <= self.max_output_length {
            return CapturedOutput {
                content: output.to_string(),
                truncated: false,
                length,
            };
        }
        let mut cut = self.max_output_length;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        CapturedOutput {
            content: output[..cut].to_string(),
            truncated: true,
            length,
        }
    }

    /// Newest first. `limit == 0` returns everything kept.
    pub fn get_job_history(&self, job_id: &str, limit: usize) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = read_json(&self.job_file(job_id)).unwrap_or_default();
        entries.reverse();
        if limit > 0 {
            entries.truncate(limit);
        }
        entries
    }

    /// Outcome of the newest recorded run of `job_id`.
    pub fn latest_outcome(&self, job_id: &str) -> Option<bool> {
        self.get_job_history(job_id, 1).first().map(|e| e.success)
    }

    /// Entries from the day files `start..=end`, optionally for one job.
    pub fn get_history_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        job_id: Option<&str>,
    ) -> Vec<HistoryEntry> {
        let mut out = Vec::new();
        let mut day = start;
        while day <= end {
            let entries: Vec<HistoryEntry> = read_json(&self.day_file(day)).unwrap_or_default();
            out.extend(
                entries
                    .into_iter()
                    .filter(|e| job_id.map_or(true, |id| e.job_id == id)),
            );
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        out
    }

    pub fn get_job_statistics(&self, job_id: &str, days: u32, now: DateTime<Utc>) -> JobStatistics {
        let start = (now - Duration::days(i64::from(days))).date_naive();
        let history = self.get_history_range(start, now.date_naive(), Some(job_id));
        if history.is_empty() {
            return JobStatistics::default();
        }

        let total = history.len();
        let successful = history.iter().filter(|e| e.success).count();
        let times: Vec<f64> = history
            .iter()
            .map(|e| e.execution_time)
            .filter(|t| *t > 0.0)
            .collect();
        let newest = |pred: &dyn Fn(&HistoryEntry) -> bool| {
            history
                .iter()
                .filter(|&e| pred(e))
                .max_by_key(|e| e.timestamp)
                .cloned()
        };

        JobStatistics {
            total_runs: total,
            successful_runs: successful,
            failed_runs: total - successful,
            success_rate: round(successful as f64 / total as f64 * 100.0, 2),
            average_execution_time: if times.is_empty() {
                0.0
            } else {
                round(times.iter().sum::<f64>() / times.len() as f64, 3)
            },
            last_run: newest(&|_| true),
            last_success: newest(&|e| e.success),
            last_failure: newest(&|e| !e.success),
        }
    }

    pub fn get_global_statistics(&self, days: u32, now: DateTime<Utc>) -> GlobalStatistics {
        let from_date = (now - Duration::days(i64::from(days))).date_naive();
        let to_date = now.date_naive();
        let history = self.get_history_range(from_date, to_date, None);

        let mut job_statistics: BTreeMap<String, JobCounts> = BTreeMap::new();
        for entry in &history {
            let counts = job_statistics.entry(entry.job_id.clone()).or_default();
            counts.runs += 1;
            if entry.success {
                counts.success += 1;
            } else {
                counts.failed += 1;
            }
        }

        GlobalStatistics {
            total_executions: history.len(),
            unique_jobs: job_statistics.len(),
            job_statistics,
            period_days: days,
            from_date,
            to_date,
        }
    }

    pub fn search(&self, criteria: &SearchCriteria, now: DateTime<Utc>) -> Vec<HistoryEntry> {
        let start = criteria
            .start_date
            .unwrap_or_else(|| (now - Duration::days(7)).date_naive());
        let end = criteria.end_date.unwrap_or_else(|| now.date_naive());
        let needle = criteria.output_contains.as_ref().map(|s| s.to_lowercase());

        let mut results: Vec<HistoryEntry> = self
            .get_history_range(start, end, criteria.job_id.as_deref())
            .into_iter()
            .filter(|e| criteria.success.map_or(true, |s| e.success == s))
            .filter(|e| {
                needle
                    .as_ref()
                    .map_or(true, |n| e.output.content.to_lowercase().contains(n))
            })
            .filter(|e| {
                criteria
                    .tags
                    .as_ref()
                    .map_or(true, |tags| tags.iter().any(|t| e.tags.contains(t)))
            })
            .collect();

        if let Some(field) = criteria.sort_by {
            results.sort_by(|a, b| {
                let ord = match field {
                    SortField::ExecutedAt => a.timestamp.cmp(&b.timestamp),
                    SortField::ExecutionTime => a.execution_time.total_cmp(&b.execution_time),
                    SortField::RetryCount => a.retry_count.cmp(&b.retry_count),
                    SortField::JobId => a.job_id.cmp(&b.job_id),
                };
                match criteria.sort_order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = criteria.limit {
            results.truncate(limit);
        }
        results
    }

    /// Failed executions in the 24 hours before `now`.
    pub fn count_recent_failures(&self, now: DateTime<Utc>) -> usize {
        let since = now - Duration::hours(24);
        self.get_history_range(since.date_naive(), now.date_naive(), None)
            .iter()
            .filter(|e| !e.success && e.executed_at >= since && e.executed_at <= now)
            .count()
    }

    /// Delete day files older than the retention window. Dates come from the
    /// file name, not its mtime.
    pub fn clean_old_history(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - Duration::days(i64::from(self.retention_days))).date_naive();
        let mut deleted = 0;

        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(date) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if date < cutoff {
                std::fs::remove_file(&path)?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            debug!(deleted, "old history files removed");
        }
        Ok(deleted)
    }

    pub fn export_csv(&self, entries: &[HistoryEntry], path: &Path) -> Result<()> {
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(
            out,
            "Job ID,Executed At,Success,Execution Time,Output Length,Retry Count,Priority,Tags"
        )?;
        for e in entries {
            let row = [
                csv_field(&e.job_id),
                csv_field(&e.executed_at.to_rfc3339()),
                if e.success { "Yes" } else { "No" }.to_string(),
                e.execution_time.to_string(),
                e.output.length.to_string(),
                e.retry_count.to_string(),
                e.priority.to_string(),
                csv_field(&e.tags.join(", ")),
            ];
            writeln!(out, "{}", row.join(","))?;
        }
        out.flush()?;
        Ok(())
    }

    /// Ids of jobs with at least one entry in the per-job index.
    pub fn known_jobs(&self) -> HashSet<String> {
        std::fs::read_dir(self.root.join("jobs"))
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
                    .filter_map(|p| {
                        p.file_stem()
                            .and_then(|s| s.to_str())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn day_file(&self, day: NaiveDate) -> PathBuf {
        self.root.join(format!("{}.json", day.format("%Y-%m-%d")))
    }

    fn job_file(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(format!("{job_id}.json"))
    }
}

pub(crate) fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// `None` when the file is missing; a corrupt file is logged and treated the same.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(file = %path.display(), "unreadable JSON file: {e}");
            None
        }
    }
}

/// Load an index before appending to it. A file that no longer parses is
/// renamed to `<name>.corrupt-<stamp>` and a fresh index is started.
fn load_index(path: &Path, stamp: DateTime<Utc>) -> Result<Vec<HistoryEntry>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&raw) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            let mut aside = path.as_os_str().to_owned();
            aside.push(format!(".corrupt-{}", stamp.format("%Y%m%dT%H%M%S")));
            let aside = PathBuf::from(aside);
            std::fs::rename(path, &aside)?;
            warn!(
                file = %path.display(),
                moved_to = %aside.display(),
                "corrupt history index set aside: {e}"
            );
            Ok(Vec::new())
        }
    }
}

/// Write through a temp file and rename so readers never see a partial file.
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
