//! File-backed priority queue.
//!
//! Each item is one JSON file living in exactly one of `pending/`,
//! `processing/`, `completed/` or `failed/`. Moving the file with `rename` is
//! the state transition. Structural changes take the `.lock` file, created
//! with exclusive-create semantics; a lock older than [`LOCK_STALE_AFTER`] is
//! treated as abandoned and removed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use cronkeep_core::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::history::{read_json, write_json};
use crate::job::{Job, JobDescriptor};
use crate::policy::{Priority, MAX_RETRY_DELAY_SECS};
use crate::registry::JobRegistry;

pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
pub const LOCK_RETRIES: u32 = 50;
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Base of the re-queue back-off: `min(2^attempts * 60, 3600)` seconds.
pub const REQUEUE_BASE_SECS: u64 = 60;
/// Completed items older than this are deleted on `complete`.
pub const COMPLETED_RETENTION_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// QueueState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Pending,
        QueueState::Processing,
        QueueState::Completed,
        QueueState::Failed,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Processing => "processing",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ---------------------------------------------------------------------------
// QueueItem
// ---------------------------------------------------------------------------

/// On-disk record for one queued execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub job_id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Enqueue time in microseconds; ties within a priority pop oldest first.
    pub timestamp: i64,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// `None` only for hand-written items; such items cannot be popped.
    #[serde(default)]
    pub job: Option<JobDescriptor>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }
}

/// A popped job together with the id needed to `complete` or `fail` it.
#[derive(Debug)]
pub struct QueuedJob {
    pub queue_id: String,
    pub job: Job,
    /// Deliveries that already failed.
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub completed_today: usize,
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Held queue lock. Dropping it removes the lock file.
struct QueueLock {
    path: PathBuf,
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "cannot release queue lock: {e}");
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

pub struct JobQueue {
    root: PathBuf,
    max_size: usize,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    /// Open (and create) the queue directories under `root`.
    pub fn new(root: impl Into<PathBuf>, max_size: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = root.into();
        for state in QueueState::ALL {
            std::fs::create_dir_all(root.join(state.dir_name()))?;
        }
        Ok(Self {
            root,
            max_size,
            clock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // --- structural operations (locked) -----------------------------------

    /// Enqueue `job` for immediate execution. Returns the queue id.
    pub async fn push(&self, job: &Job, priority: Priority) -> Result<String> {
        self.enqueue(job, priority, None).await
    }

    /// Enqueue `job`; `pop` skips it until `scheduled_for`.
    pub async fn push_delayed(
        &self,
        job: &Job,
        scheduled_for: DateTime<Utc>,
        priority: Priority,
    ) -> Result<String> {
        self.enqueue(job, priority, Some(scheduled_for)).await
    }

    async fn enqueue(
        &self,
        job: &Job,
        priority: Priority,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let _lock = self.lock().await?;

        if self.max_size > 0 && self.count(QueueState::Pending) >= self.max_size {
            return Err(SchedulerError::QueueFull { max: self.max_size });
        }

        let now = self.clock.now();
        let mut descriptor = job.to_descriptor();
        descriptor.priority = priority;

        let item = QueueItem {
            id: format!("{}_{}", job.id(), Uuid::now_v7().simple()),
            job_id: job.id().to_string(),
            command: job.command_line(),
            arguments: job.args().to_vec(),
            priority,
            timestamp: now.timestamp_micros(),
            attempts: 0,
            max_attempts: job.retry_policy().max_attempts.max(1),
            created_at: now,
            scheduled_for,
            metadata: job.metadata().clone(),
            job: Some(descriptor),
            last_error: None,
            failed_at: None,
            retry_at: None,
        };

        write_json(&self.item_path(QueueState::Pending, &item.id), &item)?;
        info!(queue_id = %item.id, job_id = %item.job_id, %priority, "job queued");
        Ok(item.id)
    }

    /// Take the next ready item: highest priority first, then oldest.
    ///
    /// Items that cannot be decoded or whose job cannot be rebuilt are moved
    /// to `failed/` and the scan continues. Returns `Ok(None)` when nothing is
    /// ready or the lock is contended.
    pub async fn pop(&self, registry: &JobRegistry) -> Result<Option<QueuedJob>> {
        let _lock = match self.lock().await {
            Ok(lock) => lock,
            Err(SchedulerError::LockTimeout { path }) => {
                warn!(%path, "queue lock busy, skipping pop");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let mut items = Vec::new();
        for path in self.files(QueueState::Pending)? {
            match read_json::<QueueItem>(&path) {
                Some(item) => items.push(item),
                None => self.quarantine(&path),
            }
        }

        items.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.id.cmp(&b.id))
        });

        for mut item in items {
            if !item.is_ready(now) {
                continue;
            }

            let rebuilt = match item.job {
                Some(ref desc) => Job::from_descriptor(desc, registry),
                None => Err(SchedulerError::InvalidJob("queue item has no job".into())),
            };
            let mut job = match rebuilt {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue_id = %item.id, "cannot rebuild queued job: {e}");
                    item.last_error = Some(e.to_string());
                    item.failed_at = Some(now);
                    let from = self.item_path(QueueState::Pending, &item.id);
                    write_json(&from, &item)?;
                    std::fs::rename(&from, self.item_path(QueueState::Failed, &item.id))?;
                    continue;
                }
            };

            std::fs::rename(
                self.item_path(QueueState::Pending, &item.id),
                self.item_path(QueueState::Processing, &item.id),
            )?;
            job.set_queue_id(&item.id);
            debug!(queue_id = %item.id, job_id = %item.job_id, "job dequeued");
            return Ok(Some(QueuedJob {
                queue_id: item.id,
                job,
                attempts: item.attempts,
            }));
        }

        Ok(None)
    }

    /// Mark a processing item done, then prune old completed items.
    pub async fn complete(&self, queue_id: &str) -> Result<()> {
        let _lock = self.lock().await?;

        let from = self.item_path(QueueState::Processing, queue_id);
        if !from.exists() {
            return Err(SchedulerError::JobNotFound {
                id: queue_id.to_string(),
            });
        }
        std::fs::rename(&from, self.item_path(QueueState::Completed, queue_id))?;
        debug!(%queue_id, "queue item completed");

        let cutoff = self.clock.now() - chrono::Duration::hours(COMPLETED_RETENTION_HOURS);
        for path in self.files(QueueState::Completed)? {
            let expired = read_json::<QueueItem>(&path).map_or(true, |i| i.created_at < cutoff);
            if expired {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(file = %path.display(), "cannot prune completed item: {e}");
                }
            }
        }
        Ok(())
    }

    /// Record a failed execution. Below `max_attempts` the item goes back to
    /// pending with a back-off; otherwise it is dead-lettered into `failed/`.
    pub async fn fail(&self, queue_id: &str, error: &str) -> Result<()> {
        let _lock = self.lock().await?;

        let path = self.item_path(QueueState::Processing, queue_id);
        let mut item: QueueItem = read_json(&path).ok_or_else(|| SchedulerError::JobNotFound {
            id: queue_id.to_string(),
        })?;

        let now = self.clock.now();
        item.attempts += 1;
        item.last_error = Some(error.to_string());
        item.failed_at = Some(now);

        if item.attempts < item.max_attempts {
            let delay = requeue_delay(item.attempts);
            let retry_at = now + chrono::Duration::seconds(delay as i64);
            item.retry_at = Some(retry_at);
            item.scheduled_for = Some(retry_at);
            write_json(&path, &item)?;
            std::fs::rename(&path, self.item_path(QueueState::Pending, queue_id))?;
            warn!(%queue_id, attempts = item.attempts, delay_secs = delay, "queue item requeued");
        } else {
            write_json(&path, &item)?;
            std::fs::rename(&path, self.item_path(QueueState::Failed, queue_id))?;
            warn!(%queue_id, attempts = item.attempts, "queue item moved to dead letter");
        }
        Ok(())
    }

    /// Empty the dead-letter directory. Returns how many items were removed.
    pub async fn clear_failed(&self) -> Result<usize> {
        let _lock = self.lock().await?;
        let mut removed = 0;
        for path in self.files(QueueState::Failed)? {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        info!(removed, "dead-letter queue cleared");
        Ok(removed)
    }

    /// Move a dead-lettered item back to pending with its attempts reset.
    pub async fn requeue_failed(&self, queue_id: &str) -> Result<()> {
        let _lock = self.lock().await?;

        let path = self.item_path(QueueState::Failed, queue_id);
        let mut item: QueueItem = read_json(&path).ok_or_else(|| SchedulerError::JobNotFound {
            id: queue_id.to_string(),
        })?;
        item.attempts = 0;
        item.scheduled_for = None;
        item.retry_at = None;
        write_json(&path, &item)?;
        std::fs::rename(&path, self.item_path(QueueState::Pending, queue_id))?;
        info!(%queue_id, "dead-letter item requeued");
        Ok(())
    }

    // --- observation (unlocked) --------------------------------------------

    /// Pending items.
    pub fn size(&self) -> usize {
        self.count(QueueState::Pending)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn statistics(&self) -> QueueStatistics {
        let today = self.clock.now().date_naive();
        let completed_today = self
            .files(QueueState::Completed)
            .unwrap_or_default()
            .iter()
            .filter_map(|p| read_json::<QueueItem>(p))
            .filter(|i| i.created_at.date_naive() == today)
            .count();

        QueueStatistics {
            pending: self.count(QueueState::Pending),
            processing: self.count(QueueState::Processing),
            failed: self.count(QueueState::Failed),
            completed_today,
        }
    }

    /// Readable items in one state directory, oldest first.
    pub fn list(&self, state: QueueState) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self
            .files(state)
            .unwrap_or_default()
            .iter()
            .filter_map(|p| read_json(p))
            .collect();
        items.sort_by_key(|i| i.timestamp);
        items
    }

    /// Which directory currently holds `queue_id`.
    pub fn location(&self, queue_id: &str) -> Option<QueueState> {
        QueueState::ALL
            .into_iter()
            .find(|s| self.item_path(*s, queue_id).exists())
    }

    // --- internals -----------------------------------------------------------

    async fn lock(&self) -> Result<QueueLock> {
        let path = self.root.join(".lock");

        for _ in 0..LOCK_RETRIES {
            if lock_is_stale(&path) {
                warn!(path = %path.display(), "removing stale queue lock");
                let _ = std::fs::remove_file(&path);
            }

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(QueueLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SchedulerError::LockTimeout {
            path: path.display().to_string(),
        })
    }

    fn item_path(&self, state: QueueState, queue_id: &str) -> PathBuf {
        self.root
            .join(state.dir_name())
            .join(format!("{queue_id}.json"))
    }

    fn files(&self, state: QueueState) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.root.join(state.dir_name()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(path);
            }
        }
        Ok(out)
    }

    fn count(&self, state: QueueState) -> usize {
        self.files(state).map(|f| f.len()).unwrap_or(0)
    }

    /// Move an unreadable pending file aside so it is kept but never popped again.
    fn quarantine(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target = self.root.join(QueueState::Failed.dir_name()).join(name);
        match std::fs::rename(path, &target) {
            Ok(()) => warn!(file = %target.display(), "corrupt queue item moved to failed"),
            Err(e) => warn!(file = %path.display(), "cannot move corrupt queue item: {e}"),
        }
    }
}

/// Back-off before a failed queue item becomes ready again.
pub fn requeue_delay(attempts: u32) -> u64 {
    2u64.checked_pow(attempts)
        .and_then(|f| f.checked_mul(REQUEUE_BASE_SECS))
        .map_or(MAX_RETRY_DELAY_SECS, |d| d.min(MAX_RETRY_DELAY_SECS))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cronkeep_core::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn queue(dir: &Path) -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = JobQueue::new(dir, 100, clock.clone()).unwrap();
        (queue, clock)
    }

    #[test]
    fn requeue_delay_doubles_then_caps() {
        assert_eq!(requeue_delay(1), 120);
        assert_eq!(requeue_delay(2), 240);
        assert_eq!(requeue_delay(5), 1920);
        assert_eq!(requeue_delay(6), 3600);
        assert_eq!(requeue_delay(64), 3600);
    }

    #[tokio::test]
    async fn delayed_items_wait_until_due() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, clock) = queue(dir.path());
        let job = Job::shell("echo later").with_id("later");

        queue
            .push_delayed(&job, start() + chrono::Duration::minutes(5), Priority::High)
            .await
            .unwrap();
        assert!(queue.pop(&JobRegistry::new()).await.unwrap().is_none());

        clock.advance(Duration::from_secs(300));
        let popped = queue.pop(&JobRegistry::new()).await.unwrap().unwrap();
        assert_eq!(popped.job.id(), "later");
        assert_eq!(popped.job.queue_id(), Some(popped.queue_id.as_str()));
    }

    #[tokio::test]
    async fn corrupt_and_unresolvable_items_are_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _clock) = queue(dir.path());

        std::fs::write(dir.path().join("pending/garbage.json"), "{not json").unwrap();
        let closure = Job::closure("in-memory", |_| Ok(String::new()));
        let orphan = queue.push(&closure, Priority::High).await.unwrap();
        queue.push(&Job::shell("echo ok").with_id("ok"), Priority::Low).await.unwrap();

        let popped = queue.pop(&JobRegistry::new()).await.unwrap().unwrap();
        assert_eq!(popped.job.id(), "ok");

        assert_eq!(queue.location(&orphan), Some(QueueState::Failed));
        assert!(dir.path().join("failed/garbage.json").exists());
        let failed = queue.list(QueueState::Failed);
        assert!(failed[0].last_error.is_some());
    }

    #[tokio::test]
    async fn completed_items_expire_after_a_day() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, clock) = queue(dir.path());
        let registry = JobRegistry::new();

        queue.push(&Job::shell("echo a").with_id("a"), Priority::Normal).await.unwrap();
        let first = queue.pop(&registry).await.unwrap().unwrap();
        queue.complete(&first.queue_id).await.unwrap();
        assert_eq!(queue.statistics().completed_today, 1);

        clock.advance(Duration::from_secs(25 * 3600));
        queue.push(&Job::shell("echo b").with_id("b"), Priority::Normal).await.unwrap();
        let second = queue.pop(&registry).await.unwrap().unwrap();
        queue.complete(&second.queue_id).await.unwrap();

        assert_eq!(queue.location(&first.queue_id), None);
        assert_eq!(queue.location(&second.queue_id), Some(QueueState::Completed));
    }

    #[tokio::test]
    async fn full_queue_rejects_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let queue = JobQueue::new(dir.path(), 1, clock).unwrap();

        queue.push(&Job::shell("echo 1"), Priority::Normal).await.unwrap();
        let err = queue.push(&Job::shell("echo 2"), Priority::Normal).await.unwrap_err();
        assert_eq!(err.code(), "QUEUE_FULL");
    }

    #[tokio::test]
    async fn requeue_failed_resets_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _clock) = queue(dir.path());
        let job = Job::shell("false").with_id("flaky").max_attempts(1).unwrap();

        let id = queue.push(&job, Priority::Normal).await.unwrap();
        queue.pop(&JobRegistry::new()).await.unwrap().unwrap();
        queue.fail(&id, "exit 1").await.unwrap();
        assert_eq!(queue.location(&id), Some(QueueState::Failed));

        queue.requeue_failed(&id).await.unwrap();
        let item = &queue.list(QueueState::Pending)[0];
        assert_eq!(item.attempts, 0);
        assert!(item.scheduled_for.is_none());

        assert_eq!(queue.clear_failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _clock) = queue(dir.path());
        let lock = dir.path().join(".lock");
        let file = std::fs::File::create(&lock).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();

        queue.push(&Job::shell("echo x"), Priority::Normal).await.unwrap();
        assert!(!lock.exists());
    }
}
