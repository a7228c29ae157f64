//! Dependency gating between jobs.
//!
//! A dependency is satisfied when its most recent outcome is a success.
//! Outcomes seen by this process win over the history on disk; a job that
//! has never run is not satisfied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::history::JobHistory;
use crate::job::Job;
use crate::state::JobState;

pub trait DependencyCheck: Send + Sync {
    fn is_satisfied(&self, job_id: &str) -> bool;
}

/// Tracks outcomes recorded during this process, falling back to history.
pub struct OutcomeTracker {
    session: Mutex<HashMap<String, bool>>,
    history: Option<Arc<JobHistory>>,
}

impl OutcomeTracker {
    pub fn new(history: Option<Arc<JobHistory>>) -> Self {
        Self {
            session: Mutex::new(HashMap::new()),
            history,
        }
    }

    pub fn record(&self, job_id: &str, success: bool) {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string(), success);
    }

    pub fn latest(&self, job_id: &str) -> Option<bool> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .copied();
        session.or_else(|| self.history.as_ref()?.latest_outcome(job_id))
    }

    /// Record the outcome of a job that got past its truth test.
    pub fn note(&self, job: &Job) {
        match job.state() {
            JobState::Succeeded => self.record(job.id(), true),
            JobState::Failed | JobState::Exhausted => self.record(job.id(), false),
            JobState::Pending | JobState::Running => {}
        }
    }

    pub fn clear(&self) {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl DependencyCheck for OutcomeTracker {
    fn is_satisfied(&self, job_id: &str) -> bool {
        self.latest(job_id).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{CapturedOutput, HistoryEntry};
    use crate::policy::Priority;
    use chrono::Utc;

    #[test]
    fn session_outcome_overrides_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(JobHistory::new(dir.path(), 30, 100).unwrap());
        let now = Utc::now();
        history
            .append(HistoryEntry {
                id: "build_1".into(),
                job_id: "build".into(),
                command: "make".into(),
                arguments: vec![],
                executed_at: now,
                timestamp: now.timestamp(),
                success: true,
                output: CapturedOutput {
                    content: String::new(),
                    truncated: false,
                    length: 0,
                },
                execution_time: 1.0,
                retry_count: 0,
                priority: Priority::Normal,
                tags: vec![],
                metadata: Default::default(),
            })
            .unwrap();

        let tracker = OutcomeTracker::new(Some(history));
        assert!(tracker.is_satisfied("build"));
        assert!(!tracker.is_satisfied("deploy"));

        tracker.record("build", false);
        assert!(!tracker.is_satisfied("build"));
    }
}
