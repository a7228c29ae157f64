//! Collaborators a job needs while it runs.

use std::sync::Arc;

use cronkeep_core::{Clock, SystemClock};
use cronkeep_exec::{ProcessSpawner, TokioSpawner};
use tracing::info;

use crate::deps::{DependencyCheck, OutcomeTracker};
use crate::registry::MethodTable;

/// Delivers job output to e-mail targets.
pub trait Mailer: Send + Sync {
    fn send(&self, subject: &str, body: &str, to: &[String]);
}

/// Records deliveries in the log instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, subject: &str, body: &str, to: &[String]) {
        info!(%subject, recipients = %to.join(","), bytes = body.len(), "job output mailed");
    }
}

/// Everything `Job::run` and `Job::run_with_retry` reach outside the job for.
#[derive(Clone)]
pub struct ExecEnv {
    pub clock: Arc<dyn Clock>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub mailer: Arc<dyn Mailer>,
    pub deps: Arc<dyn DependencyCheck>,
    pub methods: Arc<MethodTable>,
}

impl ExecEnv {
    /// Wall clock, real processes, log-only mail, in-process outcome tracking.
    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            spawner: Arc::new(TokioSpawner::new()),
            mailer: Arc::new(LogMailer),
            deps: Arc::new(OutcomeTracker::new(None)),
            methods: Arc::new(MethodTable::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_deps(mut self, deps: Arc<dyn DependencyCheck>) -> Self {
        self.deps = deps;
        self
    }

    pub fn with_methods(mut self, methods: Arc<MethodTable>) -> Self {
        self.methods = methods;
        self
    }
}

impl Default for ExecEnv {
    fn default() -> Self {
        Self::system()
    }
}
