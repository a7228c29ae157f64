//! Lookup tables used to turn persisted descriptors back into runnable jobs.
//!
//! Closures and static methods are never serialized. The queue stores a
//! plain [`JobDescriptor`](crate::job::JobDescriptor) and the popping side
//! resolves the job by id here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::job::{Callable, CallableError, Job};

/// Named in-process callables addressed as `target::method`.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, Callable>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, target: &str, method: &str, f: F)
    where
        F: Fn(&[String]) -> Result<String, CallableError> + Send + Sync + 'static,
    {
        self.methods.insert(method_key(target, method), Arc::new(f));
    }

    pub fn resolve(&self, target: &str, method: &str) -> Option<Callable> {
        self.methods.get(&method_key(target, method)).cloned()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

pub fn method_key(target: &str, method: &str) -> String {
    format!("{target}::{method}")
}

/// Jobs known to this process, keyed by id.
#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the template for `job.id()`.
    pub fn register(&mut self, job: &Job) {
        self.jobs.insert(job.id().to_string(), job.clone());
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
