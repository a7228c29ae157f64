//! Job lifecycle as an explicit state machine.
//!
//! ```text
//! Pending ──start──▶ Running ──succeed──▶ Succeeded
//!                       │
//!                       └────fail────▶ Failed ──start──▶ Running
//!                                        │
//!                                        └──exhaust──▶ Exhausted
//! ```
//!
//! Terminal states may be restarted, which is what a new scheduler tick does.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    Succeed,
    Fail,
    Exhaust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition: {event:?} from {from}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub event: JobEvent,
}

impl JobState {
    pub fn transition(self, event: JobEvent) -> Result<JobState, InvalidTransition> {
        use JobEvent::*;
        use JobState::*;

        match (self, event) {
            (Pending | Failed | Succeeded | Exhausted, Start) => Ok(Running),
            (Running, Succeed) => Ok(Succeeded),
            (Running, Fail) => Ok(Failed),
            (Failed, Exhaust) => Ok(Exhausted),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Exhausted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Exhausted => "exhausted",
        };
        write!(f, "{s}")
    }
}
