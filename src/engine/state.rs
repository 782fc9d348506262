//! Run lifecycle: PENDING → RUNNING → {COMPLETE | ABORTED}.
//!
//! Terminal states are final. Nothing ever returns to PENDING.

use serde::Serialize;
use std::fmt;

use crate::types::HuntError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Dequeued, nothing evaluated yet.
    Pending,
    Running,
    Complete,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Aborted)
    }

    /// Move to `next`, or fail with `InvalidTransition`.
    pub fn transition(self, next: RunState) -> Result<RunState, HuntError> {
        match (self, next) {
            (RunState::Pending, RunState::Running) => Ok(next),
            (RunState::Running, RunState::Complete) => Ok(next),
            (RunState::Running, RunState::Aborted) => Ok(next),
            _ => Err(HuntError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            }),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "PENDING"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Complete => write!(f, "COMPLETE"),
            RunState::Aborted => write!(f, "ABORTED"),
        }
    }
}
