//! Coarse action status reporting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a batch-job style action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
}

impl ActionStatus {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == ActionStatus::Success
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Success => write!(f, "SUCCESS"),
            ActionStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Status plus payload, as returned by operations wrapped in a retry policy.
///
/// On `Error` the payload usually carries a code (e.g. an HTTP status) that
/// the policy matches against its retryable set.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub status: ActionStatus,
    pub payload: T,
}

impl<T> Outcome<T> {
    pub fn success(payload: T) -> Self {
        Self {
            status: ActionStatus::Success,
            payload,
        }
    }

    pub fn error(payload: T) -> Self {
        Self {
            status: ActionStatus::Error,
            payload,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
