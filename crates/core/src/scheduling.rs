//! Task lifecycle state machine and scheduling policy.
//!
//! Every status change a store performs on a task is checked against
//! [`state_machine::valid_transitions`]. Re-runs are the only way out of a
//! terminal status and always go back to `Pending` with a new task run.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::TaskStatus;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::TaskStatus::{self, *};

    /// Target statuses reachable from `from` through normal progress.
    ///
    /// Terminal statuses return an empty slice: leaving them requires an
    /// explicit re-run (see [`rerun_sources`]).
    pub fn valid_transitions(from: TaskStatus) -> &'static [TaskStatus] {
        match from {
            NotStarted => &[Pending, Skipped],
            Pending => &[Running, Canceled, Skipped],
            Running => &[Done, Failed, Canceled],
            Done | Failed | Canceled | Skipped => &[],
        }
    }

    /// Statuses a plain trigger may start a first run from.
    pub fn trigger_sources() -> &'static [TaskStatus] {
        &[NotStarted]
    }

    /// Statuses an explicit re-run request may restart from.
    pub fn rerun_sources() -> &'static [TaskStatus] {
        &[Done, Failed, Canceled, Skipped]
    }

    /// Statuses an administrative skip applies to.
    pub fn skip_sources() -> &'static [TaskStatus] {
        &[NotStarted, Pending]
    }

    /// Check whether a transition from `from` to `to` is valid.
    ///
    /// `terminal -> Pending` counts as valid because it is the re-run edge.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        valid_transitions(from).contains(&to) || (to == Pending && rerun_sources().contains(&from))
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid task transition: {from} -> {to}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Stage sequencing
// ---------------------------------------------------------------------------

/// Cross-stage sequencing policy, read from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSequencing {
    /// Any stage may be triggered at any time.
    #[default]
    Independent,
    /// A stage may only be triggered once every earlier stage has finished
    /// (all of its tasks `Done` or `Skipped`).
    Sequential,
}

impl std::str::FromStr for StageSequencing {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "independent" => Ok(Self::Independent),
            "sequential" => Ok(Self::Sequential),
            other => Err(CoreError::Validation(format!(
                "Unknown stage sequencing policy '{other}'. Must be one of: independent, sequential"
            ))),
        }
    }
}

/// Whether a task status counts as "finished" for sequential stage gating.
pub fn is_stage_complete_status(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Done | TaskStatus::Skipped)
}
