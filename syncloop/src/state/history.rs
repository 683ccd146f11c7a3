use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::run::{CopyTableParams, RunOutcome, SyncRunPhase};
use crate::types::StepKind;

/// An entry of a run's append-only history.
///
/// The history is what makes runs resumable: a step with a [`RunEvent::StepCompleted`] entry is
/// never executed again for the same run, its journaled result is reused instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        params: CopyTableParams,
    },
    PhaseChanged {
        from: SyncRunPhase,
        to: SyncRunPhase,
    },
    StepScheduled {
        step: StepKind,
        attempt: u32,
    },
    StepAttemptFailed {
        step: StepKind,
        attempt: u32,
        error: String,
    },
    StepCompleted {
        step: StepKind,
        result: serde_json::Value,
    },
    /// The step failed permanently, either because attempts ran out or the error is not retryable.
    StepFailed {
        step: StepKind,
        error: String,
    },
    CancelRequested,
    RunCompleted {
        outcome: RunOutcome,
    },
    RunFailed {
        phase: SyncRunPhase,
        error: String,
    },
    RunCancelled,
}

impl RunEvent {
    /// Returns the failure message carried by this event, if any.
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            RunEvent::RunFailed { error, .. }
            | RunEvent::StepFailed { error, .. }
            | RunEvent::StepAttemptFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// A [`RunEvent`] as recorded in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the history, starting at 1.
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: RunEvent,
}

/// Returns the failure message reported for a failed run.
///
/// Prefers the run level failure, which names the failed step, and falls back to the earliest
/// step failure in histories written by a run that died before recording its end.
pub fn first_failure_message(history: &[HistoryEvent]) -> Option<String> {
    history
        .iter()
        .find(|entry| matches!(entry.event, RunEvent::RunFailed { .. }))
        .or_else(|| {
            history
                .iter()
                .find(|entry| entry.event.failure_message().is_some())
        })
        .and_then(|entry| entry.event.failure_message())
        .map(str::to_owned)
}
