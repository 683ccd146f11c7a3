use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::{ErrorKind, SyncResult};
use crate::state::history::{HistoryEvent, RunEvent};
use crate::sync_error;
use crate::types::StepKind;

/// Replayed view of a run's history.
///
/// Built once when a run worker starts and kept current as the worker appends events, so the
/// workflow can tell which steps already ran and how many attempts each one consumed.
#[derive(Debug, Default, Clone)]
pub struct Journal {
    started: bool,
    cancel_recorded: bool,
    completed: HashMap<StepKind, serde_json::Value>,
    failed: HashMap<StepKind, String>,
    failed_attempts: HashMap<StepKind, u32>,
}

impl Journal {
    pub fn from_history(history: &[HistoryEvent]) -> Self {
        let mut journal = Journal::default();
        for entry in history {
            journal.record(&entry.event);
        }

        journal
    }

    /// Folds a newly appended event into the journal.
    pub fn record(&mut self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { .. } => self.started = true,
            RunEvent::CancelRequested => self.cancel_recorded = true,
            RunEvent::StepCompleted { step, result } => {
                self.completed.insert(*step, result.clone());
            }
            RunEvent::StepFailed { step, error } => {
                self.failed.insert(*step, error.clone());
            }
            RunEvent::StepAttemptFailed { step, attempt, .. } => {
                let failed_attempts = self.failed_attempts.entry(*step).or_default();
                *failed_attempts = (*failed_attempts).max(*attempt);
            }
            _ => {}
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_cancel_recorded(&self) -> bool {
        self.cancel_recorded
    }

    /// Returns the journaled result of `step`, if the step already completed.
    pub fn completed<T: DeserializeOwned>(&self, step: StepKind) -> SyncResult<Option<T>> {
        let Some(result) = self.completed.get(&step) else {
            return Ok(None);
        };

        serde_json::from_value(result.clone())
            .map(Some)
            .map_err(|err| {
                sync_error!(
                    ErrorKind::CorruptHistory,
                    "Journaled step result could not be decoded",
                    format!("step {step}: {err}"),
                    source: err
                )
            })
    }

    /// Returns the error of `step` if it already failed permanently.
    pub fn failed(&self, step: StepKind) -> Option<&str> {
        self.failed.get(&step).map(String::as_str)
    }

    /// Returns whether `step` already completed or failed permanently.
    pub fn is_settled(&self, step: StepKind) -> bool {
        self.completed.contains_key(&step) || self.failed.contains_key(&step)
    }

    /// Number of attempts of `step` that already failed.
    pub fn failed_attempts(&self, step: StepKind) -> u32 {
        self.failed_attempts.get(&step).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::executor::LoadResult;

    fn history(events: Vec<RunEvent>) -> Vec<HistoryEvent> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| HistoryEvent {
                sequence: i as u64 + 1,
                recorded_at: Utc::now(),
                event,
            })
            .collect()
    }

    #[test]
    fn replays_completed_steps_and_attempts() {
        let journal = Journal::from_history(&history(vec![
            RunEvent::StepScheduled {
                step: StepKind::Load,
                attempt: 1,
            },
            RunEvent::StepAttemptFailed {
                step: StepKind::Load,
                attempt: 1,
                error: "connection reset".to_owned(),
            },
            RunEvent::StepScheduled {
                step: StepKind::Load,
                attempt: 2,
            },
            RunEvent::StepCompleted {
                step: StepKind::Load,
                result: json!({"rows_processed": 4, "success": true}),
            },
        ]));

        assert!(!journal.is_started());
        assert!(journal.is_settled(StepKind::Load));
        assert!(!journal.is_settled(StepKind::Transform));
        assert_eq!(journal.failed_attempts(StepKind::Load), 1);
        assert_eq!(journal.failed_attempts(StepKind::Extract), 0);

        let load: LoadResult = journal.completed(StepKind::Load).unwrap().unwrap();
        assert_eq!(load.rows_processed, 4);
        assert!(
            journal
                .completed::<LoadResult>(StepKind::Transform)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn undecodable_result_is_corrupt_history() {
        let journal = Journal::from_history(&history(vec![RunEvent::StepCompleted {
            step: StepKind::Load,
            result: json!("not a load result"),
        }]));

        let err = journal.completed::<LoadResult>(StepKind::Load).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptHistory);
    }
}
