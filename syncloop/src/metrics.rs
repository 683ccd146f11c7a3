//! Metric names and labels emitted by the orchestration core.

/// Label for the workflow kind of a run.
pub const WORKFLOW_KIND_LABEL: &str = "workflow_kind";

/// Label for how a run was started.
pub const RUN_KIND_LABEL: &str = "kind";

/// Label for the terminal outcome of a run.
pub const OUTCOME_LABEL: &str = "outcome";

/// Label for the step of a run.
pub const STEP_LABEL: &str = "step";

/// Label for the retry directive chosen for a failed step attempt.
pub const RETRY_DIRECTIVE_LABEL: &str = "retry_directive";

// Run metrics

/// Counter of runs started.
pub const SYNCLOOP_RUNS_STARTED_TOTAL: &str = "syncloop_runs_started_total";

/// Counter of runs reaching a terminal phase.
pub const SYNCLOOP_RUNS_FINISHED_TOTAL: &str = "syncloop_runs_finished_total";

/// Gauge of runs currently executing in this process.
pub const SYNCLOOP_ACTIVE_RUNS: &str = "syncloop_active_runs";

// Step metrics

/// Counter of step attempts, replayed steps excluded.
pub const SYNCLOOP_STEP_ATTEMPTS_TOTAL: &str = "syncloop_step_attempts_total";

/// Counter of failed step attempts.
pub const SYNCLOOP_STEP_FAILURES_TOTAL: &str = "syncloop_step_failures_total";

// Schedule metrics

/// Counter of schedule firings that started a run.
pub const SYNCLOOP_SCHEDULE_FIRES_TOTAL: &str = "syncloop_schedule_fires_total";
