//! Step executors perform the actual extract, transform and load work of a run.
//!
//! The orchestration core only sequences, retries and journals these operations. Each one must be
//! idempotent or otherwise safe to retry, since a step can run more than once after a failure or
//! a process restart.

mod base;
pub mod memory;

pub use base::{
    ExtractParams, ExtractResult, LastSyncInfo, LastSyncTimeParams, LoadParams, LoadResult,
    StepExecutor, TransformParams, TransformResult, UpdateLastSyncTimeParams,
};
