//! Background execution of runs.

pub mod policy;
pub mod pool;
pub mod run;
