//! Persistence of runs, run histories and schedules.
//!
//! [`run::RunStore`] and [`schedule::ScheduleStore`] are separate traits so components only
//! depend on what they use. The implementations in [`both`] provide both.

pub mod both;
pub mod run;
pub mod schedule;
