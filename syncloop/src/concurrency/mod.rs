//! Coordination primitives shared by the engine, run workers and the schedule trigger.
//!
//! Both shutdown and cancellation are one-shot latches built on [`signal`]: once raised they stay
//! raised, so a receiver created after the fact still observes them.

pub mod cancel;
pub mod shutdown;
pub mod signal;
