//! Utilities for testing the engine without real connectors.
//!
//! - [`executor`] wraps the in-memory executor with scripted failures, blocking steps and call
//!   notifications.
//! - [`notify`] waits on notifications with a timeout so a broken test fails instead of hanging.

pub mod executor;
pub mod notify;
