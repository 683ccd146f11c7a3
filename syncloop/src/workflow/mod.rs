//! The copy table workflow and the primitives it is built on.

pub mod copy_table;
pub mod journal;
pub mod retry;
