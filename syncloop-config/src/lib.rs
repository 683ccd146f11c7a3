//! Configuration types and loading for the sync workflow engine and its worker process.

mod environment;
mod load;
mod secret;
pub mod shared;

pub use environment::*;
pub use load::*;
pub use secret::*;
