mod base;
mod connection;
mod engine;
mod executor;
mod retry;
mod store;
mod worker;

pub use base::*;
pub use connection::*;
pub use engine::*;
pub use executor::*;
pub use retry::*;
pub use store::*;
pub use worker::*;
