mod base;

pub use base::RunStore;
