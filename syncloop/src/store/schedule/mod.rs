mod base;

pub use base::ScheduleStore;
