mod common;
mod control_test;
mod recovery_test;
mod run_test;
mod schedule_test;
