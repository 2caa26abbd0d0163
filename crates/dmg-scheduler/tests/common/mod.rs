#![allow(dead_code)]

mod scheduler_test;

pub use scheduler_test::{SchedulerTest, TestEvent, addts_responses, schedule_updates, test_config};
