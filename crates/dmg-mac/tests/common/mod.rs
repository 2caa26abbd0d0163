#![allow(dead_code)]

mod network_test;

pub use network_test::{NetworkTest, test_config};
