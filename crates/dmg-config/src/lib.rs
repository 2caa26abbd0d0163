//! DMG simulator configuration management
//!
//! This crate provides configuration loading and parsing:
//! - TOML configuration file parsing
//! - Simulation configuration structures and validation
//! - Shared runtime counters

pub mod sim_config;
pub mod toml_config;

pub use sim_config::*;
pub use toml_config::*;
