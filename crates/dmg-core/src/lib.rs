//! Core utilities for the DMG MAC simulator
//!
//! This crate provides fundamental types and utilities used across the stack:
//! - SimTime / SimDuration with nanosecond resolution, and 12-bit sequence arithmetic
//! - EventQueue, the discrete-event timeline with cancellable timers
//! - MacAddr and AID constants
//! - DMG MCS table and PHY airtime model
//! - FrameBuf for octet-level element encoding
//! - Common macros and debug utilities

pub mod address;
pub mod debug;
pub mod dmg_common;
pub mod event_queue;
pub mod frame_buf;
pub mod frame_parse_error;
pub mod mcs;
pub mod sim_time;

// Re-export commonly used items
pub use address::MacAddr;
pub use dmg_common::*;
pub use event_queue::{EventId, EventQueue, EventScheduler, MappedScheduler, ScopedScheduler};
pub use frame_buf::FrameBuf;
pub use frame_parse_error::FrameParseErr;
pub use mcs::{DmgMcs, ModulationClass, UnknownMcs};
pub use sim_time::{SEQ_MODULO, SimDuration, SimTime, seq_add, seq_diff, seq_distance, seq_in_window, seq_is_old};


/// Traffic identifier, 0..7
pub type Tid = u8;

/// Unique id assigned to each packet entering the MAC
pub type PacketUid = u64;
