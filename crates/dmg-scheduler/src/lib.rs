//! Service period admission and DTI scheduling for the DMG AP
//!
//! - `DmgWifiScheduler` follows the beacon interval phases, buffers ADDTS
//!   requests and publishes the allocation list for the next interval
//! - `SchedulerPolicy` implementations decide admission and layout:
//!   CBAP only, basic packing, periodic placement
//! - station-side helpers size SPs for an offered load and build TSPECs

pub mod allocation_error;
pub mod basic;
pub mod cbap_only;
pub mod periodic;
pub mod policy;
pub mod scheduler;
pub mod service_period;

pub use allocation_error::AllocationError;
pub use basic::BasicPolicy;
pub use cbap_only::CbapOnlyPolicy;
pub use periodic::{PeriodicPolicy, Slot};
pub use policy::{SchedulerPolicy, new_policy};
pub use scheduler::{
    AddtsRequest, AllocationKey, DmgWifiScheduler, SchedulerEvent, SchedulerNotification, SchedulerState,
    get_broadcast_cbap_allocation,
};
pub use service_period::{build_dmg_tspec, compute_service_period_duration, split_service_period};
