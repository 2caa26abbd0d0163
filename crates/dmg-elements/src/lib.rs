//! DMG information elements exchanged between the AP and its stations
//!
//! - Allocation fields carried in the Extended Schedule element
//! - DMG TSPEC element carried in ADDTS request/response and DELTS
//! - Status codes returned by the admission logic

pub mod elements;
pub mod enums;
pub mod fields;

pub use elements::dmg_tspec::DmgTspecElement;
pub use elements::extended_schedule::ExtendedScheduleElement;
pub use enums::allocation_format::AllocationFormat;
pub use enums::allocation_type::AllocationType;
pub use enums::status_code::StatusCode;
pub use fields::allocation_field::{AllocationField, AllocationFieldList};
pub use fields::bf_control::BfControlField;
pub use fields::dmg_allocation_info::DmgAllocationInfo;
