pub mod allocation_field;
pub mod bf_control;
pub mod dmg_allocation_info;
