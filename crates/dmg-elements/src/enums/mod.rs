pub mod allocation_format;
pub mod allocation_type;
pub mod status_code;
