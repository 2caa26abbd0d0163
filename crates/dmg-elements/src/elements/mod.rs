pub mod dmg_tspec;
pub mod extended_schedule;

/// Element ID of the DMG TSPEC element
pub const ELEMENT_ID_DMG_TSPEC: u8 = 145;
/// Element ID of the Extended Schedule element
pub const ELEMENT_ID_EXTENDED_SCHEDULE: u8 = 152;
