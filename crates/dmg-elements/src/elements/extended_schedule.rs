use dmg_core::{FrameBuf, FrameParseErr};

use crate::elements::ELEMENT_ID_EXTENDED_SCHEDULE;
use crate::fields::allocation_field::{ALLOCATION_FIELD_LEN, AllocationField, AllocationFieldList};

/// Allocation fields fitting in a single element (length octet caps the body at 255)
pub const MAX_FIELDS_PER_ELEMENT: usize = 255 / ALLOCATION_FIELD_LEN;

/// The allocation schedule of one beacon interval
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedScheduleElement {
    pub allocations: AllocationFieldList,
}

impl ExtendedScheduleElement {
    pub fn new(allocations: AllocationFieldList) -> Self {
        ExtendedScheduleElement { allocations }
    }

    /// Writes the schedule, spreading it over as many elements as needed
    pub fn to_framebuf(&self, buf: &mut FrameBuf) {
        if self.allocations.is_empty() {
            buf.write_u8(ELEMENT_ID_EXTENDED_SCHEDULE);
            buf.write_u8(0);
            return;
        }
        for chunk in self.allocations.chunks(MAX_FIELDS_PER_ELEMENT) {
            buf.write_u8(ELEMENT_ID_EXTENDED_SCHEDULE);
            buf.write_u8((chunk.len() * ALLOCATION_FIELD_LEN) as u8);
            for field in chunk {
                field.to_framebuf(buf);
            }
        }
    }

    /// Reads consecutive Extended Schedule elements until the buffer ends
    pub fn from_framebuf(buf: &mut FrameBuf) -> Result<Self, FrameParseErr> {
        let mut allocations = Vec::new();
        while buf.get_len_remaining() > 0 {
            let element_id = buf.read_u8("element_id")?;
            if element_id != ELEMENT_ID_EXTENDED_SCHEDULE {
                return Err(FrameParseErr::InvalidElementId { expected: ELEMENT_ID_EXTENDED_SCHEDULE, found: element_id });
            }
            let length = buf.read_u8("length")? as usize;
            if length % ALLOCATION_FIELD_LEN != 0 {
                return Err(FrameParseErr::InconsistentLength {
                    expected: length - length % ALLOCATION_FIELD_LEN,
                    found: length,
                });
            }
            for _ in 0..length / ALLOCATION_FIELD_LEN {
                allocations.push(AllocationField::from_framebuf(buf)?);
            }
        }
        Ok(ExtendedScheduleElement { allocations })
    }
}

#[cfg(test)]
mod tests {
    use dmg_core::debug;

    use super::*;

    #[test]
    fn test_schedule_spans_multiple_elements() {
        debug::setup_logging_verbose();
        let allocations: Vec<_> = (0..20u32)
            .map(|i| AllocationField { allocation_start: i * 1000, block_duration: 900, ..Default::default() })
            .collect();
        let elem = ExtendedScheduleElement::new(allocations);

        let mut buf = FrameBuf::new();
        elem.to_framebuf(&mut buf);
        // 17 fields in the first element, 3 in the second
        assert_eq!(buf.len(), 2 + 17 * ALLOCATION_FIELD_LEN + 2 + 3 * ALLOCATION_FIELD_LEN);

        let mut rd = FrameBuf::from_vec(buf.into_bytes());
        let parsed = ExtendedScheduleElement::from_framebuf(&mut rd).expect("Failed parsing");
        assert_eq!(parsed, elem);
    }

    #[test]
    fn test_bad_length() {
        let mut rd = FrameBuf::from_bytes(&[ELEMENT_ID_EXTENDED_SCHEDULE, 14]);
        assert!(matches!(
            ExtendedScheduleElement::from_framebuf(&mut rd),
            Err(FrameParseErr::InconsistentLength { found: 14, .. })
        ));
    }
}
