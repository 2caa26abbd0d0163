use core::fmt;

use dmg_core::{FrameBuf, FrameParseErr, unimplemented_log};

use crate::elements::ELEMENT_ID_DMG_TSPEC;
use crate::fields::bf_control::BfControlField;
use crate::fields::dmg_allocation_info::DmgAllocationInfo;

/// Length of the element body without traffic scheduling constraints
const TSPEC_BODY_LEN: u8 = 14;
const CONSTRAINT_LEN: usize = 15;

/// Traffic specification for a requested SP or CBAP. Durations are in
/// microseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DmgTspecElement {
    pub allocation_info: DmgAllocationInfo,
    pub bf_control: BfControlField,
    /// 15 bits. Number of allocations per beacon interval, 0 for aperiodic
    pub allocation_period: u16,
    /// 1 bit. Period counts beacon intervals instead of fractions of one
    pub period_multiple_bi: bool,
    pub minimum_allocation: u16,
    /// Reserved for asynchronous requests
    pub maximum_allocation: u16,
    pub minimum_duration: u16,
}

impl DmgTspecElement {
    pub fn from_framebuf(buf: &mut FrameBuf) -> Result<Self, FrameParseErr> {
        let element_id = buf.read_u8("element_id")?;
        if element_id != ELEMENT_ID_DMG_TSPEC {
            return Err(FrameParseErr::InvalidElementId { expected: ELEMENT_ID_DMG_TSPEC, found: element_id });
        }
        let length = buf.read_u8("length")?;
        let start = buf.get_pos();

        let allocation_info = DmgAllocationInfo::from_framebuf(buf)?;
        let bf_control = BfControlField::from_framebuf(buf)?;
        let period_raw = buf.read_u16("allocation_period")?;
        let minimum_allocation = buf.read_u16("minimum_allocation")?;
        let maximum_allocation = buf.read_u16("maximum_allocation")?;
        let minimum_duration = buf.read_u16("minimum_duration")?;
        let num_constraints = buf.read_u8("number_of_constraints")?;

        let expected_len = TSPEC_BODY_LEN as usize + num_constraints as usize * CONSTRAINT_LEN;
        if length as usize != expected_len {
            return Err(FrameParseErr::InconsistentLength { expected: expected_len, found: length as usize });
        }
        if num_constraints > 0 {
            unimplemented_log!("{} traffic scheduling constraints, skipping", num_constraints);
            buf.read_slice(num_constraints as usize * CONSTRAINT_LEN, "constraints")?;
        }
        debug_assert_eq!(buf.get_pos() - start, expected_len);

        Ok(DmgTspecElement {
            allocation_info,
            bf_control,
            allocation_period: period_raw & 0x7fff,
            period_multiple_bi: period_raw & 0x8000 != 0,
            minimum_allocation,
            maximum_allocation,
            minimum_duration,
        })
    }

    pub fn to_framebuf(&self, buf: &mut FrameBuf) {
        buf.write_u8(ELEMENT_ID_DMG_TSPEC);
        buf.write_u8(TSPEC_BODY_LEN);
        self.allocation_info.to_framebuf(buf);
        self.bf_control.to_framebuf(buf);
        buf.write_u16((self.allocation_period & 0x7fff) | ((self.period_multiple_bi as u16) << 15));
        buf.write_u16(self.minimum_allocation);
        buf.write_u16(self.maximum_allocation);
        buf.write_u16(self.minimum_duration);
        buf.write_u8(0);
    }
}

impl fmt::Display for DmgTspecElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.allocation_info;
        write!(
            f,
            "DmgTspec {{ id: {} {} {} dest: {} min: {} max: {} period: {}{} }}",
            info.allocation_id,
            info.allocation_type,
            info.allocation_format,
            info.destination_aid,
            self.minimum_allocation,
            self.maximum_allocation,
            self.allocation_period,
            if self.period_multiple_bi { "xBI" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use dmg_core::debug;

    use super::*;
    use crate::enums::allocation_format::AllocationFormat;

    #[test]
    fn test_dmg_tspec() {
        debug::setup_logging_verbose();
        let tspec = DmgTspecElement {
            allocation_info: DmgAllocationInfo {
                allocation_id: 2,
                allocation_format: AllocationFormat::Asynchronous,
                pseudo_static: true,
                destination_aid: 0,
                ..Default::default()
            },
            allocation_period: 4,
            minimum_allocation: 8000,
            maximum_allocation: 12000,
            minimum_duration: 8000,
            ..Default::default()
        };
        let mut buf = FrameBuf::new();
        tspec.to_framebuf(&mut buf);
        tracing::info!("Serialized {}: {}", tspec, buf.dump_hex());
        assert_eq!(buf.len(), 2 + TSPEC_BODY_LEN as usize);

        let mut rd = FrameBuf::from_vec(buf.into_bytes());
        let parsed = DmgTspecElement::from_framebuf(&mut rd).expect("Failed parsing");
        assert_eq!(parsed, tspec);
        assert_eq!(rd.get_len_remaining(), 0, "Buffer not fully consumed");
    }

    #[test]
    fn test_dmg_tspec_skips_constraints() {
        debug::setup_logging_verbose();
        let mut buf = FrameBuf::new();
        DmgTspecElement::default().to_framebuf(&mut buf);
        let mut bytes = buf.into_bytes();
        bytes[1] = TSPEC_BODY_LEN + CONSTRAINT_LEN as u8;
        let last = bytes.len() - 1;
        bytes[last] = 1;
        bytes.extend_from_slice(&[0u8; CONSTRAINT_LEN]);

        let mut rd = FrameBuf::from_vec(bytes);
        let parsed = DmgTspecElement::from_framebuf(&mut rd).expect("Failed parsing");
        assert_eq!(parsed, DmgTspecElement::default());
        assert_eq!(rd.get_len_remaining(), 0);
    }

    #[test]
    fn test_dmg_tspec_wrong_element() {
        let mut rd = FrameBuf::from_bytes(&[152, 0]);
        assert_eq!(
            DmgTspecElement::from_framebuf(&mut rd),
            Err(FrameParseErr::InvalidElementId { expected: ELEMENT_ID_DMG_TSPEC, found: 152 })
        );
    }
}
