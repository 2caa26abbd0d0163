use core::fmt;

use dmg_core::frame_buf::{get_bits, set_bits};
use dmg_core::{Aid, AllocationId, FrameBuf, FrameParseErr, AID_BROADCAST, BROADCAST_CBAP};

use crate::enums::allocation_type::AllocationType;
use crate::fields::bf_control::BfControlField;

pub type AllocationFieldList = Vec<AllocationField>;

/// Serialized size of one allocation field
pub const ALLOCATION_FIELD_LEN: usize = 15;

/// One scheduled interval within the DTI, as announced in the Extended
/// Schedule element. Times are microseconds relative to the DTI start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationField {
    // 4
    pub allocation_id: AllocationId,
    // 3
    pub allocation_type: AllocationType,
    // 1
    pub pseudo_static: bool,
    // 1
    pub truncatable: bool,
    // 1
    pub extendable: bool,
    // 1
    pub pcp_active: bool,
    // 1
    pub lp_sc_used: bool,
    // 16
    pub bf_control: BfControlField,
    // 8
    pub source_aid: Aid,
    // 8
    pub destination_aid: Aid,
    // 32
    pub allocation_start: u32,
    // 16
    pub block_duration: u16,
    // 8
    pub number_of_blocks: u8,
    /// 16, distance between consecutive blocks, 0 if not periodic
    pub block_period: u16,
}

impl Default for AllocationField {
    fn default() -> Self {
        AllocationField {
            allocation_id: BROADCAST_CBAP,
            allocation_type: AllocationType::Cbap,
            pseudo_static: false,
            truncatable: false,
            extendable: false,
            pcp_active: true,
            lp_sc_used: false,
            bf_control: BfControlField::default(),
            source_aid: AID_BROADCAST,
            destination_aid: AID_BROADCAST,
            allocation_start: 0,
            block_duration: 0,
            number_of_blocks: 1,
            block_period: 0,
        }
    }
}

impl AllocationField {
    pub fn is_broadcast_cbap(&self) -> bool {
        self.allocation_type == AllocationType::Cbap
            && self.source_aid == AID_BROADCAST
            && self.destination_aid == AID_BROADCAST
    }

    /// End of the first block, exclusive
    pub fn first_block_end(&self) -> u32 {
        self.allocation_start + self.block_duration as u32
    }

    /// Start offset of every block of this allocation
    pub fn block_starts(&self) -> impl Iterator<Item = u32> + '_ {
        let period = self.block_period as u32;
        (0..self.number_of_blocks as u32).map(move |i| self.allocation_start + i * period)
    }

    pub fn allocation_control(&self) -> u16 {
        let mut ctrl = 0u64;
        ctrl = set_bits(ctrl, 0, 4, self.allocation_id as u64);
        ctrl = set_bits(ctrl, 4, 3, self.allocation_type.into_raw());
        ctrl = set_bits(ctrl, 7, 1, self.pseudo_static as u64);
        ctrl = set_bits(ctrl, 8, 1, self.truncatable as u64);
        ctrl = set_bits(ctrl, 9, 1, self.extendable as u64);
        ctrl = set_bits(ctrl, 10, 1, self.pcp_active as u64);
        ctrl = set_bits(ctrl, 11, 1, self.lp_sc_used as u64);
        ctrl as u16
    }

    pub fn from_framebuf(buf: &mut FrameBuf) -> Result<Self, FrameParseErr> {
        let ctrl = buf.read_u16("allocation_control")? as u64;
        let allocation_id = get_bits(ctrl, 0, 4) as u8;
        let raw_type = get_bits(ctrl, 4, 3);
        let allocation_type = AllocationType::try_from(raw_type)
            .map_err(|_| FrameParseErr::InvalidValue { field: "allocation_type", value: raw_type })?;
        dmg_core::assert_warn!(get_bits(ctrl, 12, 4) == 0, "reserved allocation control bits not zero");

        Ok(AllocationField {
            allocation_id,
            allocation_type,
            pseudo_static: get_bits(ctrl, 7, 1) != 0,
            truncatable: get_bits(ctrl, 8, 1) != 0,
            extendable: get_bits(ctrl, 9, 1) != 0,
            pcp_active: get_bits(ctrl, 10, 1) != 0,
            lp_sc_used: get_bits(ctrl, 11, 1) != 0,
            bf_control: BfControlField::from_framebuf(buf)?,
            source_aid: buf.read_u8("source_aid")?,
            destination_aid: buf.read_u8("destination_aid")?,
            allocation_start: buf.read_u32("allocation_start")?,
            block_duration: buf.read_u16("block_duration")?,
            number_of_blocks: buf.read_u8("number_of_blocks")?,
            block_period: buf.read_u16("block_period")?,
        })
    }

    pub fn to_framebuf(&self, buf: &mut FrameBuf) {
        buf.write_u16(self.allocation_control());
        self.bf_control.to_framebuf(buf);
        buf.write_u8(self.source_aid);
        buf.write_u8(self.destination_aid);
        buf.write_u32(self.allocation_start);
        buf.write_u16(self.block_duration);
        buf.write_u8(self.number_of_blocks);
        buf.write_u16(self.block_period);
    }
}

impl fmt::Display for AllocationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} id={} {}->{} start={} dur={}",
            self.allocation_type, self.allocation_id, self.source_aid, self.destination_aid,
            self.allocation_start, self.block_duration
        )?;
        if self.number_of_blocks > 1 {
            write!(f, " blocks={} period={}", self.number_of_blocks, self.block_period)?;
        }
        if self.pseudo_static {
            write!(f, " pseudo-static")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dmg_core::debug;

    use super::*;

    #[test]
    fn test_allocation_field_wire_layout() {
        debug::setup_logging_verbose();
        let field = AllocationField {
            allocation_id: 3,
            allocation_type: AllocationType::ServicePeriod,
            pseudo_static: true,
            source_aid: 1,
            destination_aid: 0,
            allocation_start: 0x0102_0304,
            block_duration: 1000,
            number_of_blocks: 4,
            block_period: 25_600,
            ..Default::default()
        };

        let mut buf = FrameBuf::new();
        field.to_framebuf(&mut buf);
        tracing::info!("Serialized: {}", buf.dump_hex());
        assert_eq!(buf.len(), ALLOCATION_FIELD_LEN);
        // id 3, type SP, pseudo-static bit 7, PCP active bit 10
        assert_eq!(&buf.as_bytes()[0..2], &[0x83, 0x04]);
        assert_eq!(&buf.as_bytes()[6..10], &[0x04, 0x03, 0x02, 0x01]);

        let mut rd = FrameBuf::from_vec(buf.into_bytes());
        let parsed = AllocationField::from_framebuf(&mut rd).expect("Failed parsing");
        assert_eq!(parsed, field);
        assert_eq!(rd.get_len_remaining(), 0, "Buffer not fully consumed");
        assert_eq!(parsed.block_starts().collect::<Vec<_>>(), vec![0x0102_0304, 0x0102_0304 + 25_600, 0x0102_0304 + 51_200, 0x0102_0304 + 76_800]);
    }

    #[test]
    fn test_invalid_allocation_type() {
        debug::setup_logging_verbose();
        let mut bytes = vec![0u8; ALLOCATION_FIELD_LEN];
        bytes[0] = 0x50; // type 5
        let mut rd = FrameBuf::from_vec(bytes);
        assert_eq!(
            AllocationField::from_framebuf(&mut rd),
            Err(FrameParseErr::InvalidValue { field: "allocation_type", value: 5 })
        );
    }
}
