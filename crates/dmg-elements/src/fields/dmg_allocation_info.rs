use dmg_core::frame_buf::{get_bits, set_bits};
use dmg_core::{Aid, AllocationId, FrameBuf, FrameParseErr, AID_AP};

use crate::enums::allocation_format::AllocationFormat;
use crate::enums::allocation_type::AllocationType;


/// 3 octets, the allocation being requested by a DMG TSPEC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmgAllocationInfo {
    // 4
    pub allocation_id: AllocationId,
    // 3
    pub allocation_type: AllocationType,
    // 1
    pub allocation_format: AllocationFormat,
    // 1
    pub pseudo_static: bool,
    // 1
    pub truncatable: bool,
    // 1
    pub extendable: bool,
    // 1
    pub lp_sc_used: bool,
    // 3
    pub user_priority: u8,
    // 8
    pub destination_aid: Aid,
}

impl Default for DmgAllocationInfo {
    fn default() -> Self {
        DmgAllocationInfo {
            allocation_id: 1,
            allocation_type: AllocationType::ServicePeriod,
            allocation_format: AllocationFormat::Isochronous,
            pseudo_static: false,
            truncatable: false,
            extendable: false,
            lp_sc_used: false,
            user_priority: 0,
            destination_aid: AID_AP,
        }
    }
}

impl DmgAllocationInfo {
    pub fn from_framebuf(buf: &mut FrameBuf) -> Result<Self, FrameParseErr> {
        let [b0, b1, b2] = buf.read_array::<3>("dmg_allocation_info")?;
        let raw = u32::from_le_bytes([b0, b1, b2, 0]) as u64;

        let raw_type = get_bits(raw, 4, 3);
        let allocation_type = AllocationType::try_from(raw_type)
            .map_err(|_| FrameParseErr::InvalidValue { field: "allocation_type", value: raw_type })?;
        let raw_format = get_bits(raw, 7, 1);
        let allocation_format = AllocationFormat::try_from(raw_format)
            .map_err(|_| FrameParseErr::InvalidValue { field: "allocation_format", value: raw_format })?;

        Ok(DmgAllocationInfo {
            allocation_id: get_bits(raw, 0, 4) as u8,
            allocation_type,
            allocation_format,
            pseudo_static: get_bits(raw, 8, 1) != 0,
            truncatable: get_bits(raw, 9, 1) != 0,
            extendable: get_bits(raw, 10, 1) != 0,
            lp_sc_used: get_bits(raw, 11, 1) != 0,
            user_priority: get_bits(raw, 12, 3) as u8,
            destination_aid: get_bits(raw, 15, 8) as u8,
        })
    }

    pub fn to_framebuf(&self, buf: &mut FrameBuf) {
        let mut raw = 0u64;
        raw = set_bits(raw, 0, 4, self.allocation_id as u64);
        raw = set_bits(raw, 4, 3, self.allocation_type.into_raw());
        raw = set_bits(raw, 7, 1, self.allocation_format.into_raw());
        raw = set_bits(raw, 8, 1, self.pseudo_static as u64);
        raw = set_bits(raw, 9, 1, self.truncatable as u64);
        raw = set_bits(raw, 10, 1, self.extendable as u64);
        raw = set_bits(raw, 11, 1, self.lp_sc_used as u64);
        raw = set_bits(raw, 12, 3, self.user_priority as u64);
        raw = set_bits(raw, 15, 8, self.destination_aid as u64);
        let bytes = (raw as u32).to_le_bytes();
        buf.write_bytes(&bytes[..3]);
    }
}
