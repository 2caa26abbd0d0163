use dmg_core::frame_buf::{get_bits, set_bits};
use dmg_core::{FrameBuf, FrameParseErr};


/// 2 octets. Only the training flags are modelled, the sector/antenna counts
/// are written as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BfControlField {
    pub beamform_training: bool,
    pub initiator_txss: bool,
    pub responder_txss: bool,
}

impl BfControlField {
    pub fn from_framebuf(buf: &mut FrameBuf) -> Result<Self, FrameParseErr> {
        let raw = buf.read_u16("bf_control")? as u64;
        Ok(BfControlField {
            beamform_training: get_bits(raw, 0, 1) != 0,
            initiator_txss: get_bits(raw, 1, 1) != 0,
            responder_txss: get_bits(raw, 2, 1) != 0,
        })
    }

    pub fn to_framebuf(&self, buf: &mut FrameBuf) {
        let mut raw = 0u64;
        raw = set_bits(raw, 0, 1, self.beamform_training as u64);
        raw = set_bits(raw, 1, 1, self.initiator_txss as u64);
        raw = set_bits(raw, 2, 1, self.responder_txss as u64);
        buf.write_u16(raw as u16);
    }
}
