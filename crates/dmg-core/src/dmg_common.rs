use core::fmt;

use crate::sim_time::SimDuration;


/// Association identifier of a station within the BSS
pub type Aid = u8;

/// 4-bit allocation identifier, 0 is reserved for broadcast CBAPs
pub type AllocationId = u8;

pub const AID_AP: Aid = 0;
pub const AID_BROADCAST: Aid = 255;

pub const BROADCAST_CBAP: AllocationId = 0;
pub const MAX_ALLOCATION_ID: AllocationId = 15;

/// Longest single SP block in microseconds (15-bit duration field)
pub const MAX_SP_BLOCK_DURATION: u32 = 32767;
/// Longest single CBAP block in microseconds (16-bit duration field)
pub const MAX_CBAP_BLOCK_DURATION: u32 = 65535;
pub const MAX_NUM_BLOCKS: u8 = 255;

/// Gap left between consecutive allocations, in microseconds
pub const GUARD_TIME: u32 = 10;

pub const SIFS: SimDuration = SimDuration::from_micros(3);
pub const SLOT_TIME: SimDuration = SimDuration::from_micros(5);
pub const PIFS: SimDuration = SimDuration::from_micros(8);
pub const SBIFS: SimDuration = SimDuration::from_micros(1);
pub const MBIFS: SimDuration = SimDuration::from_micros(3);

/// Maximum PPDU airtime for the DMG PHY
pub const DMG_PPDU_MAX_TIME: SimDuration = SimDuration::from_millis(2);

/// Traffic identifiers 0..7
pub const NUM_TIDS: usize = 8;

/// Largest Block Ack window the compressed bitmap can describe
pub const MAX_BA_WIN_SIZE: u16 = 64;


/// Phases of a beacon interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelAccessPeriod {
    /// Beacon transmission interval
    Bti,
    /// Association beamforming training
    Abft,
    /// Announcement transmission interval
    Ati,
    /// Beacon header interval, covers BTI, A-BFT and ATI
    Bhi,
    /// Data transfer interval
    Dti,
}

impl fmt::Display for ChannelAccessPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAccessPeriod::Bti => write!(f, "BTI"),
            ChannelAccessPeriod::Abft => write!(f, "A-BFT"),
            ChannelAccessPeriod::Ati => write!(f, "ATI"),
            ChannelAccessPeriod::Bhi => write!(f, "BHI"),
            ChannelAccessPeriod::Dti => write!(f, "DTI"),
        }
    }
}


/// Access category a TID maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessCategory {
    Background,
    BestEffort,
    Video,
    Voice,
}

impl AccessCategory {
    pub fn from_tid(tid: u8) -> Self {
        match tid & 0x07 {
            1 | 2 => AccessCategory::Background,
            0 | 3 => AccessCategory::BestEffort,
            4 | 5 => AccessCategory::Video,
            _ => AccessCategory::Voice,
        }
    }
}
