//! A-MSDU and A-MPDU size accounting.

use dmg_core::MAX_BA_WIN_SIZE;

use crate::frame::Msdu;

/// Destination, source and length fields of an A-MSDU subframe
pub const AMSDU_SUBFRAME_HEADER_LEN: u32 = 14;
/// MPDU delimiter preceding every A-MPDU subframe
pub const AMPDU_DELIMITER_LEN: u32 = 4;

#[inline]
fn pad4(len: u32) -> u32 {
    len.next_multiple_of(4)
}


#[derive(Debug, Clone, Copy)]
pub struct MsduAggregator {
    max_amsdu_size: u32,
}

impl MsduAggregator {
    pub fn new(max_amsdu_size: u32) -> Self {
        MsduAggregator { max_amsdu_size }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_amsdu_size > 0
    }

    /// Subframes are padded to four octets except the last one
    pub fn amsdu_size(msdus: &[Msdu]) -> u32 {
        let n = msdus.len();
        msdus
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let len = AMSDU_SUBFRAME_HEADER_LEN + m.size;
                if i + 1 < n { pad4(len) } else { len }
            })
            .sum()
    }

    /// Whether an MSDU of `msdu_size` octets still fits behind an A-MSDU of
    /// `current` octets
    pub fn can_add(&self, current: u32, msdu_size: u32) -> bool {
        let grown = if current == 0 {
            AMSDU_SUBFRAME_HEADER_LEN + msdu_size
        } else {
            pad4(current) + AMSDU_SUBFRAME_HEADER_LEN + msdu_size
        };
        self.is_enabled() && grown <= self.max_amsdu_size
    }
}


#[derive(Debug, Clone, Copy)]
pub struct MpduAggregator {
    max_ampdu_size: u32,
    max_subframes: usize,
}

impl MpduAggregator {
    pub fn new(max_ampdu_size: u32) -> Self {
        MpduAggregator { max_ampdu_size, max_subframes: MAX_BA_WIN_SIZE as usize }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_ampdu_size > 0
    }

    pub fn ampdu_size(mpdu_sizes: impl Iterator<Item = u32>) -> u32 {
        let mut total = 0;
        for size in mpdu_sizes {
            total = pad4(total) + AMPDU_DELIMITER_LEN + size;
        }
        total
    }

    /// Byte cap and subframe-count cap for appending one more MPDU
    pub fn can_add(&self, current: u32, count: usize, mpdu_size: u32) -> bool {
        let grown = pad4(current) + AMPDU_DELIMITER_LEN + mpdu_size;
        self.is_enabled() && count < self.max_subframes && grown <= self.max_ampdu_size
    }
}
