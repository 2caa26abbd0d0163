//! DMG modulation and coding schemes and the PHY airtime model.

use core::fmt;
use core::str::FromStr;

use serde::Deserialize;

use crate::dmg_common::DMG_PPDU_MAX_TIME;
use crate::sim_time::SimDuration;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModulationClass {
    /// Control PHY, MCS0
    DmgCtrl,
    /// Single carrier PHY, MCS1..12
    DmgSc,
    /// OFDM PHY, MCS13 and up
    DmgOfdm,
}

impl ModulationClass {
    pub fn preamble_duration(self) -> SimDuration {
        match self {
            ModulationClass::DmgCtrl => SimDuration::from_nanos(4291),
            ModulationClass::DmgSc | ModulationClass::DmgOfdm => SimDuration::from_nanos(1891),
        }
    }

    pub fn header_duration(self) -> SimDuration {
        match self {
            ModulationClass::DmgCtrl => SimDuration::from_nanos(4654),
            ModulationClass::DmgSc => SimDuration::from_nanos(582),
            ModulationClass::DmgOfdm => SimDuration::from_nanos(242),
        }
    }

    /// Largest PPDU airtime allowed for this class (aPPDUMaxTime)
    pub fn ppdu_max_time(self) -> SimDuration {
        DMG_PPDU_MAX_TIME
    }
}


#[derive(Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct DmgMcs {
    index: u8,
}

/// Data rate in bits per second, indexed by MCS
const DMG_RATES_BPS: [u64; 17] = [
    27_500_000,
    385_000_000,
    770_000_000,
    962_500_000,
    1_155_000_000,
    1_251_250_000,
    1_540_000_000,
    1_925_000_000,
    2_310_000_000,
    2_502_500_000,
    3_080_000_000,
    3_850_000_000,
    4_620_000_000,
    693_000_000,
    866_250_000,
    1_386_000_000,
    1_732_500_000,
];

pub const MAX_DMG_MCS: u8 = (DMG_RATES_BPS.len() - 1) as u8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMcs(pub String);

impl fmt::Display for UnknownMcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown PHY mode '{}', expected DMG_MCS0..DMG_MCS{}", self.0, MAX_DMG_MCS)
    }
}

impl std::error::Error for UnknownMcs {}

impl DmgMcs {
    /// Control PHY mode used for control frames (RTS, CTS, ACK, BlockAck)
    pub const CONTROL: DmgMcs = DmgMcs { index: 0 };

    pub fn from_index(index: u8) -> Result<Self, UnknownMcs> {
        if index <= MAX_DMG_MCS {
            Ok(DmgMcs { index })
        } else {
            Err(UnknownMcs(format!("DMG_MCS{}", index)))
        }
    }

    pub fn index(self) -> u8 {
        self.index
    }

    pub fn data_rate_bps(self) -> u64 {
        DMG_RATES_BPS[self.index as usize]
    }

    pub fn data_rate_mbps(self) -> f64 {
        self.data_rate_bps() as f64 / 1e6
    }

    pub fn modulation_class(self) -> ModulationClass {
        match self.index {
            0 => ModulationClass::DmgCtrl,
            1..=12 => ModulationClass::DmgSc,
            _ => ModulationClass::DmgOfdm,
        }
    }

    /// Airtime of a PPDU carrying `size` octets: preamble, header and payload.
    /// Payload time is rounded up to whole nanoseconds.
    pub fn tx_duration(self, size: u32) -> SimDuration {
        let class = self.modulation_class();
        class.preamble_duration() + class.header_duration() + self.payload_duration(size)
    }

    pub fn payload_duration(self, size: u32) -> SimDuration {
        let bits = size as u128 * 8;
        let ns = (bits * 1_000_000_000).div_ceil(self.data_rate_bps() as u128);
        SimDuration::from_nanos(ns as u64)
    }
}

impl FromStr for DmgMcs {
    type Err = UnknownMcs;

    fn from_str(s: &str) -> Result<Self, UnknownMcs> {
        let index = s
            .strip_prefix("DMG_MCS")
            .and_then(|n| n.parse::<u8>().ok())
            .ok_or_else(|| UnknownMcs(s.to_string()))?;
        DmgMcs::from_index(index).map_err(|_| UnknownMcs(s.to_string()))
    }
}

impl TryFrom<String> for DmgMcs {
    type Error = UnknownMcs;

    fn try_from(s: String) -> Result<Self, UnknownMcs> {
        s.parse()
    }
}

impl fmt::Display for DmgMcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DMG_MCS{}", self.index)
    }
}

impl fmt::Debug for DmgMcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mcs() {
        let mcs: DmgMcs = "DMG_MCS12".parse().unwrap();
        assert_eq!(mcs.index(), 12);
        assert_eq!(mcs.data_rate_bps(), 4_620_000_000);
        assert_eq!(mcs.modulation_class(), ModulationClass::DmgSc);
        assert_eq!(mcs.to_string(), "DMG_MCS12");

        assert!("DMG_MCS17".parse::<DmgMcs>().is_err());
        assert!("HtMcs7".parse::<DmgMcs>().is_err());
        assert_eq!("DMG_MCS0".parse::<DmgMcs>().unwrap().modulation_class(), ModulationClass::DmgCtrl);
        assert_eq!("DMG_MCS13".parse::<DmgMcs>().unwrap().modulation_class(), ModulationClass::DmgOfdm);
    }

    #[test]
    fn test_tx_duration() {
        let mcs = DmgMcs::CONTROL;
        // 14 octet ACK at 27.5 Mbps: 112 bits -> 4072.7 ns, rounded up
        let d = mcs.tx_duration(14);
        assert_eq!(d.as_nanos(), 4291 + 4654 + 4073);

        // Longer payloads take longer
        let sc = DmgMcs::from_index(12).unwrap();
        assert!(sc.tx_duration(7935) > sc.tx_duration(1500));
    }
}
