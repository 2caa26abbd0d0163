/// 3 bits, channel access mechanism used during an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    ServicePeriod = 0,
    Cbap = 1,
}

impl std::convert::TryFrom<u64> for AllocationType {
    type Error = ();
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(AllocationType::ServicePeriod),
            1 => Ok(AllocationType::Cbap),
            _ => Err(()),
        }
    }
}

impl AllocationType {
    /// Convert this enum back into the raw integer value
    pub fn into_raw(self) -> u64 {
        match self {
            AllocationType::ServicePeriod => 0,
            AllocationType::Cbap => 1,
        }
    }
}

impl From<AllocationType> for u64 {
    fn from(e: AllocationType) -> Self { e.into_raw() }
}

impl core::fmt::Display for AllocationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AllocationType::ServicePeriod => write!(f, "SP"),
            AllocationType::Cbap => write!(f, "CBAP"),
        }
    }
}
