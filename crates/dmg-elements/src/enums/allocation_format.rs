/// 1 bit. Isochronous requests carry a min/max allocation pair, asynchronous
/// ones only a minimum (the maximum field is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationFormat {
    Isochronous = 0,
    Asynchronous = 1,
}

impl std::convert::TryFrom<u64> for AllocationFormat {
    type Error = ();
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(AllocationFormat::Isochronous),
            1 => Ok(AllocationFormat::Asynchronous),
            _ => Err(()),
        }
    }
}

impl AllocationFormat {
    /// Convert this enum back into the raw integer value
    pub fn into_raw(self) -> u64 {
        match self {
            AllocationFormat::Isochronous => 0,
            AllocationFormat::Asynchronous => 1,
        }
    }
}

impl From<AllocationFormat> for u64 {
    fn from(e: AllocationFormat) -> Self { e.into_raw() }
}

impl core::fmt::Display for AllocationFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AllocationFormat::Isochronous => write!(f, "Isochronous"),
            AllocationFormat::Asynchronous => write!(f, "Asynchronous"),
        }
    }
}
