use core::fmt;

use dmg_core::AllocationId;


/// Reasons an allocation request cannot be expressed or placed. Policies
/// return `StatusCode::Failure` for plain lack of room and reserve these
/// errors for requests that are malformed or violate a hard limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Allocation id outside 1..=15
    InvalidAllocationId { id: AllocationId },
    /// Splitting a long SP would need ids past 15
    IdOverflow { base: AllocationId, blocks: u32 },
    /// Block duration does not fit the 15-bit (SP) or 16-bit (CBAP) field
    BlockTooLong { duration: u32, limit: u32 },
    MinExceedsMax { min: u32, max: u32 },
    /// Placing the SP would leave less than the minimum broadcast CBAP time
    CbapNotGuaranteed { sp_interval: u32, duration: u32, min_cbap: u32 },
    /// Policy does not handle periodic requests
    PeriodNotSupported { period: u16 },
    /// Periods spanning several beacon intervals are not handled
    MultipleBiPeriod,
    /// No allocation id left for a beamforming SP
    NoFreeAllocationId,
    /// DELTS for an allocation that was never granted
    UnknownAllocation { id: AllocationId, source: u8, destination: u8 },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::InvalidAllocationId { id } => write!(f, "allocation id {} outside 1..=15", id),
            AllocationError::IdOverflow { base, blocks } => {
                write!(f, "{} sub-blocks from allocation id {} overflow id 15", blocks, base)
            }
            AllocationError::BlockTooLong { duration, limit } => {
                write!(f, "block duration {}us exceeds {}us", duration, limit)
            }
            AllocationError::MinExceedsMax { min, max } => {
                write!(f, "minimum allocation {}us exceeds maximum {}us", min, max)
            }
            AllocationError::CbapNotGuaranteed { sp_interval, duration, min_cbap } => write!(
                f,
                "SP of {}us every {}us leaves less than {}us of CBAP",
                duration, sp_interval, min_cbap
            ),
            AllocationError::PeriodNotSupported { period } => {
                write!(f, "allocation period {} not supported by this policy", period)
            }
            AllocationError::MultipleBiPeriod => write!(f, "allocation periods spanning multiple BIs not supported"),
            AllocationError::NoFreeAllocationId => write!(f, "no free allocation id"),
            AllocationError::UnknownAllocation { id, source, destination } => {
                write!(f, "no allocation {} from AID {} to AID {}", id, source, destination)
            }
        }
    }
}

impl std::error::Error for AllocationError {}
