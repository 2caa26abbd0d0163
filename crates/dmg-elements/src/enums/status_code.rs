/// Result of an ADDTS negotiation, carried back in the ADDTS response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success = 0,
    /// Unspecified failure
    Failure = 1,
    /// Request declined by the admission policy
    RejectedForDelayPeriod = 47,
}

impl std::convert::TryFrom<u64> for StatusCode {
    type Error = ();
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(StatusCode::Success),
            1 => Ok(StatusCode::Failure),
            47 => Ok(StatusCode::RejectedForDelayPeriod),
            _ => Err(()),
        }
    }
}

impl StatusCode {
    /// Convert this enum back into the raw integer value
    pub fn into_raw(self) -> u64 {
        match self {
            StatusCode::Success => 0,
            StatusCode::Failure => 1,
            StatusCode::RejectedForDelayPeriod => 47,
        }
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

impl Default for StatusCode {
    /// Admission is refused unless a policy explicitly grants it
    fn default() -> Self {
        StatusCode::Failure
    }
}

impl From<StatusCode> for u64 {
    fn from(e: StatusCode) -> Self { e.into_raw() }
}

impl core::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StatusCode::Success => write!(f, "Success"),
            StatusCode::Failure => write!(f, "Failure"),
            StatusCode::RejectedForDelayPeriod => write!(f, "RejectedForDelayPeriod"),
        }
    }
}
