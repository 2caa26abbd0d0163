use core::fmt;


#[derive(Debug, PartialEq, Eq)]
pub enum FrameParseErr {
    InvalidElementId { expected: u8, found: u8 },
    BufferEnded { field: Option<&'static str> },
    InvalidValue { field: &'static str, value: u64 },
    InconsistentLength { expected: usize, found: usize },
}

impl fmt::Display for FrameParseErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameParseErr::InvalidElementId { expected, found } => {
                write!(f, "invalid element id {}, expected {}", found, expected)
            }
            FrameParseErr::BufferEnded { field: Some(field) } => write!(f, "buffer ended while reading {}", field),
            FrameParseErr::BufferEnded { field: None } => write!(f, "buffer ended"),
            FrameParseErr::InvalidValue { field, value } => write!(f, "invalid value {} for {}", value, field),
            FrameParseErr::InconsistentLength { expected, found } => {
                write!(f, "inconsistent length {}, expected {}", found, expected)
            }
        }
    }
}

impl std::error::Error for FrameParseErr {}
