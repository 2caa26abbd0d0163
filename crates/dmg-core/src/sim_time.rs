use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};


/// Span of simulated time with nanosecond resolution.
///
/// Admission logic reasons in whole microseconds while frame-exchange timing
/// reasons in nanoseconds; conversions towards microseconds always round up.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimDuration(u64);

impl SimDuration {
    pub const ZERO: SimDuration = SimDuration(0);

    pub const fn from_nanos(ns: u64) -> Self {
        SimDuration(ns)
    }

    pub const fn from_micros(us: u64) -> Self {
        SimDuration(us * 1_000)
    }

    pub const fn from_millis(ms: u64) -> Self {
        SimDuration(ms * 1_000_000)
    }

    pub fn from_secs_f64(s: f64) -> Self {
        SimDuration((s * 1e9).round().max(0.0) as u64)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole microseconds, rounded up. Never under-estimates.
    pub const fn as_micros_ceil(self) -> u64 {
        self.0.div_ceil(1_000)
    }

    /// Whole microseconds, truncated
    pub const fn as_micros_floor(self) -> u64 {
        self.0 / 1_000
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Rounds up to the next whole microsecond
    pub const fn ceil_to_micros(self) -> Self {
        SimDuration::from_micros(self.as_micros_ceil())
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: SimDuration) -> SimDuration {
        SimDuration(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_sub(self, rhs: SimDuration) -> Option<SimDuration> {
        self.0.checked_sub(rhs.0).map(SimDuration)
    }
}

impl Add for SimDuration {
    type Output = SimDuration;
    fn add(self, rhs: SimDuration) -> SimDuration {
        SimDuration(self.0 + rhs.0)
    }
}

impl AddAssign for SimDuration {
    fn add_assign(&mut self, rhs: SimDuration) {
        self.0 += rhs.0;
    }
}

impl Sub for SimDuration {
    type Output = SimDuration;
    fn sub(self, rhs: SimDuration) -> SimDuration {
        SimDuration(self.0 - rhs.0)
    }
}

impl SubAssign for SimDuration {
    fn sub_assign(&mut self, rhs: SimDuration) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for SimDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1_000 == 0 {
            write!(f, "{}us", self.0 / 1_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

impl fmt::Debug for SimDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}


/// Point on the simulation timeline, nanoseconds since start
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Time elapsed since `earlier`, zero if `earlier` lies in the future
    pub fn since(self, earlier: SimTime) -> SimDuration {
        SimDuration(self.0.saturating_sub(earlier.0))
    }
}

impl Add<SimDuration> for SimTime {
    type Output = SimTime;
    fn add(self, rhs: SimDuration) -> SimTime {
        SimTime(self.0 + rhs.0)
    }
}

impl AddAssign<SimDuration> for SimTime {
    fn add_assign(&mut self, rhs: SimDuration) {
        self.0 += rhs.0;
    }
}

impl Sub for SimTime {
    type Output = SimDuration;
    fn sub(self, rhs: SimTime) -> SimDuration {
        SimDuration(self.0 - rhs.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let us = self.0 / 1_000;
        write!(f, "{:4}.{:06}", us / 1_000_000, us % 1_000_000)
    }
}

impl fmt::Debug for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}


/// Sequence numbers are 12 bits and wrap at this value
pub const SEQ_MODULO: u16 = 4096;

/// Forward distance from `start` to `seq`, in 0..4096
#[inline]
pub fn seq_distance(start: u16, seq: u16) -> u16 {
    (seq.wrapping_sub(start)) % SEQ_MODULO
}

/// Signed difference between two sequence numbers, handling wrap-around.
/// Result is in -2048..2048
pub fn seq_diff(a: u16, b: u16) -> i16 {
    let mut diff = a as i32 - b as i32;
    while diff < -(SEQ_MODULO as i32) / 2 { diff += SEQ_MODULO as i32; }
    while diff >= SEQ_MODULO as i32 / 2 { diff -= SEQ_MODULO as i32; }
    diff as i16
}

#[inline]
pub fn seq_add(seq: u16, n: u16) -> u16 {
    (seq + n) % SEQ_MODULO
}

/// True if `seq` lies behind the window starting at `start`, i.e. in the half
/// of the sequence space preceding it.
#[inline]
pub fn seq_is_old(start: u16, seq: u16) -> bool {
    seq_distance(start, seq) >= SEQ_MODULO / 2
}

/// True if `seq` falls in `[start, start + win_size)` modulo 4096
#[inline]
pub fn seq_in_window(start: u16, seq: u16, win_size: u16) -> bool {
    seq_distance(start, seq) < win_size
}
