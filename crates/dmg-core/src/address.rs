use core::fmt;


/// 48-bit IEEE MAC address
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    /// Locally administered unicast address derived from a node index.
    /// Index 0 is conventionally the AP.
    pub fn from_index(index: u16) -> Self {
        let [hi, lo] = (index + 1).to_be_bytes();
        MacAddr([0x02, 0x00, 0x00, 0x00, hi, lo])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set, covers broadcast as well
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_kinds() {
        let ap = MacAddr::from_index(0);
        assert_eq!(ap.to_string(), "02:00:00:00:00:01");
        assert!(!ap.is_group());
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_group());
        assert_ne!(MacAddr::from_index(1), MacAddr::from_index(2));
    }
}
