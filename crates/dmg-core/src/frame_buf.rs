use std::fmt;

use crate::frame_parse_error::FrameParseErr;


/// Octet buffer for 802.11 elements. Multi-octet fields are little endian,
/// as on the air.
pub struct FrameBuf {
    buffer: Vec<u8>,
    /// next octet offset for reads
    pos: usize,
}

impl FrameBuf {
    /// Empty buffer for writing
    pub fn new() -> Self {
        FrameBuf { buffer: Vec::new(), pos: 0 }
    }

    pub fn with_capacity(cap: usize) -> Self {
        FrameBuf { buffer: Vec::with_capacity(cap), pos: 0 }
    }

    /// Wrap an existing byte-vector, read position at the start
    pub fn from_vec(data: Vec<u8>) -> Self {
        FrameBuf { buffer: data, pos: 0 }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        FrameBuf { buffer: data.to_vec(), pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn get_pos(&self) -> usize {
        self.pos
    }

    pub fn get_len_remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) {
        assert!(pos <= self.buffer.len(), "seek beyond end of buffer");
        self.pos = pos;
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buffer.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Overwrites a previously written octet, used to patch element lengths
    pub fn patch_u8(&mut self, offset: usize, v: u8) {
        self.buffer[offset] = v;
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, FrameParseErr> {
        let [b] = self.read_array::<1>(field)?;
        Ok(b)
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, FrameParseErr> {
        Ok(u16::from_le_bytes(self.read_array(field)?))
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, FrameParseErr> {
        Ok(u32::from_le_bytes(self.read_array(field)?))
    }

    pub fn read_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], FrameParseErr> {
        let slice = self.read_slice(N, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_slice(&mut self, n: usize, field: &'static str) -> Result<&[u8], FrameParseErr> {
        if self.get_len_remaining() < n {
            return Err(FrameParseErr::BufferEnded { field: Some(field) });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buffer[start..start + n])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn dump_hex(&self) -> String {
        self.buffer.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameBuf {{ len: {}, pos: {}, data: {} }}", self.buffer.len(), self.pos, self.dump_hex())
    }
}

/// Extracts `width` bits starting at bit `offset` (LSB first)
#[inline]
pub fn get_bits(word: u64, offset: u32, width: u32) -> u64 {
    (word >> offset) & ((1u64 << width) - 1)
}

/// Places the low `width` bits of `v` at bit `offset` (LSB first)
#[inline]
pub fn set_bits(word: u64, offset: u32, width: u32, v: u64) -> u64 {
    let mask = ((1u64 << width) - 1) << offset;
    (word & !mask) | ((v << offset) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_le() {
        let mut buf = FrameBuf::new();
        buf.write_u8(0xab);
        buf.write_u16(0x1234);
        buf.write_u32(0xdeadbeef);
        assert_eq!(buf.dump_hex(), "ab3412efbeadde");

        let mut rd = FrameBuf::from_vec(buf.into_bytes());
        assert_eq!(rd.read_u8("a").unwrap(), 0xab);
        assert_eq!(rd.read_u16("b").unwrap(), 0x1234);
        assert_eq!(rd.read_u32("c").unwrap(), 0xdeadbeef);
        assert_eq!(rd.get_len_remaining(), 0);
        assert_eq!(rd.read_u8("d"), Err(FrameParseErr::BufferEnded { field: Some("d") }));
    }

    #[test]
    fn test_bitfields() {
        let w = set_bits(0, 4, 3, 0b101);
        assert_eq!(w, 0b101_0000);
        assert_eq!(get_bits(w, 4, 3), 0b101);
        // Overlong values are masked
        assert_eq!(set_bits(0, 0, 2, 0xff), 0b11);
    }

    #[test]
    #[should_panic]
    fn test_seek_out_of_range() {
        let mut buf = FrameBuf::from_bytes(&[1, 2]);
        buf.seek(3);
    }
}
