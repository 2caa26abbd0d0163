//! Block Ack agreements and the recipient-side reorder buffer.

use std::collections::HashMap;

use dmg_core::{MAX_BA_WIN_SIZE, MacAddr, SEQ_MODULO, SimDuration, SimTime, Tid, seq_add, seq_distance, seq_in_window, seq_is_old};

use crate::frame::Mpdu;


/// One direction of a Block Ack session for a (peer, TID) pair
#[derive(Debug, Clone)]
pub struct BlockAckAgreement {
    pub peer: MacAddr,
    pub tid: Tid,
    pub buffer_size: u16,
    pub starting_seq: u16,
    /// Inactivity timeout, zero disables it
    pub timeout: SimDuration,
    last_activity: SimTime,
}

impl BlockAckAgreement {
    /// `timeout_units` counts 1024 us blocks as in the ADDBA frames
    pub fn new(peer: MacAddr, tid: Tid, buffer_size: u16, timeout_units: u16, starting_seq: u16, now: SimTime) -> Self {
        BlockAckAgreement {
            peer,
            tid,
            buffer_size: buffer_size.clamp(1, MAX_BA_WIN_SIZE),
            starting_seq,
            timeout: SimDuration::from_micros(timeout_units as u64 * 1024),
            last_activity: now,
        }
    }

    pub fn touch(&mut self, now: SimTime) {
        self.last_activity = now;
    }

    pub fn is_expired(&self, now: SimTime) -> bool {
        !self.timeout.is_zero() && now.since(self.last_activity) > self.timeout
    }
}


/// Sliding-window reorder buffer. Sequence numbers compare modulo 4096; the
/// window is at most 64 wide. MPDUs leave the buffer in sequence order, up to
/// the first one still missing.
#[derive(Debug)]
pub struct ReorderBuffer {
    win_start: u16,
    win_size: u16,
    buffered: HashMap<u16, Mpdu>,
    total_received: u64,
}

impl ReorderBuffer {
    pub fn new(starting_seq: u16, win_size: u16) -> Self {
        ReorderBuffer {
            win_start: starting_seq,
            win_size: win_size.clamp(1, MAX_BA_WIN_SIZE),
            buffered: HashMap::new(),
            total_received: 0,
        }
    }

    pub fn win_start(&self) -> u16 {
        self.win_start
    }

    /// MPDUs accepted into the buffer so far, duplicates not counted
    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Accepts one MPDU and returns whatever became deliverable, in order
    pub fn receive(&mut self, mpdu: Mpdu) -> Vec<Mpdu> {
        let seq = mpdu.header.seq;
        if seq_is_old(self.win_start, seq) {
            tracing::trace!("seq {} behind window start {}, duplicate", seq, self.win_start);
            return Vec::new();
        }

        let mut delivered = Vec::new();
        if !seq_in_window(self.win_start, seq, self.win_size) {
            // Ahead of the window: slide it so `seq` becomes the last slot
            let new_start = seq_add(seq, SEQ_MODULO - self.win_size + 1);
            delivered.extend(self.flush_before(new_start));
        }

        if self.buffered.contains_key(&seq) {
            tracing::trace!("seq {} already buffered, duplicate", seq);
        } else {
            self.buffered.insert(seq, mpdu);
            self.total_received += 1;
        }

        delivered.extend(self.rx_complete_buffered_packets_until_first_lost());
        delivered
    }

    /// Releases the consecutive run starting at the window start
    pub fn rx_complete_buffered_packets_until_first_lost(&mut self) -> Vec<Mpdu> {
        let mut delivered = Vec::new();
        while let Some(mpdu) = self.buffered.remove(&self.win_start) {
            delivered.push(mpdu);
            self.win_start = seq_add(self.win_start, 1);
        }
        delivered
    }

    /// Block Ack Request handling: everything before `new_start` is released,
    /// gaps included, and the window moves there.
    pub fn flush_before(&mut self, new_start: u16) -> Vec<Mpdu> {
        if seq_is_old(self.win_start, new_start) {
            return Vec::new();
        }
        let mut released: Vec<Mpdu> = Vec::new();
        let mut keys: Vec<u16> = self
            .buffered
            .keys()
            .copied()
            .filter(|s| seq_distance(self.win_start, *s) < seq_distance(self.win_start, new_start))
            .collect();
        keys.sort_by_key(|s| seq_distance(self.win_start, *s));
        for key in keys {
            if let Some(mpdu) = self.buffered.remove(&key) {
                released.push(mpdu);
            }
        }
        self.win_start = new_start;
        released.extend(self.rx_complete_buffered_packets_until_first_lost());
        released
    }

    /// Compressed Block Ack bitmap relative to `starting_seq`
    pub fn bitmap(&self, starting_seq: u16) -> u64 {
        self.buffered
            .keys()
            .map(|s| seq_distance(starting_seq, *s))
            .filter(|d| *d < 64)
            .fold(0u64, |acc, d| acc | (1u64 << d))
    }
}


#[cfg(test)]
mod tests {
    use dmg_core::debug;

    use super::*;
    use crate::frame::{FrameBody, WifiMacHeader};

    fn mpdu(seq: u16) -> Mpdu {
        let mut hdr = WifiMacHeader::qos_data(MacAddr::from_index(0), MacAddr::from_index(1), 0);
        hdr.seq = seq;
        Mpdu::new(hdr, FrameBody::Empty)
    }

    fn seqs(mpdus: &[Mpdu]) -> Vec<u16> {
        mpdus.iter().map(|m| m.header.seq).collect()
    }

    #[test]
    fn test_in_order_delivery_after_gap_fills() {
        debug::setup_logging_verbose();
        let mut rb = ReorderBuffer::new(0, 64);
        assert!(rb.receive(mpdu(1)).is_empty(), "seq 0 still missing");
        assert!(rb.receive(mpdu(2)).is_empty());
        assert_eq!(seqs(&rb.receive(mpdu(0))), vec![0, 1, 2]);
        assert_eq!(rb.win_start(), 3);
    }

    #[test]
    fn test_window_slides_for_far_ahead_seq() {
        debug::setup_logging_verbose();
        let mut rb = ReorderBuffer::new(4090, 8);
        assert!(rb.receive(mpdu(4091)).is_empty());
        // 4090 + 8 = 4098 is outside, window moves to start at 4091
        let out = rb.receive(mpdu(2));
        assert_eq!(seqs(&out), vec![4091]);
        assert_eq!(rb.win_start(), 4092);
        assert_eq!(rb.bitmap(4092), 1 << seq_distance(4092, 2));
    }

    #[test]
    fn test_flush_before_releases_gaps() {
        debug::setup_logging_verbose();
        let mut rb = ReorderBuffer::new(10, 64);
        rb.receive(mpdu(12));
        rb.receive(mpdu(14));
        assert_eq!(seqs(&rb.flush_before(13)), vec![12]);
        assert_eq!(rb.win_start(), 13);
        assert_eq!(seqs(&rb.flush_before(15)), vec![14]);
        assert!(rb.flush_before(3).is_empty(), "backwards request ignored");
        assert_eq!(rb.win_start(), 15);
    }

    #[test]
    fn test_agreement_inactivity() {
        debug::setup_logging_verbose();
        let peer = MacAddr::from_index(1);
        let mut ba = BlockAckAgreement::new(peer, 0, 64, 10, 0, SimTime::ZERO);
        assert!(!ba.is_expired(SimTime::ZERO + SimDuration::from_micros(10_240)));
        assert!(ba.is_expired(SimTime::ZERO + SimDuration::from_micros(10_241)));
        ba.touch(SimTime::ZERO + SimDuration::from_micros(10_000));
        assert!(!ba.is_expired(SimTime::ZERO + SimDuration::from_micros(20_000)));

        let never = BlockAckAgreement::new(peer, 0, 64, 0, 0, SimTime::ZERO);
        assert!(!never.is_expired(SimTime::from_nanos(u64::MAX / 2)));
    }
}
