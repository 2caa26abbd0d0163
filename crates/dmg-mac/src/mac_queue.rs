//! Transmit queues: MSDUs waiting for the MAC, and the MPDU view built on top of them.

use std::collections::{HashMap, VecDeque};

use dmg_core::{MacAddr, SEQ_MODULO, SimDuration, SimTime, Tid};

use crate::aggregation::MsduAggregator;
use crate::frame::{FrameBody, Mpdu, Msdu, WifiMacHeader};


/// FIFO of MSDUs with a per-item lifetime
pub struct MacQueue {
    items: VecDeque<Msdu>,
    lifetime: SimDuration,
    max_size: usize,
}

impl MacQueue {
    pub fn new(lifetime: SimDuration, max_size: usize) -> Self {
        MacQueue { items: VecDeque::new(), lifetime, max_size }
    }

    pub fn lifetime(&self) -> SimDuration {
        self.lifetime
    }

    /// Stamps the MSDU with its enqueue time. Returns false and drops the MSDU
    /// when the queue is full.
    pub fn enqueue(&mut self, now: SimTime, mut msdu: Msdu) -> bool {
        if self.items.len() >= self.max_size {
            tracing::debug!("queue full ({}), dropping msdu {}", self.max_size, msdu.uid);
            return false;
        }
        msdu.enqueued = now;
        self.items.push_back(msdu);
        true
    }

    /// Drops every MSDU that outlived its lifetime, returns how many went
    pub fn remove_expired(&mut self, now: SimTime) -> usize {
        let before = self.items.len();
        let lifetime = self.lifetime;
        self.items.retain(|m| !m.is_expired(now, lifetime));
        let dropped = before - self.items.len();
        if dropped > 0 {
            tracing::debug!(ts = %now, "{} msdus expired in queue", dropped);
        }
        dropped
    }

    pub fn peek(&self) -> Option<&Msdu> {
        self.items.front()
    }

    pub fn peek_by_receiver_tid(&self, receiver: MacAddr, tid: Tid) -> Option<&Msdu> {
        self.items.iter().find(|m| m.destination == receiver && m.tid == tid)
    }

    pub fn peek_by_receiver(&self, receiver: MacAddr) -> Option<&Msdu> {
        self.items.iter().find(|m| m.destination == receiver)
    }

    pub fn dequeue_by_receiver_tid(&mut self, receiver: MacAddr, tid: Tid) -> Option<Msdu> {
        let idx = self.items.iter().position(|m| m.destination == receiver && m.tid == tid)?;
        self.items.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}


/// Everything one transmitter has waiting: management frames, MPDUs that
/// already carry a sequence number (retransmissions, frames handed back
/// unsent) and fresh MSDUs that become MPDUs on dequeue.
pub struct TxQueue {
    address: MacAddr,
    management: VecDeque<Mpdu>,
    pending: VecDeque<Mpdu>,
    msdus: MacQueue,
    next_seq: HashMap<(MacAddr, Tid), u16>,
    msdu_aggregator: MsduAggregator,
}

impl TxQueue {
    pub fn new(address: MacAddr, msdus: MacQueue, msdu_aggregator: MsduAggregator) -> Self {
        TxQueue {
            address,
            management: VecDeque::new(),
            pending: VecDeque::new(),
            msdus,
            next_seq: HashMap::new(),
            msdu_aggregator,
        }
    }

    pub fn lifetime(&self) -> SimDuration {
        self.msdus.lifetime()
    }

    pub fn enqueue_msdu(&mut self, now: SimTime, msdu: Msdu) -> bool {
        self.msdus.enqueue(now, msdu)
    }

    /// Management frames bypass the data queue and get their sequence number here
    pub fn enqueue_management(&mut self, mut mpdu: Mpdu) {
        let key = (mpdu.header.receiver, Tid::MAX);
        mpdu.header.seq = self.assign_seq(key);
        self.management.push_back(mpdu);
    }

    pub fn has_frames(&self) -> bool {
        !self.management.is_empty() || !self.pending.is_empty() || !self.msdus.is_empty()
    }

    /// Receiver and TID of the frame `dequeue_first` would return
    pub fn peek_receiver(&self) -> Option<(MacAddr, Tid)> {
        self.management
            .front()
            .or_else(|| self.pending.front())
            .map(|m| (m.header.receiver, m.header.tid))
            .or_else(|| self.msdus.peek().map(|m| (m.destination, m.tid)))
    }

    /// Purges expired MSDUs and expired numbered MPDUs. Returns the MSDU count dropped.
    pub fn remove_expired(&mut self, now: SimTime) -> usize {
        let lifetime = self.msdus.lifetime();
        let mut dropped = 0;
        self.pending.retain(|m| {
            let expired = m.is_expired(now, lifetime);
            if expired {
                dropped += m.msdus().len();
            }
            !expired
        });
        dropped + self.msdus.remove_expired(now)
    }

    /// Head-of-line frame, management first
    pub fn dequeue_first(&mut self, now: SimTime) -> Option<Mpdu> {
        if let Some(mpdu) = self.management.pop_front() {
            return Some(mpdu);
        }
        if let Some(mpdu) = self.pending.pop_front() {
            return Some(mpdu);
        }
        let (receiver, tid) = self.msdus.peek().map(|m| (m.destination, m.tid))?;
        self.build_mpdu(now, receiver, tid)
    }

    /// Next data MPDU for one flow, used while growing an A-MPDU
    pub fn dequeue_for(&mut self, now: SimTime, receiver: MacAddr, tid: Tid) -> Option<Mpdu> {
        let idx = self
            .pending
            .iter()
            .position(|m| m.header.is_qos_data() && m.header.receiver == receiver && m.header.tid == tid);
        if let Some(idx) = idx {
            return self.pending.remove(idx);
        }
        self.build_mpdu(now, receiver, tid)
    }

    /// Head-of-line frame among those addressed to `receiver`, used inside a
    /// service period where only one peer may be served
    pub fn dequeue_for_receiver(&mut self, now: SimTime, receiver: MacAddr) -> Option<Mpdu> {
        if let Some(idx) = self.management.iter().position(|m| m.header.receiver == receiver) {
            return self.management.remove(idx);
        }
        if let Some(idx) = self.pending.iter().position(|m| m.header.receiver == receiver) {
            return self.pending.remove(idx);
        }
        let tid = self.msdus.peek_by_receiver(receiver).map(|m| m.tid)?;
        self.build_mpdu(now, receiver, tid)
    }

    pub fn has_frames_for(&self, receiver: MacAddr) -> bool {
        self.management.iter().chain(self.pending.iter()).any(|m| m.header.receiver == receiver)
            || self.msdus.peek_by_receiver(receiver).is_some()
    }

    /// Hands back an MPDU that was dequeued but not sent, ahead of everything else
    pub fn push_front(&mut self, mpdu: Mpdu) {
        if mpdu.header.is_qos_data() {
            self.pending.push_front(mpdu);
        } else if !mpdu.header.frame_type.is_control() {
            self.management.push_front(mpdu);
        } else {
            tracing::warn!("dropping control frame {} handed back to the queue", mpdu);
        }
    }

    /// Queues MPDUs for retransmission, keeping their relative order
    pub fn requeue(&mut self, mpdus: Vec<Mpdu>) {
        for mut mpdu in mpdus.into_iter().rev() {
            mpdu.header.retry = true;
            self.push_front(mpdu);
        }
    }

    /// Sequence number the next fresh MPDU of this flow will get
    pub fn next_sequence(&self, receiver: MacAddr, tid: Tid) -> u16 {
        self.next_seq.get(&(receiver, tid)).copied().unwrap_or(0)
    }

    /// Oldest sequence number of this flow still waiting for (re)transmission
    pub fn oldest_outstanding(&self, receiver: MacAddr, tid: Tid) -> u16 {
        self.pending
            .iter()
            .find(|m| m.header.is_qos_data() && m.header.receiver == receiver && m.header.tid == tid)
            .map(|m| m.header.seq)
            .unwrap_or_else(|| self.next_sequence(receiver, tid))
    }

    pub fn msdu_count(&self) -> usize {
        self.msdus.len() + self.pending.iter().map(|m| m.msdus().len()).sum::<usize>()
    }

    fn build_mpdu(&mut self, now: SimTime, receiver: MacAddr, tid: Tid) -> Option<Mpdu> {
        self.msdus.remove_expired(now);
        let first = self.msdus.dequeue_by_receiver_tid(receiver, tid)?;

        let mut header = WifiMacHeader::qos_data(receiver, self.address, tid);
        header.seq = self.assign_seq((receiver, tid));

        let mut msdus = vec![first];
        if self.msdu_aggregator.is_enabled() {
            while let Some(next) = self.msdus.peek_by_receiver_tid(receiver, tid) {
                if !self.msdu_aggregator.can_add(MsduAggregator::amsdu_size(&msdus), next.size) {
                    break;
                }
                if let Some(next) = self.msdus.dequeue_by_receiver_tid(receiver, tid) {
                    msdus.push(next);
                }
            }
        }

        let body = if msdus.len() > 1 {
            header.amsdu_present = true;
            FrameBody::Amsdu(msdus)
        } else {
            FrameBody::Msdu(msdus.remove(0))
        };
        Some(Mpdu::new(header, body))
    }

    fn assign_seq(&mut self, key: (MacAddr, Tid)) -> u16 {
        let next = self.next_seq.entry(key).or_insert(0);
        let seq = *next;
        *next = (seq + 1) % SEQ_MODULO;
        seq
    }
}
