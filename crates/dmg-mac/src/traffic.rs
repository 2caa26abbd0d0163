//! Constant bit rate traffic source and the per-flow receive statistics.

use dmg_core::{MacAddr, PacketUid, SimDuration, SimTime, Tid};

use crate::frame::Msdu;


/// Sends fixed-size packets at a fixed rate once started
#[derive(Debug, Clone)]
pub struct CbrSource {
    node: u16,
    source: MacAddr,
    destination: MacAddr,
    tid: Tid,
    packet_size: u32,
    interval: SimDuration,
    started: Option<SimTime>,
    next_seq: u64,
    tx_bytes: u64,
}

impl CbrSource {
    pub fn new(node: u16, source: MacAddr, destination: MacAddr, packet_size: u32, rate_mbps: f64) -> Self {
        let interval_s = packet_size as f64 * 8.0 / (rate_mbps * 1e6);
        CbrSource {
            node,
            source,
            destination,
            tid: 0,
            packet_size,
            interval: SimDuration::from_secs_f64(interval_s).max(SimDuration::from_nanos(1)),
            started: None,
            next_seq: 0,
            tx_bytes: 0,
        }
    }

    pub fn node(&self) -> u16 {
        self.node
    }

    pub fn interval(&self) -> SimDuration {
        self.interval
    }

    pub fn start(&mut self, now: SimTime) -> bool {
        if self.started.is_some() {
            return false;
        }
        tracing::info!(ts = %now, "node {}: application started, one {}B packet every {}", self.node, self.packet_size, self.interval);
        self.started = Some(now);
        true
    }

    pub fn started_at(&self) -> Option<SimTime> {
        self.started
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn tx_packets(&self) -> u64 {
        self.next_seq
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    /// Next packet; the uid carries the node in its upper bits
    pub fn next_packet(&mut self, now: SimTime) -> Msdu {
        let uid: PacketUid = ((self.node as u64) << 40) | self.next_seq;
        self.next_seq += 1;
        self.tx_bytes += self.packet_size as u64;
        Msdu {
            uid,
            size: self.packet_size,
            source: self.source,
            destination: self.destination,
            tid: self.tid,
            created: now,
            enqueued: now,
        }
    }
}


/// Receive side of one flow
#[derive(Debug, Clone, Default)]
pub struct FlowStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    delay_sum: SimDuration,
    jitter_sum: SimDuration,
    last_delay: Option<SimDuration>,
}

impl FlowStats {
    pub fn record(&mut self, created: SimTime, now: SimTime, size: u32) {
        let delay = now.since(created);
        if let Some(last) = self.last_delay {
            self.jitter_sum += if delay > last { delay - last } else { last - delay };
        }
        self.last_delay = Some(delay);
        self.delay_sum += delay;
        self.rx_packets += 1;
        self.rx_bytes += size as u64;
    }

    pub fn avg_delay_s(&self) -> f64 {
        if self.rx_packets == 0 {
            return 0.0;
        }
        self.delay_sum.as_secs_f64() / self.rx_packets as f64
    }

    /// Mean delay variation between consecutive packets
    pub fn avg_jitter_s(&self) -> f64 {
        if self.rx_packets < 2 {
            return 0.0;
        }
        self.jitter_sum.as_secs_f64() / (self.rx_packets - 1) as f64
    }

    pub fn throughput_mbps(&self, active: SimDuration) -> f64 {
        if active.is_zero() {
            return 0.0;
        }
        self.rx_bytes as f64 * 8.0 / active.as_secs_f64() / 1e6
    }
}
