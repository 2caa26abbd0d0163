//! Shared wireless medium: one collision domain where every node hears every
//! other node.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dmg_core::{MacAddr, SimDuration, SimTime};

use crate::phy::{AirFrame, RxMpdu, RxPsdu};

/// Transmissions stay in the history this long after they ended, so late
/// receptions can still be resolved
const HISTORY: SimDuration = SimDuration::from_millis(5);

/// SNR reported for frames that survive the error model
const NOMINAL_SNR_DB: f64 = 20.0;


/// Physical carrier sense, shared by all nodes of the medium
#[derive(Debug, Clone, Default)]
pub struct CarrierSense {
    busy_until_ns: Arc<AtomicU64>,
}

impl CarrierSense {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, now: SimTime) -> bool {
        now < self.busy_until()
    }

    pub fn busy_until(&self) -> SimTime {
        SimTime::from_nanos(self.busy_until_ns.load(Ordering::Relaxed))
    }

    pub fn extend(&self, until: SimTime) {
        self.busy_until_ns.fetch_max(until.as_nanos(), Ordering::Relaxed);
    }
}


#[derive(Debug, Clone)]
struct Transmission {
    id: u64,
    transmitter: MacAddr,
    start: SimTime,
    end: SimTime,
    collided: bool,
}

impl Transmission {
    fn overlaps(&self, start: SimTime, end: SimTime) -> bool {
        self.start < end && start < self.end
    }
}

/// Overlapping transmissions destroy each other; a node never receives while
/// it transmits; surviving MPDUs fail their FCS with a fixed probability.
pub struct Medium {
    carrier: CarrierSense,
    ongoing: Vec<Transmission>,
    next_id: u64,
    mpdu_error_rate: f64,
    rng: StdRng,
    collisions: u64,
}

impl Medium {
    pub fn new(carrier: CarrierSense, mpdu_error_rate: f64, seed: u64) -> Self {
        Medium {
            carrier,
            ongoing: Vec::new(),
            next_id: 1,
            mpdu_error_rate,
            rng: StdRng::seed_from_u64(seed),
            collisions: 0,
        }
    }

    pub fn carrier(&self) -> CarrierSense {
        self.carrier.clone()
    }

    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// Registers a frame going on air at `now` and returns its id
    pub fn start_transmission(&mut self, now: SimTime, frame: &AirFrame) -> u64 {
        self.ongoing.retain(|t| t.end + HISTORY > now);
        let end = now + frame.duration;

        let mut collided = false;
        for other in self.ongoing.iter_mut().filter(|t| t.overlaps(now, end)) {
            if !other.collided {
                tracing::debug!(ts = %now, "collision: {} and {}", other.transmitter, frame.transmitter);
                self.collisions += 1;
            }
            other.collided = true;
            collided = true;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.ongoing.push(Transmission { id, transmitter: frame.transmitter, start: now, end, collided });
        self.carrier.extend(end);
        id
    }

    /// What `receiver` decodes from transmission `id`, evaluated when the frame ends
    pub fn receive(&mut self, id: u64, receiver: MacAddr, frame: &AirFrame) -> Option<RxPsdu> {
        let tx = self.ongoing.iter().find(|t| t.id == id)?;
        if tx.collided {
            tracing::trace!("{} lost frame from {} to a collision", receiver, frame.transmitter);
            return None;
        }
        let (start, end) = (tx.start, tx.end);
        if self.ongoing.iter().any(|t| t.id != id && t.transmitter == receiver && t.overlaps(start, end)) {
            tracing::trace!("{} was transmitting, missed frame from {}", receiver, frame.transmitter);
            return None;
        }

        let error_rate = self.mpdu_error_rate;
        let mpdus = frame
            .psdu
            .mpdus
            .iter()
            .map(|mpdu| RxMpdu { mpdu: mpdu.clone(), fcs_ok: error_rate <= 0.0 || self.rng.random::<f64>() >= error_rate })
            .collect();
        Some(RxPsdu { mpdus, is_ampdu: frame.psdu.is_ampdu, tx_vector: frame.tx_vector, snr_db: NOMINAL_SNR_DB })
    }
}


#[cfg(test)]
mod tests {
    use dmg_core::debug;

    use super::*;
    use crate::frame::{FrameType, Mpdu, Psdu};
    use crate::tx_params::TxVector;

    fn frame(from: u16, us: u64) -> AirFrame {
        let mpdu = Mpdu::control(FrameType::Rts, MacAddr::from_index(9), MacAddr::from_index(from), 0);
        AirFrame {
            transmitter: MacAddr::from_index(from),
            psdu: Psdu::single(mpdu),
            tx_vector: TxVector::control(),
            duration: SimDuration::from_micros(us),
        }
    }

    #[test]
    fn test_overlapping_frames_collide() {
        debug::setup_logging_verbose();
        let carrier = CarrierSense::new();
        let mut medium = Medium::new(carrier.clone(), 0.0, 1);
        let t0 = SimTime::ZERO;
        let a = frame(1, 10);
        let b = frame(2, 10);
        let id_a = medium.start_transmission(t0, &a);
        assert!(carrier.is_busy(t0 + SimDuration::from_micros(9)));
        let id_b = medium.start_transmission(t0 + SimDuration::from_micros(5), &b);

        assert!(medium.receive(id_a, MacAddr::from_index(0), &a).is_none());
        assert!(medium.receive(id_b, MacAddr::from_index(0), &b).is_none());
        assert_eq!(medium.collisions(), 1);
        assert_eq!(carrier.busy_until(), t0 + SimDuration::from_micros(15));

        let c = frame(1, 10);
        let id_c = medium.start_transmission(t0 + SimDuration::from_micros(20), &c);
        let rx = medium.receive(id_c, MacAddr::from_index(0), &c).expect("clean frame");
        assert!(rx.mpdus.iter().all(|m| m.fcs_ok));
    }

    #[test]
    fn test_error_rate_corrupts_mpdus() {
        debug::setup_logging_verbose();
        let mut medium = Medium::new(CarrierSense::new(), 0.5, 7);
        let mut failed = 0;
        for i in 0..200u64 {
            let f = frame(1, 1);
            let id = medium.start_transmission(SimTime::ZERO + SimDuration::from_micros(i * 10), &f);
            let rx = medium.receive(id, MacAddr::from_index(0), &f).unwrap();
            failed += rx.mpdus.iter().filter(|m| !m.fcs_ok).count();
        }
        assert!((50..150).contains(&failed), "about half the frames fail, got {}", failed);
    }
}
