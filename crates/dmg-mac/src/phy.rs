//! PHY boundary of MacLow.

use crossbeam_channel::Sender;

use dmg_core::{MacAddr, SimDuration};

use crate::frame::{Mpdu, Psdu};
use crate::tx_params::TxVector;


/// What MacLow needs from a PHY: airtime arithmetic and a way to put a PSDU on air
pub trait DmgPhy: Send {
    fn calculate_tx_duration(&self, size: u32, tx_vector: &TxVector) -> SimDuration;

    /// aPPDUMaxTime for the modulation class of `tx_vector`
    fn ppdu_max_time(&self, tx_vector: &TxVector) -> SimDuration;

    fn send_packet(&mut self, psdu: Psdu, tx_vector: TxVector, duration: SimDuration);
}

/// A PSDU on air
#[derive(Debug, Clone)]
pub struct AirFrame {
    pub transmitter: MacAddr,
    pub psdu: Psdu,
    pub tx_vector: TxVector,
    pub duration: SimDuration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMpdu {
    pub mpdu: Mpdu,
    /// Outcome of the per-MPDU FCS check
    pub fcs_ok: bool,
}

/// A PSDU as it arrives at a receiver
#[derive(Debug, Clone)]
pub struct RxPsdu {
    pub mpdus: Vec<RxMpdu>,
    pub is_ampdu: bool,
    pub tx_vector: TxVector,
    pub snr_db: f64,
}

/// PHY that forwards every transmission to the medium over a channel.
/// The medium computes propagation, collisions and errors.
pub struct ChannelPhy {
    address: MacAddr,
    tx: Sender<AirFrame>,
}

impl ChannelPhy {
    pub fn new(address: MacAddr, tx: Sender<AirFrame>) -> Self {
        ChannelPhy { address, tx }
    }
}

impl DmgPhy for ChannelPhy {
    fn calculate_tx_duration(&self, size: u32, tx_vector: &TxVector) -> SimDuration {
        tx_vector.mcs.tx_duration(size)
    }

    fn ppdu_max_time(&self, tx_vector: &TxVector) -> SimDuration {
        tx_vector.mcs.modulation_class().ppdu_max_time()
    }

    fn send_packet(&mut self, psdu: Psdu, tx_vector: TxVector, duration: SimDuration) {
        tracing::trace!("phy {}: tx {} mpdus, {} octets, {}", self.address, psdu.mpdus.len(), psdu.size(), duration);
        let frame = AirFrame { transmitter: self.address, psdu, tx_vector, duration };
        if self.tx.send(frame).is_err() {
            tracing::error!("phy {}: medium gone, frame lost", self.address);
        }
    }
}
