//! Per-peer rate selection and retry bookkeeping.

use std::collections::HashMap;

use dmg_config::CfgMac;
use dmg_core::{DmgMcs, MacAddr};

use crate::tx_params::TxVector;


pub trait RemoteStationManager: Send {
    fn data_tx_vector(&self, address: MacAddr) -> TxVector;
    fn rts_tx_vector(&self, address: MacAddr) -> TxVector;
    /// Vector for control responses and DMG control frames
    fn dmg_control_tx_vector(&self, address: MacAddr) -> TxVector;
    fn need_rts(&self, address: MacAddr, size: u32) -> bool;

    fn report_rts_ok(&mut self, address: MacAddr);
    fn report_data_ok(&mut self, address: MacAddr);
    fn report_rts_failed(&mut self, address: MacAddr);
    fn report_data_failed(&mut self, address: MacAddr);
    fn report_final_rts_failed(&mut self, address: MacAddr);
    fn report_final_data_failed(&mut self, address: MacAddr);

    /// Short retry counter still below the limit
    fn need_rts_retransmission(&self, address: MacAddr) -> bool;
    /// Long retry counter still below the limit
    fn need_data_retransmission(&self, address: MacAddr) -> bool;

    fn is_associated(&self, address: MacAddr) -> bool;
    fn record_association(&mut self, address: MacAddr);
    fn record_disassociation(&mut self, address: MacAddr);
}


#[derive(Debug, Clone, Default)]
pub struct StationInfo {
    pub ssrc: u32,
    pub slrc: u32,
    pub associated: bool,
    pub final_rts_failures: u64,
    pub final_data_failures: u64,
}

/// Fixed data MCS for every peer, control PHY for control frames
pub struct ConstantRateManager {
    data_mcs: DmgMcs,
    rts_threshold: u32,
    max_ssrc: u32,
    max_slrc: u32,
    stations: HashMap<MacAddr, StationInfo>,
}

impl ConstantRateManager {
    pub fn new(data_mcs: DmgMcs, cfg: &CfgMac) -> Self {
        ConstantRateManager {
            data_mcs,
            rts_threshold: cfg.rts_cts_threshold,
            max_ssrc: cfg.max_ssrc,
            max_slrc: cfg.max_slrc,
            stations: HashMap::new(),
        }
    }

    pub fn station(&self, address: MacAddr) -> Option<&StationInfo> {
        self.stations.get(&address)
    }

    fn entry(&mut self, address: MacAddr) -> &mut StationInfo {
        self.stations.entry(address).or_default()
    }
}

impl RemoteStationManager for ConstantRateManager {
    fn data_tx_vector(&self, _address: MacAddr) -> TxVector {
        TxVector::new(self.data_mcs)
    }

    fn rts_tx_vector(&self, _address: MacAddr) -> TxVector {
        TxVector::control()
    }

    fn dmg_control_tx_vector(&self, _address: MacAddr) -> TxVector {
        TxVector::control()
    }

    fn need_rts(&self, address: MacAddr, size: u32) -> bool {
        !address.is_group() && size > self.rts_threshold
    }

    fn report_rts_ok(&mut self, address: MacAddr) {
        self.entry(address).ssrc = 0;
    }

    fn report_data_ok(&mut self, address: MacAddr) {
        self.entry(address).slrc = 0;
    }

    fn report_rts_failed(&mut self, address: MacAddr) {
        let st = self.entry(address);
        st.ssrc += 1;
        tracing::debug!("rts to {} failed, ssrc={}", address, st.ssrc);
    }

    fn report_data_failed(&mut self, address: MacAddr) {
        let st = self.entry(address);
        st.slrc += 1;
        tracing::debug!("data to {} failed, slrc={}", address, st.slrc);
    }

    fn report_final_rts_failed(&mut self, address: MacAddr) {
        let st = self.entry(address);
        st.ssrc = 0;
        st.final_rts_failures += 1;
        tracing::info!("rts to {} failed {} times, giving up", address, self.max_ssrc);
    }

    fn report_final_data_failed(&mut self, address: MacAddr) {
        let st = self.entry(address);
        st.slrc = 0;
        st.final_data_failures += 1;
        tracing::info!("data to {} failed {} times, giving up", address, self.max_slrc);
    }

    fn need_rts_retransmission(&self, address: MacAddr) -> bool {
        self.stations.get(&address).map_or(0, |s| s.ssrc) < self.max_ssrc
    }

    fn need_data_retransmission(&self, address: MacAddr) -> bool {
        self.stations.get(&address).map_or(0, |s| s.slrc) < self.max_slrc
    }

    fn is_associated(&self, address: MacAddr) -> bool {
        self.stations.get(&address).is_some_and(|s| s.associated)
    }

    fn record_association(&mut self, address: MacAddr) {
        self.entry(address).associated = true;
    }

    fn record_disassociation(&mut self, address: MacAddr) {
        self.entry(address).associated = false;
    }
}


#[cfg(test)]
mod tests {
    use dmg_core::debug;

    use super::*;

    #[test]
    fn test_retry_limits() {
        debug::setup_logging_verbose();
        let cfg = CfgMac { max_slrc: 3, rts_cts_threshold: 1000, ..Default::default() };
        let mut mgr = ConstantRateManager::new(DmgMcs::from_index(12).unwrap(), &cfg);
        let peer = MacAddr::from_index(1);

        assert!(mgr.need_rts(peer, 1001));
        assert!(!mgr.need_rts(peer, 1000));
        assert!(!mgr.need_rts(MacAddr::BROADCAST, 5000), "group frames are never protected");

        for _ in 0..2 {
            mgr.report_data_failed(peer);
            assert!(mgr.need_data_retransmission(peer));
        }
        mgr.report_data_failed(peer);
        assert!(!mgr.need_data_retransmission(peer), "limit of 3 reached");
        mgr.report_final_data_failed(peer);
        assert!(mgr.need_data_retransmission(peer), "counter resets after final failure");
        assert_eq!(mgr.station(peer).unwrap().final_data_failures, 1);
    }
}
