use serde::Deserialize;
use std::sync::{Arc, RwLock};

use dmg_core::DmgMcs;


/// Admission policy run by the AP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SchedulerType {
    /// Whole DTI is one broadcast CBAP, every ADDTS is rejected
    #[serde(alias = "CbapOnlyDmgWifiScheduler")]
    CbapOnly,
    /// Fixed-duration SPs packed from the DTI start
    #[serde(alias = "BasicDmgWifiScheduler")]
    Basic,
    /// Periodic SPs placed into free slots
    #[serde(alias = "PeriodicDmgWifiScheduler")]
    Periodic,
}

impl SchedulerType {
    /// Numeric selector used on the command line: 0 is CBAP only, 1 is Basic,
    /// anything higher selects Periodic with that allocation period.
    pub fn from_index(idx: u8) -> (SchedulerType, u8) {
        match idx {
            0 => (SchedulerType::CbapOnly, 0),
            1 => (SchedulerType::Basic, 0),
            n => (SchedulerType::Periodic, n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfgScheduler {
    pub scheduler_type: SchedulerType,
    /// Minimum broadcast CBAP time per DTI, in microseconds
    pub min_broadcast_cbap_duration: u32,
    /// Gap between consecutive SPs, in microseconds, range [10, 65535]
    pub inter_allocation_distance: u32,
}

impl Default for CfgScheduler {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::CbapOnly,
            min_broadcast_cbap_duration: default_min_broadcast_cbap_duration(),
            inter_allocation_distance: default_inter_allocation_distance(),
        }
    }
}

#[inline]
fn default_min_broadcast_cbap_duration() -> u32 {
    4096
}

#[inline]
fn default_inter_allocation_distance() -> u32 {
    10
}

#[derive(Debug, Clone)]
pub struct CfgPhy {
    /// Data MCS used for all unicast data frames
    pub mcs: DmgMcs,
    /// Probability that an MPDU fails its FCS check at a receiver
    pub mpdu_error_rate: f64,
}

impl Default for CfgPhy {
    fn default() -> Self {
        Self {
            mcs: DmgMcs::from_index(12).unwrap_or(DmgMcs::CONTROL),
            mpdu_error_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfgMac {
    /// 0 disables A-MSDU aggregation
    pub max_amsdu_size: u32,
    /// 0 disables A-MPDU aggregation
    pub max_ampdu_size: u32,
    /// MPDUs larger than this are protected by RTS/CTS
    pub rts_cts_threshold: u32,
    pub max_ssrc: u32,
    pub max_slrc: u32,
    /// Time an MSDU may wait in a MAC queue before it is discarded
    pub msdu_lifetime_us: u64,
    /// Block Ack inactivity timeout in units of 1024 us, 0 disables it
    pub block_ack_timeout: u16,
    /// Reorder buffer size requested in ADDBA
    pub block_ack_buffer_size: u16,
}

impl Default for CfgMac {
    fn default() -> Self {
        Self {
            max_amsdu_size: 7935,
            max_ampdu_size: 262_143,
            rts_cts_threshold: 65_535,
            max_ssrc: 7,
            max_slrc: 7,
            msdu_lifetime_us: 500_000,
            block_ack_timeout: 0,
            block_ack_buffer_size: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfgScenario {
    pub beacon_interval_us: u32,
    pub bhi_duration_us: u32,
    pub ati_duration_us: u32,
    pub simulation_time_s: f64,
    /// Offered load per station
    pub app_data_rate_mbps: f64,
    pub packet_size: u32,
    pub num_stations: u16,
    /// Number of SPs per beacon interval requested by each station, 0 for one aperiodic SP
    pub allocation_period: u8,
    /// Safety factor applied when sizing an SP for the offered load
    pub sp_duration_margin: f64,
    pub seed: u64,
    /// Directory receiving results.csv and spTrace.csv
    pub output_dir: String,
}

impl Default for CfgScenario {
    fn default() -> Self {
        Self {
            beacon_interval_us: 102_400,
            bhi_duration_us: 3_000,
            ati_duration_us: 0,
            simulation_time_s: 1.0,
            app_data_rate_mbps: 300.0,
            packet_size: 1448,
            num_stations: 1,
            allocation_period: 0,
            sp_duration_margin: 1.01,
            seed: 1,
            output_dir: ".".to_string(),
        }
    }
}

impl CfgScenario {
    pub fn dti_duration_us(&self) -> u32 {
        self.beacon_interval_us.saturating_sub(self.bhi_duration_us)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    pub debug_log: Option<String>,
    pub scheduler: CfgScheduler,
    pub phy: CfgPhy,
    pub mac: CfgMac,
    pub scenario: CfgScenario,
}

impl SimConfig {
    /// Validate that all configuration fields are within the ranges the wire
    /// format and the schedulers can represent.
    pub fn validate(&self) -> Result<(), &str> {
        let sched = &self.scheduler;
        if !(10..=65535).contains(&sched.inter_allocation_distance) {
            return Err("scheduler.inter_allocation_distance must be within [10, 65535]");
        }

        if !(0.0..1.0).contains(&self.phy.mpdu_error_rate) {
            return Err("phy.mpdu_error_rate must be within [0, 1)");
        }

        let mac = &self.mac;
        if mac.max_amsdu_size > 7935 {
            return Err("mac.max_amsdu_size exceeds 7935 octets");
        }
        if mac.max_ampdu_size > 262_143 {
            return Err("mac.max_ampdu_size exceeds 262143 octets");
        }
        if mac.max_ssrc == 0 || mac.max_slrc == 0 {
            return Err("mac retry limits must be at least 1");
        }
        if mac.block_ack_buffer_size == 0 || mac.block_ack_buffer_size > 64 {
            return Err("mac.block_ack_buffer_size must be within [1, 64]");
        }

        let sc = &self.scenario;
        if sc.bhi_duration_us >= sc.beacon_interval_us {
            return Err("scenario.bhi_duration_us must be shorter than the beacon interval");
        }
        if sc.ati_duration_us >= sc.bhi_duration_us {
            return Err("scenario.ati_duration_us must be shorter than the BHI");
        }
        if sched.min_broadcast_cbap_duration > sc.dti_duration_us() {
            return Err("scheduler.min_broadcast_cbap_duration exceeds the DTI");
        }
        if sc.packet_size == 0 {
            return Err("scenario.packet_size must be non-zero");
        }
        if sc.num_stations == 0 || sc.num_stations > 254 {
            return Err("scenario.num_stations must be within [1, 254]");
        }
        if sc.simulation_time_s <= 0.0 {
            return Err("scenario.simulation_time_s must be positive");
        }
        if sc.sp_duration_margin < 1.0 {
            return Err("scenario.sp_duration_margin must be at least 1.0");
        }

        Ok(())
    }
}

/// Mutable run counters, written by the MAC entities and read by the reporting side
#[derive(Debug, Clone, Default)]
pub struct SimState {
    pub tx_mpdus: u64,
    pub tx_failed_mpdus: u64,
    pub dropped_msdus: u64,
    pub rx_msdus: u64,
    pub rx_bytes: u64,
    pub addts_accepted: u32,
    pub addts_rejected: u32,
    pub suspended_transmissions: u32,
    pub resumed_transmissions: u32,
}

/// Global shared configuration: immutable config + mutable state.
#[derive(Clone)]
pub struct SharedConfig {
    /// Read-only configuration (immutable after construction).
    cfg: Arc<SimConfig>,
    /// Mutable state guarded with RwLock
    state: Arc<RwLock<SimState>>,
}

impl SharedConfig {
    pub fn from_config(cfg: SimConfig) -> Self {
        Self::from_parts(cfg, SimState::default())
    }

    /// Panics on an invalid configuration, use `try_from_parts` where the
    /// configuration comes from the user.
    pub fn from_parts(cfg: SimConfig, state: SimState) -> Self {
        match Self::try_from_parts(cfg, state) {
            Ok(shared) => shared,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn try_from_config(cfg: SimConfig) -> Result<Self, String> {
        Self::try_from_parts(cfg, SimState::default())
    }

    pub fn try_from_parts(cfg: SimConfig, state: SimState) -> Result<Self, String> {
        if let Err(e) = cfg.validate() {
            return Err(format!("Invalid simulation configuration: {}", e));
        }
        Ok(Self {
            cfg: Arc::new(cfg),
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Access immutable config.
    pub fn config(&self) -> Arc<SimConfig> {
        Arc::clone(&self.cfg)
    }

    /// Read guard for mutable state.
    pub fn state_read(&self) -> std::sync::RwLockReadGuard<'_, SimState> {
        self.state.read().expect("SimState RwLock blocked")
    }

    /// Write guard for mutable state.
    pub fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, SimState> {
        self.state.write().expect("SimState RwLock blocked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = SimConfig::default();
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.scenario.dti_duration_us(), 102_400 - 3_000);
        assert_eq!(cfg.phy.mcs.to_string(), "DMG_MCS12");
    }

    #[test]
    fn test_inter_allocation_distance_range() {
        let mut cfg = SimConfig::default();
        cfg.scheduler.inter_allocation_distance = 9;
        assert!(cfg.validate().is_err());
        cfg.scheduler.inter_allocation_distance = 65535;
        assert!(cfg.validate().is_ok());
        cfg.scheduler.inter_allocation_distance = 65536;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_scheduler_index() {
        assert_eq!(SchedulerType::from_index(0), (SchedulerType::CbapOnly, 0));
        assert_eq!(SchedulerType::from_index(1), (SchedulerType::Basic, 0));
        assert_eq!(SchedulerType::from_index(4), (SchedulerType::Periodic, 4));
    }

    #[test]
    #[should_panic]
    fn test_shared_config_rejects_invalid() {
        let mut cfg = SimConfig::default();
        cfg.scenario.packet_size = 0;
        let _ = SharedConfig::from_config(cfg);
    }

    #[test]
    fn test_try_from_config_reports_invalid() {
        let mut cfg = SimConfig::default();
        cfg.scenario.packet_size = 0;
        let err = SharedConfig::try_from_config(cfg).err().unwrap();
        assert!(err.starts_with("Invalid simulation configuration"), "{}", err);

        assert!(SharedConfig::try_from_config(SimConfig::default()).is_ok());
    }
}
