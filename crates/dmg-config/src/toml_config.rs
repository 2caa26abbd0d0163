use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use toml::Value;

use dmg_core::DmgMcs;

use super::sim_config::{CfgMac, CfgPhy, CfgScenario, CfgScheduler, SchedulerType, SharedConfig, SimConfig, SimState};

/// Build `SharedConfig` from a TOML configuration file
pub fn from_toml_str(toml_str: &str) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let root: TomlConfigRoot = toml::from_str(toml_str)?;

    let expected_config_version = "0.1";
    if !root.config_version.eq(expected_config_version) {
        return Err(format!(
            "Unrecognized config_version: {}, expect {}",
            root.config_version, expected_config_version
        )
        .into());
    }
    if !root.extra.is_empty() {
        return Err(format!("Unrecognized top-level fields: {:?}", sorted_keys(&root.extra)).into());
    }
    if let Some(ref s) = root.scheduler {
        if !s.extra.is_empty() {
            return Err(format!("Unrecognized fields in scheduler: {:?}", sorted_keys(&s.extra)).into());
        }
    }
    if let Some(ref p) = root.phy {
        if !p.extra.is_empty() {
            return Err(format!("Unrecognized fields in phy: {:?}", sorted_keys(&p.extra)).into());
        }
    }
    if let Some(ref m) = root.mac {
        if !m.extra.is_empty() {
            return Err(format!("Unrecognized fields in mac: {:?}", sorted_keys(&m.extra)).into());
        }
    }
    if let Some(ref sc) = root.scenario {
        if !sc.extra.is_empty() {
            return Err(format!("Unrecognized fields in scenario: {:?}", sorted_keys(&sc.extra)).into());
        }
    }

    let mut cfg = SimConfig {
        debug_log: root.debug_log,
        ..Default::default()
    };

    if let Some(s) = root.scheduler {
        apply_scheduler_patch(&mut cfg.scheduler, s);
    }
    if let Some(p) = root.phy {
        apply_phy_patch(&mut cfg.phy, p);
    }
    if let Some(m) = root.mac {
        apply_mac_patch(&mut cfg.mac, m);
    }
    if let Some(sc) = root.scenario {
        apply_scenario_patch(&mut cfg.scenario, sc);
    }

    tracing::debug!("loaded config: {:?}", cfg);
    Ok(SharedConfig::try_from_parts(cfg, SimState::default())?)
}

/// Build `SharedConfig` from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let mut contents = String::new();
    let mut reader = BufReader::new(reader);
    reader.read_to_string(&mut contents)?;
    from_toml_str(&contents)
}

/// Build `SharedConfig` from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let f = File::open(path)?;
    let r = BufReader::new(f);
    let cfg = from_reader(r)?;
    Ok(cfg)
}

fn apply_scheduler_patch(dst: &mut CfgScheduler, src: SchedulerDto) {
    dst.scheduler_type = src.scheduler_type;

    if let Some(v) = src.min_broadcast_cbap_duration {
        dst.min_broadcast_cbap_duration = v;
    }
    if let Some(v) = src.inter_allocation_distance {
        dst.inter_allocation_distance = v;
    }
}

fn apply_phy_patch(dst: &mut CfgPhy, src: PhyDto) {
    if let Some(v) = src.mcs {
        dst.mcs = v;
    }
    if let Some(v) = src.mpdu_error_rate {
        dst.mpdu_error_rate = v;
    }
}

fn apply_mac_patch(dst: &mut CfgMac, src: MacDto) {
    if let Some(v) = src.max_amsdu_size {
        dst.max_amsdu_size = v;
    }
    if let Some(v) = src.max_ampdu_size {
        dst.max_ampdu_size = v;
    }
    if let Some(v) = src.rts_cts_threshold {
        dst.rts_cts_threshold = v;
    }
    if let Some(v) = src.max_ssrc {
        dst.max_ssrc = v;
    }
    if let Some(v) = src.max_slrc {
        dst.max_slrc = v;
    }
    if let Some(v) = src.msdu_lifetime_us {
        dst.msdu_lifetime_us = v;
    }
    if let Some(v) = src.block_ack_timeout {
        dst.block_ack_timeout = v;
    }
    if let Some(v) = src.block_ack_buffer_size {
        dst.block_ack_buffer_size = v;
    }
}

fn apply_scenario_patch(dst: &mut CfgScenario, src: ScenarioDto) {
    if let Some(v) = src.beacon_interval_us {
        dst.beacon_interval_us = v;
    }
    if let Some(v) = src.bhi_duration_us {
        dst.bhi_duration_us = v;
    }
    if let Some(v) = src.ati_duration_us {
        dst.ati_duration_us = v;
    }
    if let Some(v) = src.simulation_time_s {
        dst.simulation_time_s = v;
    }
    if let Some(v) = src.app_data_rate_mbps {
        dst.app_data_rate_mbps = v;
    }
    if let Some(v) = src.packet_size {
        dst.packet_size = v;
    }
    if let Some(v) = src.num_stations {
        dst.num_stations = v;
    }
    if let Some(v) = src.allocation_period {
        dst.allocation_period = v;
    }
    if let Some(v) = src.sp_duration_margin {
        dst.sp_duration_margin = v;
    }
    if let Some(v) = src.seed {
        dst.seed = v;
    }
    if let Some(v) = src.output_dir {
        dst.output_dir = v;
    }
}

fn sorted_keys(map: &HashMap<String, Value>) -> Vec<&str> {
    let mut v: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
    v.sort_unstable();
    v
}

/// ----------------------- DTOs for input shape -----------------------

#[derive(Deserialize)]
struct TomlConfigRoot {
    config_version: String,
    debug_log: Option<String>,

    #[serde(default)]
    scheduler: Option<SchedulerDto>,

    #[serde(default)]
    phy: Option<PhyDto>,

    #[serde(default)]
    mac: Option<MacDto>,

    #[serde(default)]
    scenario: Option<ScenarioDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct SchedulerDto {
    pub scheduler_type: SchedulerType,
    pub min_broadcast_cbap_duration: Option<u32>,
    pub inter_allocation_distance: Option<u32>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct PhyDto {
    pub mcs: Option<DmgMcs>,
    pub mpdu_error_rate: Option<f64>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct MacDto {
    pub max_amsdu_size: Option<u32>,
    pub max_ampdu_size: Option<u32>,
    pub rts_cts_threshold: Option<u32>,
    pub max_ssrc: Option<u32>,
    pub max_slrc: Option<u32>,
    pub msdu_lifetime_us: Option<u64>,
    pub block_ack_timeout: Option<u16>,
    pub block_ack_buffer_size: Option<u16>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct ScenarioDto {
    pub beacon_interval_us: Option<u32>,
    pub bhi_duration_us: Option<u32>,
    pub ati_duration_us: Option<u32>,
    pub simulation_time_s: Option<f64>,
    pub app_data_rate_mbps: Option<f64>,
    pub packet_size: Option<u32>,
    pub num_stations: Option<u16>,
    pub allocation_period: Option<u8>,
    pub sp_duration_margin: Option<f64>,
    pub seed: Option<u64>,
    pub output_dir: Option<String>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let cfg = from_toml_str("config_version = \"0.1\"\n").unwrap();
        assert_eq!(cfg.config().scheduler.scheduler_type, SchedulerType::CbapOnly);
        assert_eq!(cfg.config().scheduler.min_broadcast_cbap_duration, 4096);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
config_version = "0.1"
debug_log = "dmg.log"

[scheduler]
scheduler_type = "PeriodicDmgWifiScheduler"
inter_allocation_distance = 20

[phy]
mcs = "DMG_MCS8"
mpdu_error_rate = 0.01

[mac]
max_ampdu_size = 65535
max_ssrc = 4

[scenario]
allocation_period = 4
num_stations = 2
app_data_rate_mbps = 150.0
"#;
        let cfg = from_toml_str(toml).unwrap().config();
        assert_eq!(cfg.debug_log.as_deref(), Some("dmg.log"));
        assert_eq!(cfg.scheduler.scheduler_type, SchedulerType::Periodic);
        assert_eq!(cfg.scheduler.inter_allocation_distance, 20);
        assert_eq!(cfg.phy.mcs.index(), 8);
        assert_eq!(cfg.phy.mpdu_error_rate, 0.01);
        assert_eq!(cfg.mac.max_ampdu_size, 65535);
        assert_eq!(cfg.mac.max_ssrc, 4);
        assert_eq!(cfg.mac.max_slrc, 7);
        assert_eq!(cfg.scenario.allocation_period, 4);
        assert_eq!(cfg.scenario.num_stations, 2);
    }

    #[test]
    fn test_rejects_unknown_fields_and_bad_values() {
        let unknown = "config_version = \"0.1\"\n[mac]\nmax_amsdu = 10\n";
        let err = from_toml_str(unknown).err().unwrap().to_string();
        assert!(err.contains("max_amsdu"), "unexpected error: {}", err);

        let bad_version = "config_version = \"9.9\"\n";
        assert!(from_toml_str(bad_version).is_err());

        let bad_mcs = "config_version = \"0.1\"\n[phy]\nmcs = \"DMG_MCS31\"\n";
        assert!(from_toml_str(bad_mcs).is_err());

        let bad_distance = "config_version = \"0.1\"\n[scheduler]\nscheduler_type = \"Basic\"\ninter_allocation_distance = 5\n";
        assert!(from_toml_str(bad_distance).is_err());
    }
}
