use std::collections::HashMap;

use dmg_config::{SchedulerType, SharedConfig, SimConfig, SimState};
use dmg_core::DmgMcs;
use dmg_mac::{AccessRecord, FlowResult, Network, PacketRecord};

/// Short run with a single station at a low MCS, keeps the event count small
pub fn test_config(scheduler_type: SchedulerType) -> SimConfig {
    let mut cfg = SimConfig::default();
    cfg.scheduler.scheduler_type = scheduler_type;
    cfg.phy.mcs = DmgMcs::from_index(4).unwrap();
    cfg.scenario.simulation_time_s = 0.35;
    cfg.scenario.app_data_rate_mbps = 100.0;
    cfg.scenario.num_stations = 1;
    cfg
}

pub struct NetworkTest {
    pub config: SharedConfig,
    pub network: Network,
}

impl NetworkTest {
    pub fn new(cfg: SimConfig) -> Self {
        let config = SharedConfig::from_config(cfg);
        let network = Network::new(config.clone());
        Self { config, network }
    }

    /// Starts the BSS and runs to the configured end
    pub fn run(&mut self) {
        self.network.start().unwrap();
        self.network.run(None);
    }

    pub fn state(&self) -> SimState {
        self.config.state_read().clone()
    }

    pub fn results(&self) -> Vec<FlowResult> {
        self.network.results()
    }

    /// Access trace entries of one node, in order
    pub fn accesses_of(&self, node: u16) -> Vec<AccessRecord> {
        self.network.access_trace().iter().filter(|r| r.node == node).cloned().collect()
    }

    /// Received packets grouped by source node, in delivery order
    pub fn deliveries(&self) -> HashMap<u16, Vec<PacketRecord>> {
        let mut out: HashMap<u16, Vec<PacketRecord>> = HashMap::new();
        for rec in self.network.packet_trace() {
            out.entry(rec.src_node).or_default().push(rec.clone());
        }
        out
    }
}
