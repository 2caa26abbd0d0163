//! One DMG BSS on a shared medium: an AP (node 0) and its stations, each
//! station streaming CBR traffic to the AP.
//!
//! The network owns the event queue and routes every event to the node it
//! belongs to, in the manner of a message router. Frames put on air by a
//! MAC are picked up after each event, registered with the [`Medium`] and
//! delivered to every other node when they end.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};

use dmg_config::{SchedulerType, SharedConfig};
use dmg_core::{Aid, EventQueue, MacAddr, ScopedScheduler, SimDuration, SimTime};
use dmg_elements::DmgTspecElement;
use dmg_scheduler::{AllocationError, compute_service_period_duration, split_service_period};

use crate::aggregation::MsduAggregator;
use crate::dmg_mac::{DmgApMac, DmgMacEntity, DmgStaMac, MacEvent, MacNotification};
use crate::mac_low::MacLow;
use crate::mac_queue::{MacQueue, TxQueue};
use crate::medium::{CarrierSense, Medium};
use crate::phy::{AirFrame, ChannelPhy};
use crate::station_manager::ConstantRateManager;
use crate::traffic::{CbrSource, FlowStats};
use crate::txop::Txop;

/// Packets a MAC queue holds before it starts dropping
pub const MAC_QUEUE_SIZE: usize = 4000;
/// Broadcast node id used in the SP trace for contention periods
pub const CBAP_TRACE_ID: u16 = 255;
const AP_NODE: usize = 0;


#[derive(Debug, Clone)]
pub enum NetEvent {
    Node { node: usize, ev: MacEvent },
    RxEnd { node: usize, tx_id: u64, frame: Arc<AirFrame> },
    AppTick { node: usize },
}

/// Row of packetsTrace.csv
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub src_node: u16,
    pub tx_ns: u64,
    pub rx_ns: u64,
    pub size: u32,
}

/// Row of spTrace.csv
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub node: u16,
    pub ts_ns: u64,
    pub is_start: bool,
}

/// Row of results.csv, one per station flow
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub src_node: u16,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub throughput_mbps: f64,
    pub avg_delay_s: f64,
    pub avg_jitter_s: f64,
}


pub struct Network {
    config: SharedConfig,
    queue: EventQueue<NetEvent>,
    ap: DmgApMac,
    stations: Vec<DmgStaMac>,
    addresses: Vec<MacAddr>,
    index: HashMap<MacAddr, usize>,
    medium: Medium,
    air_rx: Receiver<AirFrame>,
    notify_rx: Receiver<(MacAddr, MacNotification)>,
    sources: Vec<CbrSource>,
    flows: BTreeMap<u16, FlowStats>,
    packet_trace: Vec<PacketRecord>,
    access_trace: Vec<AccessRecord>,
    end: SimTime,
}

impl Network {
    pub fn new(config: SharedConfig) -> Self {
        let cfg = config.config();
        let (air_tx, air_rx) = unbounded();
        let (notify_tx, notify_rx) = unbounded();
        let carrier = CarrierSense::new();

        let num_nodes = cfg.scenario.num_stations as usize + 1;
        let addresses: Vec<MacAddr> = (0..num_nodes).map(|i| MacAddr::from_index(i as u16)).collect();
        let ap_addr = addresses[AP_NODE];

        let mut ap = DmgApMac::new(config.clone(), build_txop(&config, ap_addr, &air_tx, &carrier), notify_tx.clone());
        let mut stations = Vec::with_capacity(num_nodes - 1);
        let mut sources = Vec::with_capacity(num_nodes - 1);
        for (node, &addr) in addresses.iter().enumerate().skip(1) {
            let aid = node as Aid;
            let mut sta = DmgStaMac::new(aid, ap_addr, config.clone(), build_txop(&config, addr, &air_tx, &carrier), notify_tx.clone());

            // Association and Block Ack setup happen before the first beacon
            ap.associate(addr, aid);
            sta.associate(ap_addr, dmg_core::AID_AP);
            ap.establish_block_ack(addr, 0, SimTime::ZERO);
            sta.establish_block_ack(ap_addr, 0, SimTime::ZERO);

            stations.push(sta);
            sources.push(CbrSource::new(node as u16, addr, ap_addr, cfg.scenario.packet_size, cfg.scenario.app_data_rate_mbps));
        }
        tracing::info!("BSS with {} stations, {} scheduler", stations.len(), ap.scheduler().policy_name());

        let index = addresses.iter().enumerate().map(|(i, a)| (*a, i)).collect();
        let end = SimTime::ZERO + SimDuration::from_secs_f64(cfg.scenario.simulation_time_s);
        Network {
            medium: Medium::new(carrier, cfg.phy.mpdu_error_rate, cfg.scenario.seed),
            config,
            queue: EventQueue::new(),
            ap,
            stations,
            addresses,
            index,
            air_rx,
            notify_rx,
            sources,
            flows: BTreeMap::new(),
            packet_trace: Vec::new(),
            access_trace: Vec::new(),
            end,
        }
    }

    pub fn now(&self) -> SimTime {
        self.queue.now()
    }

    pub fn end(&self) -> SimTime {
        self.end
    }

    pub fn ap(&self) -> &DmgApMac {
        &self.ap
    }

    pub fn station(&self, node: usize) -> Option<&DmgStaMac> {
        node.checked_sub(1).and_then(|i| self.stations.get(i))
    }

    pub fn source(&self, node: usize) -> Option<&CbrSource> {
        node.checked_sub(1).and_then(|i| self.sources.get(i))
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn packet_trace(&self) -> &[PacketRecord] {
        &self.packet_trace
    }

    pub fn access_trace(&self) -> &[AccessRecord] {
        &self.access_trace
    }

    /// The TSPECs every station asks for: an SP sized for the offered load,
    /// split when it exceeds the longest SP block
    pub fn service_period_requests(&self) -> Result<Vec<DmgTspecElement>, AllocationError> {
        let cfg = self.config.config();
        let sc = &cfg.scenario;
        let duration = compute_service_period_duration(
            sc.app_data_rate_mbps * 1e6,
            cfg.phy.mcs.data_rate_bps(),
            sc.beacon_interval_us,
            sc.sp_duration_margin,
        );
        split_service_period(1, true, duration, sc.allocation_period as u16)
    }

    /// Schedules the first beacon interval on every node and sends the
    /// stations' ADDTS requests
    pub fn start(&mut self) -> Result<(), AllocationError> {
        let tspecs = self.service_period_requests()?;
        for node in 0..self.addresses.len() {
            self.queue.schedule_at(SimTime::ZERO, NetEvent::Node { node, ev: MacEvent::BeaconIntervalStarted });
        }
        for (i, sta) in self.stations.iter_mut().enumerate() {
            let node = i + 1;
            let mut sched = ScopedScheduler::new(&mut self.queue, move |ev| NetEvent::Node { node, ev });
            sta.request_service_periods(&mut sched, tspecs.clone());
        }
        self.after_event();
        Ok(())
    }

    /// Runs until the configured end of the simulation or until `running`
    /// is cleared
    pub fn run(&mut self, running: Option<Arc<AtomicBool>>) {
        let end = self.end;
        self.run_until(end, running);
    }

    pub fn run_until(&mut self, end: SimTime, running: Option<Arc<AtomicBool>>) {
        let mut events: u64 = 0;
        while let Some(at) = self.queue.peek_time() {
            if at > end {
                break;
            }
            if let Some(r) = &running {
                if !r.load(Ordering::SeqCst) {
                    tracing::warn!(ts = %self.now(), "interrupted");
                    break;
                }
            }
            let Some((_, ev)) = self.queue.pop_next() else {
                break;
            };
            self.dispatch(ev);
            self.after_event();
            events += 1;
        }
        tracing::info!(ts = %self.now(), "stopped after {} events, {} collisions", events, self.medium.collisions());
    }

    fn dispatch(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Node { node, ev } => {
                let mut sched = ScopedScheduler::new(&mut self.queue, move |ev| NetEvent::Node { node, ev });
                let mac: &mut dyn DmgMacEntity = if node == AP_NODE { &mut self.ap } else { &mut self.stations[node - 1] };
                mac.handle_event(&mut sched, ev);
            }
            NetEvent::RxEnd { node, tx_id, frame } => {
                let receiver = self.addresses[node];
                let Some(rx) = self.medium.receive(tx_id, receiver, &frame) else {
                    return;
                };
                let mut sched = ScopedScheduler::new(&mut self.queue, move |ev| NetEvent::Node { node, ev });
                let mac: &mut dyn DmgMacEntity = if node == AP_NODE { &mut self.ap } else { &mut self.stations[node - 1] };
                mac.receive(&mut sched, rx);
            }
            NetEvent::AppTick { node } => self.app_tick(node),
        }
    }

    fn app_tick(&mut self, node: usize) {
        let now = self.queue.now();
        let Some(source) = self.sources.get_mut(node - 1) else {
            return;
        };
        let msdu = source.next_packet(now);
        let interval = source.interval();
        let mut sched = ScopedScheduler::new(&mut self.queue, move |ev| NetEvent::Node { node, ev });
        if !self.stations[node - 1].enqueue(&mut sched, msdu) {
            tracing::trace!(ts = %now, "node {}: queue full", node);
        }
        if now + interval <= self.end {
            self.queue.schedule(interval, NetEvent::AppTick { node });
        }
    }

    fn start_application(&mut self, node: usize) {
        let now = self.queue.now();
        if let Some(source) = self.sources.get_mut(node - 1) {
            if source.start(now) {
                self.queue.schedule(SimDuration::ZERO, NetEvent::AppTick { node });
            }
        }
    }

    /// Puts new frames on air and handles MAC notifications
    fn after_event(&mut self) {
        let now = self.queue.now();
        while let Ok(frame) = self.air_rx.try_recv() {
            let tx_id = self.medium.start_transmission(now, &frame);
            let transmitter = self.index.get(&frame.transmitter).copied();
            let duration = frame.duration;
            let frame = Arc::new(frame);
            for node in (0..self.addresses.len()).filter(|n| Some(*n) != transmitter) {
                self.queue.schedule(duration, NetEvent::RxEnd { node, tx_id, frame: frame.clone() });
            }
        }

        while let Ok((address, note)) = self.notify_rx.try_recv() {
            let Some(&node) = self.index.get(&address) else {
                continue;
            };
            self.handle_notification(now, node, note);
        }
    }

    fn handle_notification(&mut self, now: SimTime, node: usize, note: MacNotification) {
        match note {
            MacNotification::RxPacket { from, msdu } => {
                let Some(&src) = self.index.get(&from) else {
                    return;
                };
                let src = src as u16;
                self.flows.entry(src).or_default().record(msdu.created, now, msdu.size);
                self.packet_trace.push(PacketRecord {
                    src_node: src,
                    tx_ns: msdu.created.as_nanos(),
                    rx_ns: now.as_nanos(),
                    size: msdu.size,
                });
            }
            MacNotification::AddtsResponse { status, .. } => {
                let cbap_only = self.config.config().scheduler.scheduler_type == SchedulerType::CbapOnly;
                // Under CBAP-only every request fails and traffic goes out in the CBAP anyway
                if status.is_success() || cbap_only {
                    self.start_application(node);
                } else {
                    tracing::info!(ts = %now, "node {}: ADDTS rejected ({}), application not started", node, status);
                }
            }
            MacNotification::ServicePeriodStarted { .. } => self.trace_access(node as u16, now, true),
            MacNotification::ServicePeriodEnded { .. } => self.trace_access(node as u16, now, false),
            MacNotification::ContentionPeriodStarted => self.trace_access(CBAP_TRACE_ID, now, true),
            MacNotification::ContentionPeriodEnded => self.trace_access(CBAP_TRACE_ID, now, false),
            MacNotification::DtiStarted { duration } => {
                self.trace_access(node as u16, now, true);
                self.trace_access(node as u16, now + duration, false);
            }
            MacNotification::TxDropped { receiver, msdus } => {
                tracing::debug!(ts = %now, "node {}: {} packets to {} dropped", node, msdus.len(), receiver);
            }
            MacNotification::TxAcked { .. } => {}
        }
    }

    fn trace_access(&mut self, node: u16, at: SimTime, is_start: bool) {
        self.access_trace.push(AccessRecord { node, ts_ns: at.as_nanos(), is_start });
    }

    /// Per-flow application metrics, throughput measured from each
    /// application's start to the end of the run
    pub fn results(&self) -> Vec<FlowResult> {
        let stop = self.queue.now().min(self.end);
        self.sources
            .iter()
            .map(|src| {
                let flow = self.flows.get(&src.node()).cloned().unwrap_or_default();
                let active = src.started_at().map_or(SimDuration::ZERO, |t| stop.since(t));
                FlowResult {
                    src_node: src.node(),
                    tx_packets: src.tx_packets(),
                    tx_bytes: src.tx_bytes(),
                    rx_packets: flow.rx_packets,
                    rx_bytes: flow.rx_bytes,
                    throughput_mbps: flow.throughput_mbps(active),
                    avg_delay_s: flow.avg_delay_s(),
                    avg_jitter_s: flow.avg_jitter_s(),
                }
            })
            .collect()
    }
}

fn build_txop(config: &SharedConfig, address: MacAddr, air: &Sender<AirFrame>, carrier: &CarrierSense) -> Txop {
    let cfg = config.config();
    let low = MacLow::new(
        address,
        Box::new(ChannelPhy::new(address, air.clone())),
        Box::new(ConstantRateManager::new(cfg.phy.mcs, &cfg.mac)),
        &cfg.mac,
    );
    let queue = TxQueue::new(
        address,
        MacQueue::new(SimDuration::from_micros(cfg.mac.msdu_lifetime_us), MAC_QUEUE_SIZE),
        MsduAggregator::new(cfg.mac.max_amsdu_size),
    );
    Txop::new(low, queue, config.clone(), carrier.clone())
}
