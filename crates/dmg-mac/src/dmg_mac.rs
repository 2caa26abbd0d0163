//! Upper MAC of the DMG AP and of its stations.
//!
//! Both sides follow the beacon interval: BHI, then the DTI split into the
//! allocations announced in the AP's beacon. Each node opens an access
//! window for every broadcast CBAP and for every SP it is the source of;
//! outside those windows the channel access function stays silent.
//!
//! The AP owns the [`DmgWifiScheduler`], answers ADDTS requests and builds
//! the beacon from the scheduler's allocation list. A station learns the
//! schedule from the beacon and requests its SPs with ADDTS.

use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender, unbounded};

use dmg_config::SharedConfig;
use dmg_core::{AID_AP, Aid, EventId, EventScheduler, FrameBuf, MacAddr, MappedScheduler, SimDuration, SimTime, Tid};
use dmg_elements::{
    AllocationField, AllocationFieldList, AllocationType, DmgAllocationInfo, DmgTspecElement, ExtendedScheduleElement,
    StatusCode,
};
use dmg_scheduler::{AddtsRequest, DmgWifiScheduler, SchedulerEvent, SchedulerNotification};

use crate::frame::{ActionFrame, FrameBody, Mpdu, Msdu, WifiMacHeader};
use crate::phy::RxPsdu;
use crate::txop::{AccessWindow, Txop, TxopEvent, TxopNotification};


/// Events of one MAC entity, carried on the simulation event queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacEvent {
    Txop(TxopEvent),
    Scheduler(SchedulerEvent),
    BeaconIntervalStarted,
    DtiStarted,
    AllocationStart(AccessWindow),
    AllocationEnd(AccessWindow),
}

/// What a MAC entity reports to the simulation
#[derive(Debug, Clone)]
pub enum MacNotification {
    RxPacket { from: MacAddr, msdu: Msdu },
    TxAcked { receiver: MacAddr, msdus: usize },
    TxDropped { receiver: MacAddr, msdus: Vec<Msdu> },
    AddtsResponse { status: StatusCode, tspec: DmgTspecElement },
    DtiStarted { duration: SimDuration },
    ContentionPeriodStarted,
    ContentionPeriodEnded,
    ServicePeriodStarted { peer: MacAddr },
    ServicePeriodEnded { peer: MacAddr },
}

/// Notifications are tagged with the address of the reporting MAC
pub type MacNotificationSender = Sender<(MacAddr, MacNotification)>;


pub trait DmgMacEntity: Send {
    fn address(&self) -> MacAddr;

    fn aid(&self) -> Aid;

    fn txop(&self) -> &Txop;

    fn handle_event(&mut self, sched: &mut dyn EventScheduler<MacEvent>, ev: MacEvent);

    /// Hands a PSDU decoded by the PHY to the MAC
    fn receive(&mut self, sched: &mut dyn EventScheduler<MacEvent>, rx: RxPsdu);

    /// Queues an upper-layer packet, false if the queue refused it
    fn enqueue(&mut self, sched: &mut dyn EventScheduler<MacEvent>, msdu: Msdu) -> bool;

    /// Records `peer` as associated under `aid`
    fn associate(&mut self, peer: MacAddr, aid: Aid);

    /// Installs both ends of a Block Ack session towards `peer`
    fn establish_block_ack(&mut self, peer: MacAddr, tid: Tid, now: SimTime);
}


/// State and behavior shared by the AP and the stations
struct MacCore {
    address: MacAddr,
    aid: Aid,
    config: SharedConfig,
    txop: Txop,
    notify: MacNotificationSender,
    peers: HashMap<Aid, MacAddr>,
    /// Schedule applied at the next DTI start
    schedule: AllocationFieldList,
    access_events: Vec<EventId>,
}

impl MacCore {
    fn new(aid: Aid, config: SharedConfig, txop: Txop, notify: MacNotificationSender) -> Self {
        MacCore {
            address: txop.low().address(),
            aid,
            config,
            txop,
            notify,
            peers: HashMap::new(),
            schedule: Vec::new(),
            access_events: Vec::new(),
        }
    }

    fn report(&self, note: MacNotification) {
        if self.notify.send((self.address, note)).is_err() {
            tracing::trace!("{}: notification receiver gone", self.address);
        }
    }

    fn associate(&mut self, peer: MacAddr, aid: Aid) {
        self.peers.insert(aid, peer);
        self.txop.low_mut().station_manager_mut().record_association(peer);
    }

    fn establish_block_ack(&mut self, peer: MacAddr, tid: Tid, now: SimTime) {
        let cfg = self.config.config();
        let (buffer, timeout) = (cfg.mac.block_ack_buffer_size, cfg.mac.block_ack_timeout);
        let ssn = self.txop.queue().next_sequence(peer, tid);
        let low = self.txop.low_mut();
        low.create_originator_agreement(peer, tid, buffer, timeout, ssn, now);
        low.create_recipient_agreement(peer, tid, buffer, timeout, 0, now);
    }

    fn txop_event(&mut self, sched: &mut dyn EventScheduler<MacEvent>, ev: TxopEvent) -> Vec<TxopNotification> {
        self.txop.handle_event(&mut MappedScheduler::new(&mut *sched, MacEvent::Txop), ev);
        self.drain_txop()
    }

    fn receive(&mut self, sched: &mut dyn EventScheduler<MacEvent>, rx: RxPsdu) -> Vec<TxopNotification> {
        self.txop.receive(&mut MappedScheduler::new(&mut *sched, MacEvent::Txop), rx);
        self.drain_txop()
    }

    fn enqueue(&mut self, sched: &mut dyn EventScheduler<MacEvent>, msdu: Msdu) -> bool {
        self.txop.enqueue(&mut MappedScheduler::new(&mut *sched, MacEvent::Txop), msdu)
    }

    fn send_management(&mut self, sched: &mut dyn EventScheduler<MacEvent>, to: MacAddr, frame: &ActionFrame) {
        let mpdu = Mpdu::new(WifiMacHeader::action(to, self.address), FrameBody::Management(frame.to_bytes()));
        self.txop.enqueue_management(&mut MappedScheduler::new(&mut *sched, MacEvent::Txop), mpdu);
    }

    /// Handles data-plane notifications and returns the management ones
    fn drain_txop(&mut self) -> Vec<TxopNotification> {
        let mut management = Vec::new();
        for note in self.txop.take_notifications() {
            match note {
                TxopNotification::RxMsdu { from, msdu } => {
                    {
                        let mut state = self.config.state_write();
                        state.rx_msdus += 1;
                        state.rx_bytes += msdu.size as u64;
                    }
                    self.report(MacNotification::RxPacket { from, msdu });
                }
                TxopNotification::Acked { receiver, msdus } => self.report(MacNotification::TxAcked { receiver, msdus }),
                TxopNotification::Dropped { receiver, msdus } => self.report(MacNotification::TxDropped { receiver, msdus }),
                other => management.push(other),
            }
        }
        management
    }

    /// Closes the running window and forgets the windows planned for the DTI
    fn stop_access(&mut self, sched: &mut dyn EventScheduler<MacEvent>) {
        for id in self.access_events.drain(..) {
            sched.cancel(id);
        }
        if let Some(window) = self.txop.window() {
            self.close_window(sched, window);
        }
    }

    fn peer_address(&self, aid: Aid) -> Option<MacAddr> {
        self.peers.get(&aid).copied()
    }

    /// Turns the schedule into access windows. Offsets are relative to the DTI start.
    fn plan_dti(&mut self, sched: &mut dyn EventScheduler<MacEvent>) {
        for id in self.access_events.drain(..) {
            sched.cancel(id);
        }
        let dti_start = sched.now();
        let mut windows: Vec<(SimDuration, AccessWindow)> = Vec::new();
        for field in &self.schedule {
            let Some(kind) = self.window_kind(field) else {
                continue;
            };
            for start in field.block_starts() {
                let offset = SimDuration::from_micros(start as u64);
                let end = dti_start + offset + SimDuration::from_micros(field.block_duration as u64);
                let window = match kind {
                    None => AccessWindow::Cbap { end },
                    Some(peer) => AccessWindow::ServicePeriod { peer, end },
                };
                windows.push((offset, window));
            }
        }
        windows.sort_by_key(|(offset, _)| *offset);

        for (offset, window) in windows {
            let length = window.end().since(dti_start + offset);
            self.access_events.push(sched.schedule(offset, MacEvent::AllocationStart(window)));
            self.access_events.push(sched.schedule(offset + length, MacEvent::AllocationEnd(window)));
        }
        tracing::debug!(ts = %dti_start, "{}: {} access windows in this DTI", self.address, self.access_events.len() / 2);
    }

    /// `Some(None)` for a broadcast CBAP, `Some(Some(peer))` for an SP we
    /// transmit in, `None` when the allocation is not ours
    fn window_kind(&self, field: &AllocationField) -> Option<Option<MacAddr>> {
        if field.is_broadcast_cbap() {
            return Some(None);
        }
        if field.allocation_type != AllocationType::ServicePeriod || field.source_aid != self.aid {
            return None;
        }
        match self.peer_address(field.destination_aid) {
            Some(peer) => Some(Some(peer)),
            None => {
                tracing::warn!("{}: SP {} towards unknown AID {}", self.address, field.allocation_id, field.destination_aid);
                None
            }
        }
    }

    fn open_window(&mut self, sched: &mut dyn EventScheduler<MacEvent>, window: AccessWindow, report_cbap: bool) {
        if let Some(previous) = self.txop.window() {
            self.close_window(sched, previous);
        }
        match window {
            AccessWindow::ServicePeriod { peer, .. } => self.report(MacNotification::ServicePeriodStarted { peer }),
            AccessWindow::Cbap { .. } if report_cbap => self.report(MacNotification::ContentionPeriodStarted),
            AccessWindow::Cbap { .. } => {}
        }
        self.txop.start_access(&mut MappedScheduler::new(&mut *sched, MacEvent::Txop), window);
    }

    fn close_window(&mut self, sched: &mut dyn EventScheduler<MacEvent>, window: AccessWindow) {
        if self.txop.window() != Some(window) {
            return;
        }
        self.txop.end_access(&mut MappedScheduler::new(&mut *sched, MacEvent::Txop));
        match window {
            AccessWindow::ServicePeriod { peer, .. } => self.report(MacNotification::ServicePeriodEnded { peer }),
            AccessWindow::Cbap { .. } if self.aid == AID_AP => self.report(MacNotification::ContentionPeriodEnded),
            AccessWindow::Cbap { .. } => {}
        }
    }
}


/// DMG AP: runs the scheduler and transmits the beacon
pub struct DmgApMac {
    core: MacCore,
    scheduler: DmgWifiScheduler,
    scheduler_rx: Receiver<SchedulerNotification>,
    associations: HashMap<MacAddr, Aid>,
    dialog_tokens: HashMap<Aid, u8>,
}

impl DmgApMac {
    pub fn new(config: SharedConfig, txop: Txop, notify: MacNotificationSender) -> Self {
        let (tx, rx) = unbounded();
        let scheduler = DmgWifiScheduler::from_config(config.clone(), tx);
        Self::with_scheduler(config, txop, scheduler, rx, notify)
    }

    pub fn with_scheduler(
        config: SharedConfig,
        txop: Txop,
        scheduler: DmgWifiScheduler,
        scheduler_rx: Receiver<SchedulerNotification>,
        notify: MacNotificationSender,
    ) -> Self {
        let mut core = MacCore::new(AID_AP, config, txop, notify);
        let address = core.address;
        core.peers.insert(AID_AP, address);
        DmgApMac {
            core,
            scheduler,
            scheduler_rx,
            associations: HashMap::new(),
            dialog_tokens: HashMap::new(),
        }
    }

    pub fn scheduler(&self) -> &DmgWifiScheduler {
        &self.scheduler
    }

    fn beacon_interval_started(&mut self, sched: &mut dyn EventScheduler<MacEvent>) {
        let cfg = self.core.config.config();
        let bhi = SimDuration::from_micros(cfg.scenario.bhi_duration_us as u64);
        let ati = SimDuration::from_micros(cfg.scenario.ati_duration_us as u64);
        self.core.stop_access(sched);
        self.scheduler
            .beacon_interval_started(&mut MappedScheduler::new(&mut *sched, MacEvent::Scheduler), self.core.address, bhi, ati);

        self.core.schedule = self.scheduler.allocation_list().clone();
        let mut buf = FrameBuf::new();
        ExtendedScheduleElement::new(self.core.schedule.clone()).to_framebuf(&mut buf);
        let beacon = Mpdu::new(WifiMacHeader::beacon(self.core.address), FrameBody::Management(buf.into_bytes()));
        tracing::debug!(ts = %sched.now(), "beacon with {} allocations", self.core.schedule.len());
        self.core.txop.transmit_now(&mut MappedScheduler::new(&mut *sched, MacEvent::Txop), beacon);
        self.handle_txop_management(sched, Vec::new());

        sched.schedule(bhi, MacEvent::DtiStarted);
    }

    fn dti_started(&mut self, sched: &mut dyn EventScheduler<MacEvent>) {
        let dti = SimDuration::from_micros(self.core.config.config().scenario.dti_duration_us() as u64);
        self.scheduler
            .data_transfer_interval_started(&mut MappedScheduler::new(&mut *sched, MacEvent::Scheduler), self.core.address, dti);
        self.core.report(MacNotification::DtiStarted { duration: dti });
        self.core.plan_dti(sched);
    }

    fn scheduler_event(&mut self, sched: &mut dyn EventScheduler<MacEvent>, ev: SchedulerEvent) {
        self.scheduler.handle_event(&mut MappedScheduler::new(&mut *sched, MacEvent::Scheduler), ev);
        self.drain_scheduler(sched);
        if ev == SchedulerEvent::BeaconIntervalEnded {
            self.beacon_interval_started(sched);
        }
    }

    fn drain_scheduler(&mut self, sched: &mut dyn EventScheduler<MacEvent>) {
        while let Ok(note) = self.scheduler_rx.try_recv() {
            match note {
                SchedulerNotification::AddtsResponse { destination, aid, status, tspec } => {
                    let dialog_token = self.dialog_tokens.get(&aid).copied().unwrap_or(0);
                    tracing::info!("ADDTS response to {} (AID {}): {:?}", destination, aid, status);
                    let frame = ActionFrame::AddtsResponse { dialog_token, status, tspec };
                    self.core.send_management(sched, destination, &frame);
                }
                SchedulerNotification::ScheduleUpdated { allocations } => {
                    tracing::debug!("next beacon interval carries {} allocations", allocations.len());
                }
            }
        }
    }

    fn handle_txop_management(&mut self, sched: &mut dyn EventScheduler<MacEvent>, mut notes: Vec<TxopNotification>) {
        notes.extend(self.core.drain_txop());
        for note in notes {
            match note {
                TxopNotification::RxManagement { from, body } => self.receive_action(from, &body),
                TxopNotification::RxBeacon { from, .. } => {
                    tracing::warn!(ts = %sched.now(), "AP heard a beacon from {}", from);
                }
                _ => {}
            }
        }
    }

    fn receive_action(&mut self, from: MacAddr, body: &[u8]) {
        let frame = match ActionFrame::from_bytes(body) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("malformed action frame from {}: {}", from, e);
                return;
            }
        };
        let Some(&aid) = self.associations.get(&from) else {
            tracing::warn!("action frame from unassociated {}", from);
            return;
        };
        match frame {
            ActionFrame::AddtsRequest { dialog_token, tspec } => {
                self.dialog_tokens.insert(aid, dialog_token);
                self.scheduler.receive_addts_request(AddtsRequest { source_addr: from, source_aid: aid, tspec });
            }
            ActionFrame::Delts { allocation_info } => {
                if let Err(e) = self.scheduler.receive_delts(aid, &allocation_info) {
                    tracing::warn!("DELTS from {}: {}", from, e);
                }
            }
            ActionFrame::AddtsResponse { .. } => {
                tracing::warn!("unexpected ADDTS response from {}", from);
            }
        }
    }
}

impl DmgMacEntity for DmgApMac {
    fn address(&self) -> MacAddr {
        self.core.address
    }

    fn aid(&self) -> Aid {
        AID_AP
    }

    fn txop(&self) -> &Txop {
        &self.core.txop
    }

    fn handle_event(&mut self, sched: &mut dyn EventScheduler<MacEvent>, ev: MacEvent) {
        match ev {
            MacEvent::Txop(ev) => {
                let notes = self.core.txop_event(sched, ev);
                self.handle_txop_management(sched, notes);
            }
            MacEvent::Scheduler(ev) => self.scheduler_event(sched, ev),
            MacEvent::BeaconIntervalStarted => self.beacon_interval_started(sched),
            MacEvent::DtiStarted => self.dti_started(sched),
            MacEvent::AllocationStart(window) => {
                self.core.open_window(sched, window, true);
                self.handle_txop_management(sched, Vec::new());
            }
            MacEvent::AllocationEnd(window) => {
                self.core.close_window(sched, window);
                self.handle_txop_management(sched, Vec::new());
            }
        }
    }

    fn receive(&mut self, sched: &mut dyn EventScheduler<MacEvent>, rx: RxPsdu) {
        let notes = self.core.receive(sched, rx);
        self.handle_txop_management(sched, notes);
    }

    fn enqueue(&mut self, sched: &mut dyn EventScheduler<MacEvent>, msdu: Msdu) -> bool {
        self.core.enqueue(sched, msdu)
    }

    fn associate(&mut self, peer: MacAddr, aid: Aid) {
        self.associations.insert(peer, aid);
        self.core.associate(peer, aid);
    }

    fn establish_block_ack(&mut self, peer: MacAddr, tid: Tid, now: SimTime) {
        self.core.establish_block_ack(peer, tid, now);
    }
}


/// DMG station: follows the AP's schedule and negotiates its SPs
pub struct DmgStaMac {
    core: MacCore,
    ap_address: MacAddr,
    next_dialog_token: u8,
    /// Schedule heard in this beacon interval's beacon
    heard_schedule: Option<AllocationFieldList>,
}

impl DmgStaMac {
    pub fn new(aid: Aid, ap_address: MacAddr, config: SharedConfig, txop: Txop, notify: MacNotificationSender) -> Self {
        let mut core = MacCore::new(aid, config, txop, notify);
        core.peers.insert(AID_AP, ap_address);
        DmgStaMac { core, ap_address, next_dialog_token: 1, heard_schedule: None }
    }

    pub fn ap_address(&self) -> MacAddr {
        self.ap_address
    }

    /// Schedule of the running beacon interval, empty until a beacon was heard
    pub fn schedule(&self) -> &AllocationFieldList {
        &self.core.schedule
    }

    /// Sends one ADDTS request per TSPEC; answers arrive as
    /// [`MacNotification::AddtsResponse`]
    pub fn request_service_periods(&mut self, sched: &mut dyn EventScheduler<MacEvent>, tspecs: Vec<DmgTspecElement>) {
        for tspec in tspecs {
            let dialog_token = self.next_dialog_token;
            self.next_dialog_token = self.next_dialog_token.wrapping_add(1).max(1);
            tracing::info!("{}: ADDTS request {}", self.core.address, tspec);
            let frame = ActionFrame::AddtsRequest { dialog_token, tspec };
            self.core.send_management(sched, self.ap_address, &frame);
        }
    }

    /// Gives a granted allocation back to the AP
    pub fn release_service_period(&mut self, sched: &mut dyn EventScheduler<MacEvent>, allocation_info: DmgAllocationInfo) {
        tracing::info!("{}: DELTS for allocation {}", self.core.address, allocation_info.allocation_id);
        let frame = ActionFrame::Delts { allocation_info };
        self.core.send_management(sched, self.ap_address, &frame);
    }

    fn beacon_interval_started(&mut self, sched: &mut dyn EventScheduler<MacEvent>) {
        let cfg = self.core.config.config();
        self.core.stop_access(sched);
        self.heard_schedule = None;
        sched.schedule(SimDuration::from_micros(cfg.scenario.bhi_duration_us as u64), MacEvent::DtiStarted);
        sched.schedule(SimDuration::from_micros(cfg.scenario.beacon_interval_us as u64), MacEvent::BeaconIntervalStarted);
    }

    fn dti_started(&mut self, sched: &mut dyn EventScheduler<MacEvent>) {
        match self.heard_schedule.take() {
            Some(schedule) => {
                self.core.schedule = schedule;
                self.core.plan_dti(sched);
            }
            None => {
                // Without a beacon the station does not know when it may transmit
                tracing::debug!(ts = %sched.now(), "{}: no beacon heard, skipping DTI", self.core.address);
                self.core.schedule.clear();
            }
        }
    }

    fn handle_txop_management(&mut self, sched: &mut dyn EventScheduler<MacEvent>, mut notes: Vec<TxopNotification>) {
        notes.extend(self.core.drain_txop());
        for note in notes {
            match note {
                TxopNotification::RxBeacon { from, body } => self.receive_beacon(sched.now(), from, body),
                TxopNotification::RxManagement { from, body } => self.receive_action(from, &body),
                _ => {}
            }
        }
    }

    fn receive_beacon(&mut self, now: SimTime, from: MacAddr, body: Vec<u8>) {
        if from != self.ap_address {
            return;
        }
        match ExtendedScheduleElement::from_framebuf(&mut FrameBuf::from_vec(body)) {
            Ok(element) => {
                tracing::trace!(ts = %now, "{}: beacon with {} allocations", self.core.address, element.allocations.len());
                self.heard_schedule = Some(element.allocations);
            }
            Err(e) => tracing::warn!("{}: malformed beacon: {}", self.core.address, e),
        }
    }

    fn receive_action(&mut self, from: MacAddr, body: &[u8]) {
        match ActionFrame::from_bytes(body) {
            Ok(ActionFrame::AddtsResponse { status, tspec, .. }) => {
                tracing::info!("{}: ADDTS response {:?} for allocation {}", self.core.address, status, tspec.allocation_info.allocation_id);
                self.core.report(MacNotification::AddtsResponse { status, tspec });
            }
            Ok(other) => tracing::warn!("{}: unexpected {:?} from {}", self.core.address, other, from),
            Err(e) => tracing::warn!("{}: malformed action frame from {}: {}", self.core.address, from, e),
        }
    }
}

impl DmgMacEntity for DmgStaMac {
    fn address(&self) -> MacAddr {
        self.core.address
    }

    fn aid(&self) -> Aid {
        self.core.aid
    }

    fn txop(&self) -> &Txop {
        &self.core.txop
    }

    fn handle_event(&mut self, sched: &mut dyn EventScheduler<MacEvent>, ev: MacEvent) {
        match ev {
            MacEvent::Txop(ev) => {
                let notes = self.core.txop_event(sched, ev);
                self.handle_txop_management(sched, notes);
            }
            MacEvent::Scheduler(ev) => {
                tracing::warn!("{}: station got scheduler event {:?}", self.core.address, ev);
            }
            MacEvent::BeaconIntervalStarted => self.beacon_interval_started(sched),
            MacEvent::DtiStarted => self.dti_started(sched),
            MacEvent::AllocationStart(window) => {
                self.core.open_window(sched, window, false);
                self.handle_txop_management(sched, Vec::new());
            }
            MacEvent::AllocationEnd(window) => {
                self.core.close_window(sched, window);
                self.handle_txop_management(sched, Vec::new());
            }
        }
    }

    fn receive(&mut self, sched: &mut dyn EventScheduler<MacEvent>, rx: RxPsdu) {
        let notes = self.core.receive(sched, rx);
        self.handle_txop_management(sched, notes);
    }

    fn enqueue(&mut self, sched: &mut dyn EventScheduler<MacEvent>, msdu: Msdu) -> bool {
        self.core.enqueue(sched, msdu)
    }

    fn associate(&mut self, peer: MacAddr, aid: Aid) {
        self.core.associate(peer, aid);
    }

    fn establish_block_ack(&mut self, peer: MacAddr, tid: Tid, now: SimTime) {
        self.core.establish_block_ack(peer, tid, now);
    }
}


#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;
    use dmg_config::SimConfig;
    use dmg_core::{AID_BROADCAST, DmgMcs, EventQueue, debug};

    use super::*;
    use crate::aggregation::MsduAggregator;
    use crate::mac_low::MacLow;
    use crate::mac_queue::{MacQueue, TxQueue};
    use crate::medium::CarrierSense;
    use crate::phy::{ChannelPhy, RxMpdu};
    use crate::station_manager::ConstantRateManager;
    use crate::tx_params::TxVector;

    fn txop(config: &SharedConfig, address: MacAddr) -> Txop {
        let cfg = config.config();
        let (air, _) = unbounded();
        let low = MacLow::new(
            address,
            Box::new(ChannelPhy::new(address, air)),
            Box::new(ConstantRateManager::new(cfg.phy.mcs, &cfg.mac)),
            &cfg.mac,
        );
        let queue = TxQueue::new(
            address,
            MacQueue::new(SimDuration::from_micros(cfg.mac.msdu_lifetime_us), 1000),
            MsduAggregator::new(cfg.mac.max_amsdu_size),
        );
        Txop::new(low, queue, config.clone(), CarrierSense::new())
    }

    fn beacon_rx(ap: MacAddr, allocations: AllocationFieldList) -> RxPsdu {
        let mut buf = FrameBuf::new();
        ExtendedScheduleElement::new(allocations).to_framebuf(&mut buf);
        let mpdu = Mpdu::new(WifiMacHeader::beacon(ap), FrameBody::Management(buf.into_bytes()));
        RxPsdu {
            mpdus: vec![RxMpdu { mpdu, fcs_ok: true }],
            is_ampdu: false,
            tx_vector: TxVector::new(DmgMcs::from_index(12).unwrap()),
            snr_db: 20.0,
        }
    }

    #[test]
    fn test_station_plans_windows_from_beacon() {
        debug::setup_logging_verbose();
        let config = SharedConfig::from_config(SimConfig::default());
        let (notify, reports) = unbounded();
        let ap = MacAddr::from_index(0);
        let sta_addr = MacAddr::from_index(1);
        let mut sta = DmgStaMac::new(1, ap, config.clone(), txop(&config, sta_addr), notify);
        let mut q: EventQueue<MacEvent> = EventQueue::new();

        sta.handle_event(&mut q, MacEvent::BeaconIntervalStarted);
        let cbap = AllocationField {
            allocation_type: AllocationType::Cbap,
            source_aid: AID_BROADCAST,
            destination_aid: AID_BROADCAST,
            allocation_start: 0,
            block_duration: 4000,
            ..Default::default()
        };
        let sp = AllocationField {
            allocation_id: 1,
            allocation_type: AllocationType::ServicePeriod,
            source_aid: 1,
            destination_aid: AID_AP,
            allocation_start: 4010,
            block_duration: 2000,
            number_of_blocks: 2,
            block_period: 10_000,
            ..Default::default()
        };
        let foreign_sp = AllocationField { source_aid: 2, allocation_id: 2, allocation_start: 30_000, ..sp.clone() };
        sta.receive(&mut q, beacon_rx(ap, vec![cbap, sp, foreign_sp]));

        let mut starts = Vec::new();
        while let Some((at, ev)) = q.pop_next() {
            if at > SimTime::ZERO + SimDuration::from_millis(50) {
                break;
            }
            if let MacEvent::AllocationStart(window) = &ev {
                starts.push((at, *window));
            }
            sta.handle_event(&mut q, ev);
        }

        let dti = SimTime::ZERO + SimDuration::from_micros(3000);
        assert_eq!(starts.len(), 3, "one CBAP and two SP blocks, the other station's SP ignored");
        assert_eq!(starts[0], (dti, AccessWindow::Cbap { end: dti + SimDuration::from_micros(4000) }));
        assert_eq!(
            starts[2],
            (
                dti + SimDuration::from_micros(14_010),
                AccessWindow::ServicePeriod { peer: ap, end: dti + SimDuration::from_micros(16_010) }
            )
        );

        let sp_reports = reports
            .try_iter()
            .filter(|(_, n)| matches!(n, MacNotification::ServicePeriodStarted { .. } | MacNotification::ServicePeriodEnded { .. }))
            .count();
        assert_eq!(sp_reports, 4);
    }

    #[test]
    fn test_station_without_beacon_stays_silent() {
        debug::setup_logging_verbose();
        let config = SharedConfig::from_config(SimConfig::default());
        let (notify, _reports) = unbounded();
        let ap = MacAddr::from_index(0);
        let mut sta = DmgStaMac::new(1, ap, config.clone(), txop(&config, MacAddr::from_index(1)), notify);
        let mut q: EventQueue<MacEvent> = EventQueue::new();

        sta.handle_event(&mut q, MacEvent::BeaconIntervalStarted);
        while let Some((at, ev)) = q.pop_next() {
            if at > SimTime::ZERO + SimDuration::from_millis(10) {
                break;
            }
            assert!(!matches!(ev, MacEvent::AllocationStart(_)), "no window without a schedule");
            sta.handle_event(&mut q, ev);
        }
        assert!(sta.schedule().is_empty());
    }

    #[test]
    fn test_ap_rejects_action_from_unassociated_station() {
        debug::setup_logging_verbose();
        let config = SharedConfig::from_config(SimConfig::default());
        let (notify, _reports) = unbounded();
        let ap_addr = MacAddr::from_index(0);
        let mut ap = DmgApMac::new(config.clone(), txop(&config, ap_addr), notify);
        let tspec = dmg_scheduler::build_dmg_tspec(1, true, 1000, 1000, 0).unwrap();
        let body = ActionFrame::AddtsRequest { dialog_token: 1, tspec }.to_bytes();

        ap.receive_action(MacAddr::from_index(5), &body);
        assert_eq!(ap.scheduler().state().pending_requests(), 0);

        ap.associate(MacAddr::from_index(5), 5);
        ap.receive_action(MacAddr::from_index(5), &body);
        assert_eq!(ap.scheduler().state().pending_requests(), 1);
    }
}
