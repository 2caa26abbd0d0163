//! Channel access function of a station: decides when MacLow may start a
//! transaction and deals with its outcome.
//!
//! Inside a broadcast CBAP the station contends with a random backoff. Inside
//! its own service period it transmits back to back, SIFS apart, towards the
//! SP peer. Outside both it stays silent.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dmg_config::SharedConfig;
use dmg_core::{EventId, EventScheduler, MacAddr, MappedScheduler, SIFS, SLOT_TIME, SimDuration, SimTime, Tid};

use crate::frame::{FrameBody, FrameType, Mpdu, Msdu};
use crate::mac_low::{MacLow, MacLowEvent, MacLowNotification, ResumeOutcome};
use crate::mac_queue::TxQueue;
use crate::medium::CarrierSense;
use crate::phy::RxPsdu;
use crate::tx_params::{AckType, TxParams};

/// Best effort AIFSN
const AIFSN: u64 = 3;
const CW_MIN: u32 = 15;
const CW_MAX: u32 = 1023;

fn slots(n: u64) -> SimDuration {
    SimDuration::from_nanos(SLOT_TIME.as_nanos() * n)
}

fn aifs() -> SimDuration {
    SIFS + slots(AIFSN)
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxopEvent {
    Low(MacLowEvent),
    BackoffDone,
    StartNext,
}

/// Period during which the station may initiate frame exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWindow {
    Cbap { end: SimTime },
    ServicePeriod { peer: MacAddr, end: SimTime },
}

impl AccessWindow {
    pub fn end(&self) -> SimTime {
        match self {
            AccessWindow::Cbap { end } | AccessWindow::ServicePeriod { end, .. } => *end,
        }
    }

    pub fn peer(&self) -> Option<MacAddr> {
        match self {
            AccessWindow::Cbap { .. } => None,
            AccessWindow::ServicePeriod { peer, .. } => Some(*peer),
        }
    }
}

/// What the MAC above needs to hear about
#[derive(Debug, Clone)]
pub enum TxopNotification {
    RxMsdu { from: MacAddr, msdu: Msdu },
    RxManagement { from: MacAddr, body: Vec<u8> },
    RxBeacon { from: MacAddr, body: Vec<u8> },
    Acked { receiver: MacAddr, msdus: usize },
    Dropped { receiver: MacAddr, msdus: Vec<Msdu> },
}


pub struct Txop {
    address: MacAddr,
    low: MacLow,
    queue: TxQueue,
    config: SharedConfig,
    carrier: CarrierSense,
    rng: StdRng,

    cw: u32,
    backoff_slots: Option<u32>,
    backoff_event: EventId,
    next_event: EventId,
    window: Option<AccessWindow>,

    pending_bars: VecDeque<(MacAddr, Tid)>,
    bar_attempts: HashMap<(MacAddr, Tid), u32>,
    notifications: Vec<TxopNotification>,
}

impl Txop {
    pub fn new(low: MacLow, queue: TxQueue, config: SharedConfig, carrier: CarrierSense) -> Self {
        let address = low.address();
        let seed = config.config().scenario.seed ^ u64::from_be_bytes({
            let o = address.octets();
            [0, 0, o[0], o[1], o[2], o[3], o[4], o[5]]
        });
        Txop {
            address,
            low,
            queue,
            config,
            carrier,
            rng: StdRng::seed_from_u64(seed),
            cw: CW_MIN,
            backoff_slots: None,
            backoff_event: EventId::NONE,
            next_event: EventId::NONE,
            window: None,
            pending_bars: VecDeque::new(),
            bar_attempts: HashMap::new(),
            notifications: Vec::new(),
        }
    }

    pub fn low(&self) -> &MacLow {
        &self.low
    }

    pub fn low_mut(&mut self) -> &mut MacLow {
        &mut self.low
    }

    pub fn queue(&self) -> &TxQueue {
        &self.queue
    }

    pub fn window(&self) -> Option<AccessWindow> {
        self.window
    }

    pub fn take_notifications(&mut self) -> Vec<TxopNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Queues an upper-layer packet. Returns false when the queue dropped it.
    pub fn enqueue(&mut self, sched: &mut dyn EventScheduler<TxopEvent>, msdu: Msdu) -> bool {
        let now = sched.now();
        if !self.queue.enqueue_msdu(now, msdu) {
            self.config.state_write().dropped_msdus += 1;
            return false;
        }
        self.kick(sched);
        true
    }

    pub fn enqueue_management(&mut self, sched: &mut dyn EventScheduler<TxopEvent>, mpdu: Mpdu) {
        self.queue.enqueue_management(mpdu);
        self.kick(sched);
    }

    /// Sends a group-addressed frame right away without contention, as the AP
    /// does with beacons during the BHI
    pub fn transmit_now(&mut self, sched: &mut dyn EventScheduler<TxopEvent>, mpdu: Mpdu) {
        if self.low.is_busy(sched.now()) {
            tracing::warn!(ts = %sched.now(), "medium busy, dropping {}", mpdu);
            return;
        }
        self.low.start_transmission(&mut MappedScheduler::new(&mut *sched, TxopEvent::Low), mpdu, TxParams::no_ack(), &mut self.queue);
        self.process_low_notifications(sched);
    }


    /* Access windows */

    pub fn start_access(&mut self, sched: &mut dyn EventScheduler<TxopEvent>, window: AccessWindow) {
        let now = sched.now();
        tracing::debug!(ts = %now, "{}: access window {:?}", self.address, window);
        self.cancel_access_events(sched);
        self.window = Some(window);
        self.low.set_allocation_end(Some(window.end()));
        self.low.expire_agreements(now);

        match window {
            AccessWindow::Cbap { .. } => self.start_backoff(sched),
            AccessWindow::ServicePeriod { .. } => self.transmit_next(sched),
        }
    }

    /// Closes the window; a transaction still in flight is parked in MacLow
    pub fn end_access(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        let Some(window) = self.window.take() else {
            return;
        };
        tracing::debug!(ts = %sched.now(), "{}: end of {:?}", self.address, window);
        self.cancel_access_events(sched);
        self.low.store_allocation_parameters(&mut MappedScheduler::new(&mut *sched, TxopEvent::Low));
        self.low.set_allocation_end(None);
        self.process_low_notifications(sched);
    }

    fn cancel_access_events(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        sched.cancel(self.backoff_event);
        sched.cancel(self.next_event);
        self.backoff_event = EventId::NONE;
        self.next_event = EventId::NONE;
    }

    fn has_work(&self) -> bool {
        match self.window.and_then(|w| w.peer()) {
            Some(peer) => {
                self.queue.has_frames_for(peer)
                    || self.low.stored_transmission(self.address, peer).is_some()
                    || self.pending_bars.iter().any(|(ra, _)| *ra == peer)
            }
            None => self.queue.has_frames() || self.low.stored_count() > 0 || !self.pending_bars.is_empty(),
        }
    }

    /// Wakes an idle channel access function when new work arrives
    fn kick(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        let idle = !sched.is_pending(self.backoff_event) && !sched.is_pending(self.next_event) && !self.low.is_busy(sched.now());
        if !idle {
            return;
        }
        match self.window {
            Some(AccessWindow::Cbap { .. }) => self.start_backoff(sched),
            Some(AccessWindow::ServicePeriod { .. }) => {
                self.next_event = sched.schedule(SimDuration::ZERO, TxopEvent::StartNext);
            }
            None => {}
        }
    }

    fn start_backoff(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        if !self.has_work() || sched.is_pending(self.backoff_event) {
            return;
        }
        let slots_left = match self.backoff_slots {
            Some(s) => s,
            None => {
                let s = self.rng.random_range(0..=self.cw);
                self.backoff_slots = Some(s);
                s
            }
        };
        let now = sched.now();
        let busy_end = self.carrier.busy_until().max(self.low.nav_end()).max(now);
        let delay = busy_end.since(now) + aifs() + slots(slots_left as u64);
        tracing::trace!(ts = %now, "{}: backoff {} slots, cw={}", self.address, slots_left, self.cw);
        self.backoff_event = sched.schedule(delay, TxopEvent::BackoffDone);
    }

    fn on_backoff_done(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        self.backoff_event = EventId::NONE;
        let now = sched.now();
        if self.carrier.is_busy(now) || self.low.is_nav_busy(now) || self.low.is_busy(now) {
            // Medium taken during the countdown, wait for it to clear again
            self.start_backoff(sched);
            return;
        }
        self.backoff_slots = None;
        self.transmit_next(sched);
    }


    /* Transmission */

    fn transmit_next(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        self.next_event = EventId::NONE;
        let Some(window) = self.window else {
            return;
        };
        let now = sched.now();
        if now >= window.end() || self.low.is_busy(now) {
            return;
        }
        let budget = window.end().since(now);

        let outcome = self.low.resume_transmission(&mut MappedScheduler::new(&mut *sched, TxopEvent::Low), window.peer(), budget);
        match outcome {
            ResumeOutcome::Resumed => {
                self.config.state_write().resumed_transmissions += 1;
                self.process_low_notifications(sched);
                return;
            }
            ResumeOutcome::Suspended => {
                self.process_low_notifications(sched);
                return;
            }
            ResumeOutcome::Expired | ResumeOutcome::NothingStored => self.process_low_notifications(sched),
        }

        if let Some(bar) = self.next_block_ack_request(window.peer()) {
            self.low.start_transmission(
                &mut MappedScheduler::new(&mut *sched, TxopEvent::Low),
                bar,
                TxParams { ack: AckType::BlockAck, ..Default::default() },
                &mut self.queue,
            );
            self.process_low_notifications(sched);
            return;
        }

        let expired = self.queue.remove_expired(now);
        if expired > 0 {
            self.config.state_write().dropped_msdus += expired as u64;
        }
        let next = match window.peer() {
            Some(peer) => self.queue.dequeue_for_receiver(now, peer),
            None => self.queue.dequeue_first(now),
        };
        let Some(mpdu) = next else {
            tracing::trace!(ts = %now, "{}: nothing to send", self.address);
            return;
        };
        let params = if mpdu.header.receiver.is_group() { TxParams::no_ack() } else { TxParams::default() };
        self.low.start_transmission(&mut MappedScheduler::new(&mut *sched, TxopEvent::Low), mpdu, params, &mut self.queue);
        self.process_low_notifications(sched);
    }

    fn next_block_ack_request(&mut self, peer: Option<MacAddr>) -> Option<Mpdu> {
        let idx = self.pending_bars.iter().position(|(ra, _)| peer.is_none_or(|p| p == *ra))?;
        let (ra, tid) = self.pending_bars.remove(idx)?;
        let starting_seq = self.queue.oldest_outstanding(ra, tid);
        let mut bar = Mpdu::control(FrameType::BlockAckReq, ra, self.address, 0);
        bar.header.tid = tid;
        bar.body = FrameBody::BlockAckReq { tid, starting_seq };
        tracing::debug!("{}: BAR to {} tid={} ssn={}", self.address, ra, tid, starting_seq);
        Some(bar)
    }

    /// Schedules the next step once a transaction finished
    fn continue_access(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        match self.window {
            Some(AccessWindow::ServicePeriod { .. }) => {
                if self.has_work() && !sched.is_pending(self.next_event) {
                    self.next_event = sched.schedule(SIFS, TxopEvent::StartNext);
                }
            }
            Some(AccessWindow::Cbap { .. }) => self.start_backoff(sched),
            None => {}
        }
    }

    fn on_success(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        self.cw = CW_MIN;
        self.continue_access(sched);
    }

    fn on_failure(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        self.cw = ((self.cw + 1) * 2 - 1).min(CW_MAX);
        self.continue_access(sched);
    }


    /* Outcomes */

    pub fn handle_event(&mut self, sched: &mut dyn EventScheduler<TxopEvent>, ev: TxopEvent) {
        match ev {
            TxopEvent::Low(ev) => {
                self.low.handle_event(&mut MappedScheduler::new(&mut *sched, TxopEvent::Low), ev);
                self.process_low_notifications(sched);
            }
            TxopEvent::BackoffDone => self.on_backoff_done(sched),
            TxopEvent::StartNext => self.transmit_next(sched),
        }
    }

    pub fn receive(&mut self, sched: &mut dyn EventScheduler<TxopEvent>, rx: RxPsdu) {
        self.low.receive(&mut MappedScheduler::new(&mut *sched, TxopEvent::Low), rx);
        self.process_low_notifications(sched);
    }

    fn process_low_notifications(&mut self, sched: &mut dyn EventScheduler<TxopEvent>) {
        loop {
            let notes = self.low.take_notifications();
            if notes.is_empty() {
                break;
            }
            for note in notes {
                self.handle_low_notification(sched, note);
            }
        }
    }

    fn handle_low_notification(&mut self, sched: &mut dyn EventScheduler<TxopEvent>, note: MacLowNotification) {
        let max_retries = self.config.config().mac.max_slrc;
        match note {
            MacLowNotification::GotAck { mpdu } => {
                self.record_success(mpdu.header.receiver, std::slice::from_ref(&mpdu));
                self.on_success(sched);
            }
            MacLowNotification::EndTxNoAck { mpdus } => {
                if let Some(first) = mpdus.first() {
                    self.record_success(first.header.receiver, &mpdus);
                }
                self.on_success(sched);
            }
            MacLowNotification::MissedAck { mut mpdu } => {
                let receiver = mpdu.header.receiver;
                mpdu.retries += 1;
                self.config.state_write().tx_failed_mpdus += 1;
                if self.low.station_manager().need_data_retransmission(receiver) {
                    self.queue.requeue(vec![mpdu]);
                } else {
                    self.low.station_manager_mut().report_final_data_failed(receiver);
                    self.drop_mpdus(receiver, vec![mpdu]);
                }
                self.on_failure(sched);
            }
            MacLowNotification::MissedCts { mpdus } => {
                let Some(receiver) = mpdus.first().map(|m| m.header.receiver) else {
                    return;
                };
                if self.low.station_manager().need_rts_retransmission(receiver) {
                    self.queue.requeue(mpdus);
                } else {
                    self.low.station_manager_mut().report_final_rts_failed(receiver);
                    self.drop_mpdus(receiver, mpdus);
                }
                self.on_failure(sched);
            }
            MacLowNotification::GotBlockAck { recipient, tid, acked, missed } => {
                if acked.is_empty() && missed.is_empty() {
                    self.bar_attempts.remove(&(recipient, tid));
                    self.on_success(sched);
                    return;
                }
                self.record_success(recipient, &acked);
                let any_missed = !missed.is_empty();
                self.retry_or_drop_subframes(recipient, tid, missed, max_retries);
                if any_missed && acked.is_empty() {
                    self.on_failure(sched);
                } else {
                    self.on_success(sched);
                }
            }
            MacLowNotification::MissedBlockAck { recipient, tid, mpdus } => {
                if mpdus.first().is_some_and(|m| m.header.frame_type == FrameType::BlockAckReq) {
                    let attempts = self.bar_attempts.entry((recipient, tid)).or_insert(0);
                    *attempts += 1;
                    if *attempts < max_retries {
                        self.pending_bars.push_front((recipient, tid));
                    } else {
                        tracing::info!("{}: giving up on BAR to {} tid={}", self.address, recipient, tid);
                        self.bar_attempts.remove(&(recipient, tid));
                    }
                } else {
                    self.config.state_write().tx_failed_mpdus += mpdus.len() as u64;
                    self.retry_or_drop_subframes(recipient, tid, mpdus, max_retries);
                }
                self.on_failure(sched);
            }
            MacLowNotification::TxSuspended { recipient } => {
                tracing::debug!(ts = %sched.now(), "{}: transmission to {} suspended", self.address, recipient);
                self.config.state_write().suspended_transmissions += 1;
            }
            MacLowNotification::TxCancelled { mpdus } => {
                let (bars, frames): (Vec<Mpdu>, Vec<Mpdu>) =
                    mpdus.into_iter().partition(|m| m.header.frame_type == FrameType::BlockAckReq);
                for bar in bars {
                    if let FrameBody::BlockAckReq { tid, .. } = bar.body {
                        self.pending_bars.push_front((bar.header.receiver, tid));
                    }
                }
                for mpdu in frames.into_iter().rev() {
                    self.queue.push_front(mpdu);
                }
            }
            MacLowNotification::StoredTransmissionExpired { recipient, mpdus, .. } => {
                tracing::debug!("{}: {} stored mpdus for {} expired", self.address, mpdus, recipient);
                self.config.state_write().dropped_msdus += mpdus as u64;
            }
            MacLowNotification::RxDeliver { from, msdu } => {
                self.notifications.push(TxopNotification::RxMsdu { from, msdu });
            }
            MacLowNotification::RxManagement { from, body } => {
                self.notifications.push(TxopNotification::RxManagement { from, body });
            }
            MacLowNotification::RxBeacon { from, body } => {
                self.notifications.push(TxopNotification::RxBeacon { from, body });
            }
        }
    }

    /// Block Ack retransmission policy: every MPDU keeps its own retry count.
    /// MPDUs over the limit are dropped and the recipient is told to move its
    /// window with a BAR.
    fn retry_or_drop_subframes(&mut self, recipient: MacAddr, tid: Tid, mpdus: Vec<Mpdu>, max_retries: u32) {
        let mut retry = Vec::new();
        let mut dropped = Vec::new();
        for mut mpdu in mpdus {
            mpdu.retries += 1;
            if mpdu.retries > max_retries {
                dropped.push(mpdu);
            } else {
                retry.push(mpdu);
            }
        }
        self.queue.requeue(retry);
        if !dropped.is_empty() {
            self.low.station_manager_mut().report_final_data_failed(recipient);
            self.drop_mpdus(recipient, dropped);
            if !self.pending_bars.contains(&(recipient, tid)) {
                self.pending_bars.push_back((recipient, tid));
            }
        }
    }

    fn record_success(&mut self, receiver: MacAddr, mpdus: &[Mpdu]) {
        let msdus: usize = mpdus.iter().map(|m| m.msdus().len()).sum();
        let data_mpdus = mpdus.iter().filter(|m| m.header.is_qos_data()).count();
        if data_mpdus > 0 {
            self.config.state_write().tx_mpdus += data_mpdus as u64;
        }
        if msdus > 0 {
            self.notifications.push(TxopNotification::Acked { receiver, msdus });
        }
    }

    fn drop_mpdus(&mut self, receiver: MacAddr, mpdus: Vec<Mpdu>) {
        let msdus: Vec<Msdu> = mpdus.into_iter().flat_map(|m| m.into_msdus()).collect();
        tracing::debug!("{}: dropping {} msdus for {}", self.address, msdus.len(), receiver);
        self.config.state_write().dropped_msdus += msdus.len() as u64;
        if !msdus.is_empty() {
            self.notifications.push(TxopNotification::Dropped { receiver, msdus });
        }
    }
}


#[cfg(test)]
mod tests {
    use crossbeam_channel::{Receiver, unbounded};
    use dmg_config::{CfgMac, SimConfig};
    use dmg_core::{DmgMcs, EventQueue, debug};

    use super::*;
    use crate::aggregation::MsduAggregator;
    use crate::mac_queue::MacQueue;
    use crate::phy::{AirFrame, ChannelPhy};
    use crate::station_manager::ConstantRateManager;

    fn txop(mac: CfgMac) -> (Txop, Receiver<AirFrame>, SharedConfig) {
        let config = SharedConfig::from_config(SimConfig { mac: mac.clone(), ..Default::default() });
        let (tx, rx) = unbounded();
        let address = MacAddr::from_index(1);
        let mcs = DmgMcs::from_index(12).unwrap();
        let low = MacLow::new(address, Box::new(ChannelPhy::new(address, tx)), Box::new(ConstantRateManager::new(mcs, &mac)), &mac);
        let queue = TxQueue::new(
            address,
            MacQueue::new(SimDuration::from_micros(mac.msdu_lifetime_us), 1000),
            MsduAggregator::new(mac.max_amsdu_size),
        );
        (Txop::new(low, queue, config.clone(), CarrierSense::new()), rx, config)
    }

    fn msdu(uid: u64) -> Msdu {
        Msdu {
            uid,
            size: 1448,
            source: MacAddr::from_index(1),
            destination: MacAddr::from_index(0),
            tid: 0,
            created: SimTime::ZERO,
            enqueued: SimTime::ZERO,
        }
    }

    /// Runs the queue, feeding nothing back: every frame goes unanswered
    fn run_silent(t: &mut Txop, q: &mut EventQueue<TxopEvent>, until: SimTime) {
        while let Some(at) = q.peek_time() {
            if at > until {
                break;
            }
            let (_, ev) = q.pop_next().unwrap();
            t.handle_event(q, ev);
        }
    }

    #[test]
    fn test_no_transmission_outside_a_window() {
        debug::setup_logging_verbose();
        let (mut t, air, _) = txop(CfgMac::default());
        let mut q = EventQueue::new();
        assert!(t.enqueue(&mut q, msdu(1)));
        run_silent(&mut t, &mut q, SimTime::ZERO + SimDuration::from_millis(1));
        assert!(air.try_recv().is_err());
    }

    #[test]
    fn test_service_period_sends_immediately_to_peer() {
        debug::setup_logging_verbose();
        let (mut t, air, _) = txop(CfgMac::default());
        let mut q = EventQueue::new();
        t.enqueue(&mut q, msdu(1));
        let ap = MacAddr::from_index(0);
        t.start_access(&mut q, AccessWindow::ServicePeriod { peer: ap, end: SimTime::ZERO + SimDuration::from_millis(1) });
        let frame = air.try_recv().expect("no backoff inside an SP");
        assert_eq!(frame.psdu.mpdus[0].header.receiver, ap);
    }

    #[test]
    fn test_unanswered_frame_is_retried_then_dropped() {
        debug::setup_logging_verbose();
        let (mut t, air, config) = txop(CfgMac { max_slrc: 3, ..Default::default() });
        let mut q = EventQueue::new();
        t.enqueue(&mut q, msdu(1));
        t.start_access(&mut q, AccessWindow::Cbap { end: SimTime::ZERO + SimDuration::from_millis(50) });
        run_silent(&mut t, &mut q, SimTime::ZERO + SimDuration::from_millis(50));

        assert_eq!(air.try_iter().count(), 3, "one try plus two retries");
        let dropped: usize = t
            .take_notifications()
            .into_iter()
            .filter_map(|n| match n {
                TxopNotification::Dropped { msdus, .. } => Some(msdus.len()),
                _ => None,
            })
            .sum();
        assert_eq!(dropped, 1);
        let state = config.state_read();
        assert_eq!(state.tx_failed_mpdus, 3);
        assert_eq!(state.dropped_msdus, 1);
        assert!(!t.queue().has_frames());
    }

    #[test]
    fn test_window_end_parks_pending_transaction() {
        debug::setup_logging_verbose();
        let (mut t, air, config) = txop(CfgMac::default());
        let mut q = EventQueue::new();
        let ap = MacAddr::from_index(0);
        t.enqueue(&mut q, msdu(1));

        // Far too short for a data frame plus its ACK
        t.start_access(&mut q, AccessWindow::ServicePeriod { peer: ap, end: SimTime::ZERO + SimDuration::from_micros(3) });
        assert!(air.try_recv().is_err());
        assert!(t.low().stored_transmission(MacAddr::from_index(1), ap).is_some());
        assert_eq!(config.state_read().suspended_transmissions, 1);
        t.end_access(&mut q);

        t.start_access(&mut q, AccessWindow::ServicePeriod { peer: ap, end: SimTime::ZERO + SimDuration::from_millis(2) });
        assert!(air.try_recv().is_ok(), "resumed in the next SP");
        assert_eq!(config.state_read().resumed_transmissions, 1);
        assert_eq!(t.low().stored_count(), 0);
    }
}
