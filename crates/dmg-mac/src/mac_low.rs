//! Frame exchange engine.
//!
//! MacLow runs one transaction at a time: RTS/CTS when protection is needed,
//! then a single MPDU or an A-MPDU, then the ACK or Block Ack wait. Every
//! transaction is sized against the time left in the running allocation. A
//! transaction that does not fit is parked in a table keyed by
//! (transmitter, receiver) and picked up again when that flow's next
//! allocation starts.
//!
//! Outcomes are queued as [`MacLowNotification`]s and drained by the owner
//! after every call.

use std::collections::{BTreeMap, HashMap, VecDeque};

use dmg_config::CfgMac;
use dmg_core::{
    EventId, EventScheduler, MacAddr, PIFS, SBIFS, SIFS, SLOT_TIME, SimDuration, SimTime, Tid, seq_in_window,
};

use crate::aggregation::MpduAggregator;
use crate::block_ack::{BlockAckAgreement, ReorderBuffer};
use crate::frame::{
    ACK_LEN, AckPolicy, BLOCK_ACK_LEN, BlockAckInfo, CTS_LEN, FrameBody, FrameType, Mpdu, Msdu, Psdu, RTS_LEN,
};
use crate::mac_queue::TxQueue;
use crate::phy::{DmgPhy, RxPsdu};
use crate::station_manager::RemoteStationManager;
use crate::tx_params::{AckType, TxParams, TxVector};

/// Longest value the Duration/ID field carries
const MAX_DURATION_ID_US: u64 = 32_767;


/// Timers and deferred responses of MacLow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacLowEvent {
    CtsTimeout,
    AckTimeout,
    BlockAckTimeout,
    SendCts { to: MacAddr, duration_us: u16 },
    SendAck { to: MacAddr, duration_us: u16 },
    SendBlockAck { to: MacAddr, info: BlockAckInfo },
    SendDataAfterCts,
    EndTxNoAck,
}

#[derive(Debug, Clone)]
pub enum MacLowNotification {
    GotAck { mpdu: Mpdu },
    MissedAck { mpdu: Mpdu },
    /// RTS went unanswered; carries every MPDU of the protected PSDU
    MissedCts { mpdus: Vec<Mpdu> },
    /// `acked` and `missed` are empty when the Block Ack answered a BAR
    GotBlockAck { recipient: MacAddr, tid: Tid, acked: Vec<Mpdu>, missed: Vec<Mpdu> },
    MissedBlockAck { recipient: MacAddr, tid: Tid, mpdus: Vec<Mpdu> },
    EndTxNoAck { mpdus: Vec<Mpdu> },
    /// The transaction did not fit in the allocation and was parked
    TxSuspended { recipient: MacAddr },
    /// A transaction was aborted before completing; the MPDUs go back to the owner
    TxCancelled { mpdus: Vec<Mpdu> },
    /// A parked transaction aged out before its flow got the medium again
    StoredTransmissionExpired { recipient: MacAddr, tid: Tid, mpdus: usize },
    RxDeliver { from: MacAddr, msdu: Msdu },
    RxManagement { from: MacAddr, body: Vec<u8> },
    RxBeacon { from: MacAddr, body: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    NothingStored,
    Resumed,
    /// Still does not fit, parked again
    Suspended,
    Expired,
}


/// The transaction MacLow currently owns. `mpdu` is the first MPDU of the
/// PSDU; the other A-MPDU subframes live in the aggregate queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub mpdu: Mpdu,
    pub params: TxParams,
    pub tx_vector: TxVector,
    pub is_ampdu: bool,
}

/// Snapshot of a transaction that outlived its allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendedTransmission {
    pub transaction: Transaction,
    pub aggregate_queue: VecDeque<Mpdu>,
}

impl SuspendedTransmission {
    pub fn len(&self) -> usize {
        1 + self.aggregate_queue.len()
    }

    pub fn into_mpdus(self) -> Vec<Mpdu> {
        let mut mpdus = vec![self.transaction.mpdu];
        mpdus.extend(self.aggregate_queue);
        mpdus
    }

    /// True when this is an A-MPDU and every subframe aged out of the queue
    pub fn has_expired(&self, now: SimTime, lifetime: SimDuration) -> bool {
        self.transaction.mpdu.is_expired(now, lifetime)
            && self.aggregate_queue.iter().all(|m| m.is_expired(now, lifetime))
    }

    /// Drops aged-out subframes. Returns false when nothing is left to send.
    fn prune_expired(&mut self, now: SimTime, lifetime: SimDuration) -> bool {
        self.aggregate_queue.retain(|m| !m.is_expired(now, lifetime));
        if self.transaction.mpdu.is_expired(now, lifetime) {
            match self.aggregate_queue.pop_front() {
                Some(next) => self.transaction.mpdu = next,
                None => return false,
            }
        }
        if self.transaction.is_ampdu && self.aggregate_queue.is_empty() {
            // One subframe left, it goes out as a plain MPDU
            self.transaction.is_ampdu = false;
            self.transaction.params.ack = AckType::Normal;
            self.transaction.tx_vector.aggregation = false;
        }
        true
    }
}


struct RecipientAgreement {
    agreement: BlockAckAgreement,
    buffer: ReorderBuffer,
}

#[derive(Default)]
struct Timers {
    cts_timeout: EventId,
    ack_timeout: EventId,
    block_ack_timeout: EventId,
    send_cts: EventId,
    send_ack: EventId,
    send_block_ack: EventId,
    send_data: EventId,
    end_tx_no_ack: EventId,
}

impl Timers {
    fn all(&self) -> [EventId; 8] {
        [
            self.cts_timeout,
            self.ack_timeout,
            self.block_ack_timeout,
            self.send_cts,
            self.send_ack,
            self.send_block_ack,
            self.send_data,
            self.end_tx_no_ack,
        ]
    }
}


pub struct MacLow {
    address: MacAddr,
    phy: Box<dyn DmgPhy>,
    station_manager: Box<dyn RemoteStationManager>,
    mpdu_aggregator: MpduAggregator,
    lifetime: SimDuration,

    current: Option<Transaction>,
    aggregate_queue: VecDeque<Mpdu>,
    stored: BTreeMap<(MacAddr, MacAddr), SuspendedTransmission>,
    transmission_suspended: bool,

    originators: HashMap<(MacAddr, Tid), BlockAckAgreement>,
    recipients: HashMap<(MacAddr, Tid), RecipientAgreement>,
    /// Last sequence number seen per flow outside Block Ack, for duplicate filtering
    last_rx_seq: HashMap<(MacAddr, Tid), u16>,

    nav_end: SimTime,
    /// End of our own transmission or of a scheduled response
    busy_until: SimTime,
    allocation_end: Option<SimTime>,
    timers: Timers,
    notifications: Vec<MacLowNotification>,
}

impl MacLow {
    pub fn new(
        address: MacAddr,
        phy: Box<dyn DmgPhy>,
        station_manager: Box<dyn RemoteStationManager>,
        cfg: &CfgMac,
    ) -> Self {
        MacLow {
            address,
            phy,
            station_manager,
            mpdu_aggregator: MpduAggregator::new(cfg.max_ampdu_size),
            lifetime: SimDuration::from_micros(cfg.msdu_lifetime_us),
            current: None,
            aggregate_queue: VecDeque::new(),
            stored: BTreeMap::new(),
            transmission_suspended: false,
            originators: HashMap::new(),
            recipients: HashMap::new(),
            last_rx_seq: HashMap::new(),
            nav_end: SimTime::ZERO,
            busy_until: SimTime::ZERO,
            allocation_end: None,
            timers: Timers::default(),
            notifications: Vec::new(),
        }
    }

    pub fn address(&self) -> MacAddr {
        self.address
    }

    pub fn station_manager(&self) -> &dyn RemoteStationManager {
        self.station_manager.as_ref()
    }

    pub fn station_manager_mut(&mut self) -> &mut dyn RemoteStationManager {
        self.station_manager.as_mut()
    }

    pub fn take_notifications(&mut self) -> Vec<MacLowNotification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn current_transaction(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    pub fn is_transmission_suspended(&self) -> bool {
        self.transmission_suspended
    }

    /// Owning a transaction, transmitting, or about to answer a frame
    pub fn is_busy(&self, now: SimTime) -> bool {
        self.current.is_some() || now < self.busy_until
    }

    pub fn is_nav_busy(&self, now: SimTime) -> bool {
        now < self.nav_end
    }

    pub fn nav_end(&self) -> SimTime {
        self.nav_end
    }

    /// Bounds every transaction started from now on; `None` lifts the bound
    pub fn set_allocation_end(&mut self, end: Option<SimTime>) {
        self.allocation_end = end;
    }

    pub fn stored_transmission(&self, src: MacAddr, dst: MacAddr) -> Option<&SuspendedTransmission> {
        self.stored.get(&(src, dst))
    }

    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }

    pub fn has_stored_ampdu_expired(&self, src: MacAddr, dst: MacAddr, now: SimTime) -> bool {
        self.stored
            .get(&(src, dst))
            .is_some_and(|s| s.transaction.is_ampdu && s.has_expired(now, self.lifetime))
    }

    /// Forgets the parked transaction of a flow and hands it back
    pub fn remove_current_allocation(&mut self, src: MacAddr, dst: MacAddr) -> Option<SuspendedTransmission> {
        self.stored.remove(&(src, dst))
    }


    /* Block Ack agreements */

    pub fn create_originator_agreement(&mut self, peer: MacAddr, tid: Tid, buffer_size: u16, timeout_units: u16, starting_seq: u16, now: SimTime) {
        tracing::debug!("Block Ack originator agreement with {} tid={} win={}", peer, tid, buffer_size);
        let agreement = BlockAckAgreement::new(peer, tid, buffer_size, timeout_units, starting_seq, now);
        self.originators.insert((peer, tid), agreement);
    }

    pub fn create_recipient_agreement(&mut self, peer: MacAddr, tid: Tid, buffer_size: u16, timeout_units: u16, starting_seq: u16, now: SimTime) {
        tracing::debug!("Block Ack recipient agreement with {} tid={} win={}", peer, tid, buffer_size);
        let agreement = BlockAckAgreement::new(peer, tid, buffer_size, timeout_units, starting_seq, now);
        let buffer = ReorderBuffer::new(starting_seq, agreement.buffer_size);
        self.recipients.insert((peer, tid), RecipientAgreement { agreement, buffer });
    }

    pub fn has_originator_agreement(&self, peer: MacAddr, tid: Tid) -> bool {
        self.originators.contains_key(&(peer, tid))
    }

    pub fn has_recipient_agreement(&self, peer: MacAddr, tid: Tid) -> bool {
        self.recipients.contains_key(&(peer, tid))
    }

    /// MPDUs the reorder buffer accepted from `peer`, duplicates excluded
    pub fn recipient_total_received(&self, peer: MacAddr, tid: Tid) -> Option<u64> {
        self.recipients.get(&(peer, tid)).map(|r| r.buffer.total_received())
    }

    /// Tears down agreements idle for longer than their timeout. Buffered
    /// MPDUs of a recipient agreement are released first.
    pub fn expire_agreements(&mut self, now: SimTime) {
        self.originators.retain(|key, ba| {
            let expired = ba.is_expired(now);
            if expired {
                tracing::info!(ts = %now, "originator agreement {} tid={} timed out", key.0, key.1);
            }
            !expired
        });
        let expired: Vec<_> = self
            .recipients
            .iter()
            .filter(|(_, r)| r.agreement.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(mut rec) = self.recipients.remove(&key) {
                tracing::info!(ts = %now, "recipient agreement {} tid={} timed out", key.0, key.1);
                let end = dmg_core::seq_add(rec.buffer.win_start(), rec.agreement.buffer_size);
                let released = rec.buffer.flush_before(end);
                self.forward_up(key.0, released);
            }
        }
    }


    /* Duration arithmetic */

    fn response_duration(&self, receiver: MacAddr, ack: AckType) -> SimDuration {
        let control = self.station_manager.dmg_control_tx_vector(receiver);
        match ack {
            AckType::None => SimDuration::ZERO,
            AckType::Normal => SIFS + self.phy.calculate_tx_duration(ACK_LEN, &control),
            AckType::Fast | AckType::SuperFast => PIFS,
            AckType::BlockAck => SIFS + self.phy.calculate_tx_duration(BLOCK_ACK_LEN, &control),
        }
    }

    /// RTS, CTS and the two SIFS around the CTS
    fn protection_duration(&self, receiver: MacAddr) -> SimDuration {
        let rts_vector = self.station_manager.rts_tx_vector(receiver);
        let control = self.station_manager.dmg_control_tx_vector(receiver);
        self.phy.calculate_tx_duration(RTS_LEN, &rts_vector)
            + SIFS
            + self.phy.calculate_tx_duration(CTS_LEN, &control)
            + SIFS
    }

    /// Airtime of the data PSDU plus the expected response, rounded up to
    /// whole microseconds as Duration/ID fields are.
    pub fn calculate_dmg_transaction_duration(&self, receiver: MacAddr, data_duration: SimDuration, params: &TxParams) -> SimDuration {
        let mut total = data_duration + self.response_duration(receiver, params.ack);
        if params.rts {
            total += self.protection_duration(receiver);
        }
        total.ceil_to_micros()
    }

    fn psdu_size(&self, tr: &Transaction) -> u32 {
        if tr.is_ampdu {
            MpduAggregator::ampdu_size(
                std::iter::once(tr.mpdu.size()).chain(self.aggregate_queue.iter().map(|m| m.size())),
            )
        } else {
            tr.mpdu.size()
        }
    }

    fn current_transaction_duration(&self) -> Option<SimDuration> {
        let tr = self.current.as_ref()?;
        let data = self.phy.calculate_tx_duration(self.psdu_size(tr), &tr.tx_vector);
        Some(self.calculate_dmg_transaction_duration(tr.mpdu.header.receiver, data, &tr.params))
    }

    fn remaining_allocation(&self, now: SimTime) -> Option<SimDuration> {
        self.allocation_end.map(|end| end.since(now))
    }


    /* Transmission */

    /// Takes ownership of the medium for `mpdu`, growing it into an A-MPDU
    /// from `queue` when a Block Ack agreement allows. A transaction longer
    /// than the allocation budget is parked instead and nothing is sent.
    pub fn start_transmission(
        &mut self,
        sched: &mut dyn EventScheduler<MacLowEvent>,
        mpdu: Mpdu,
        mut params: TxParams,
        queue: &mut TxQueue,
    ) {
        self.cancel_all_events(sched);
        self.transmission_suspended = false;

        let now = sched.now();
        let receiver = mpdu.header.receiver;
        let control = mpdu.header.frame_type.is_control();
        let mut tx_vector = if control {
            self.station_manager.dmg_control_tx_vector(receiver)
        } else {
            self.station_manager.data_tx_vector(receiver)
        };
        params.rts = !control && (params.rts || self.station_manager.need_rts(receiver, mpdu.size()));
        if let Some(remaining) = self.remaining_allocation(now) {
            params.max_transmission_duration = Some(params.max_transmission_duration.map_or(remaining, |m| m.min(remaining)));
        }

        let mut aggregate = VecDeque::new();
        let mut is_ampdu = false;
        if mpdu.header.is_qos_data() && params.ack != AckType::None && !receiver.is_group() {
            let window = self.originators.get(&(receiver, mpdu.header.tid)).map(|ba| ba.buffer_size);
            if let Some(win_size) = window {
                let mut ampdu_vector = tx_vector;
                ampdu_vector.aggregation = true;
                aggregate = self.aggregate_to_ampdu(now, &mpdu, &params, &ampdu_vector, win_size, queue);
                if !aggregate.is_empty() {
                    is_ampdu = true;
                    params.ack = AckType::BlockAck;
                    tx_vector = ampdu_vector;
                }
            }
        }

        tracing::debug!(ts = %now, "start tx {} ampdu={} subframes={} rts={}", mpdu, is_ampdu, aggregate.len() + 1, params.rts);
        self.current = Some(Transaction { mpdu, params, tx_vector, is_ampdu });
        self.aggregate_queue = aggregate;

        if let (Some(max), Some(needed)) = (params.max_transmission_duration, self.current_transaction_duration()) {
            if needed > max {
                tracing::debug!(ts = %now, "transaction needs {} but only {} left, suspending", needed, max);
                self.store_allocation_parameters(sched);
                self.transmission_suspended = true;
                self.notifications.push(MacLowNotification::TxSuspended { recipient: receiver });
                return;
            }
        }

        if params.rts {
            self.send_rts(sched);
        } else {
            self.send_data_packet(sched);
        }
    }

    /// Greedily appends MPDUs of the same flow behind `first` until
    /// [`Self::stop_mpdu_aggregation`] says otherwise. The rejected candidate
    /// goes back to the queue.
    fn aggregate_to_ampdu(
        &self,
        now: SimTime,
        first: &Mpdu,
        params: &TxParams,
        tx_vector: &TxVector,
        win_size: u16,
        queue: &mut TxQueue,
    ) -> VecDeque<Mpdu> {
        let (receiver, tid) = (first.header.receiver, first.header.tid);
        let mut sizes = vec![first.size()];
        let mut subframes = VecDeque::new();
        if !self.mpdu_aggregator.is_enabled() {
            return subframes;
        }

        while let Some(candidate) = queue.dequeue_for(now, receiver, tid) {
            let in_window = seq_in_window(first.header.seq, candidate.header.seq, win_size);
            if !in_window || self.stop_mpdu_aggregation(&candidate, &sizes, params, tx_vector) {
                queue.push_front(candidate);
                break;
            }
            sizes.push(candidate.size());
            subframes.push_back(candidate);
        }
        subframes
    }

    /// True when `candidate` must not join the A-MPDU: the transaction would
    /// overrun the budget, the PPDU would exceed aPPDUMaxTime, or the
    /// aggregator caps are reached.
    pub fn stop_mpdu_aggregation(&self, candidate: &Mpdu, sizes: &[u32], params: &TxParams, tx_vector: &TxVector) -> bool {
        let current = MpduAggregator::ampdu_size(sizes.iter().copied());
        let grown = MpduAggregator::ampdu_size(sizes.iter().copied().chain(std::iter::once(candidate.size())));
        let ppdu = self.phy.calculate_tx_duration(grown, tx_vector);

        if let Some(max) = params.max_transmission_duration {
            let mut ba_params = *params;
            ba_params.ack = AckType::BlockAck;
            let transaction = self.calculate_dmg_transaction_duration(candidate.header.receiver, ppdu, &ba_params);
            if transaction > max {
                tracing::trace!("aggregation stops: transaction {} > {}", transaction, max);
                return true;
            }
        }
        if ppdu > self.phy.ppdu_max_time(tx_vector) {
            tracing::trace!("aggregation stops: ppdu {} too long", ppdu);
            return true;
        }
        if !self.mpdu_aggregator.can_add(current, sizes.len(), candidate.size()) {
            tracing::trace!("aggregation stops: aggregator full at {} octets", current);
            return true;
        }
        false
    }

    fn send_rts(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>) {
        let Some(tr) = self.current.as_ref() else {
            return;
        };
        let receiver = tr.mpdu.header.receiver;
        let control = self.station_manager.dmg_control_tx_vector(receiver);
        let rts_vector = self.station_manager.rts_tx_vector(receiver);

        let data = self.phy.calculate_tx_duration(self.psdu_size(tr), &tr.tx_vector);
        let cts = self.phy.calculate_tx_duration(CTS_LEN, &control);
        let nav = SIFS + cts + SIFS + data + self.response_duration(receiver, tr.params.ack);

        let rts = Mpdu::control(FrameType::Rts, receiver, self.address, duration_id(nav));
        let rts_duration = self.phy.calculate_tx_duration(RTS_LEN, &rts_vector);
        let now = sched.now();
        tracing::trace!(ts = %now, "tx RTS to {}, nav {}", receiver, nav);

        self.timers.cts_timeout = sched.schedule(rts_duration + SIFS + SLOT_TIME + cts, MacLowEvent::CtsTimeout);
        self.busy_until = now + rts_duration;
        self.phy.send_packet(Psdu::single(rts), rts_vector, rts_duration);
    }

    fn send_data_packet(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>) {
        let Some(tr) = self.current.as_ref() else {
            return;
        };
        let receiver = tr.mpdu.header.receiver;
        let response = self.response_duration(receiver, tr.params.ack);
        let duration_us = if receiver.is_group() { 0 } else { duration_id(response) };

        let mut mpdus: Vec<Mpdu> = std::iter::once(&tr.mpdu).chain(self.aggregate_queue.iter()).cloned().collect();
        for mpdu in mpdus.iter_mut() {
            mpdu.header.duration_us = duration_us;
            if tr.params.ack == AckType::None && mpdu.header.is_qos_data() {
                mpdu.header.ack_policy = AckPolicy::NoAck;
            }
        }
        let psdu = Psdu { mpdus, is_ampdu: tr.is_ampdu };
        let tx_vector = tr.tx_vector;
        let ack = tr.params.ack;
        let data = self.phy.calculate_tx_duration(psdu.size(), &tx_vector);

        let now = sched.now();
        tracing::trace!(ts = %now, "tx data to {}: {} mpdus, {} octets, {}", receiver, psdu.mpdus.len(), psdu.size(), data);
        self.start_data_tx_timers(sched, receiver, ack, data);
        self.busy_until = now + data;
        self.phy.send_packet(psdu, tx_vector, data);
    }

    fn start_data_tx_timers(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>, receiver: MacAddr, ack: AckType, data: SimDuration) {
        let control = self.station_manager.dmg_control_tx_vector(receiver);
        let ack_duration = self.phy.calculate_tx_duration(ACK_LEN, &control);
        match ack {
            AckType::None => {
                self.timers.end_tx_no_ack = sched.schedule(data, MacLowEvent::EndTxNoAck);
            }
            AckType::Normal => {
                self.timers.ack_timeout = sched.schedule(data + SIFS + SLOT_TIME + ack_duration, MacLowEvent::AckTimeout);
            }
            AckType::Fast => {
                self.timers.ack_timeout = sched.schedule(data + PIFS + ack_duration, MacLowEvent::AckTimeout);
            }
            AckType::SuperFast => {
                self.timers.ack_timeout = sched.schedule(data + SIFS + SBIFS + ack_duration, MacLowEvent::AckTimeout);
            }
            AckType::BlockAck => {
                let ba = self.phy.calculate_tx_duration(BLOCK_ACK_LEN, &control);
                self.timers.block_ack_timeout = sched.schedule(data + SIFS + SLOT_TIME + ba, MacLowEvent::BlockAckTimeout);
            }
        }
    }

    fn send_control(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>, mpdu: Mpdu) {
        let control = self.station_manager.dmg_control_tx_vector(mpdu.header.receiver);
        let duration = self.phy.calculate_tx_duration(mpdu.size(), &control);
        tracing::trace!(ts = %sched.now(), "tx {}", mpdu);
        self.busy_until = self.busy_until.max(sched.now() + duration);
        self.phy.send_packet(Psdu::single(mpdu), control, duration);
    }

    /// Marks the node busy until a response scheduled after SIFS has gone out
    fn reserve_response(&mut self, now: SimTime, frame_len: u32, to: MacAddr) {
        let control = self.station_manager.dmg_control_tx_vector(to);
        let end = now + SIFS + self.phy.calculate_tx_duration(frame_len, &control);
        self.busy_until = self.busy_until.max(end);
    }


    /* Suspension */

    /// Parks the current transaction, aggregate queue included, under its
    /// (transmitter, receiver) pair. Called when a transaction does not fit
    /// and by the MAC when an allocation ends.
    pub fn store_allocation_parameters(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>) {
        self.cancel_timers(sched);
        let Some(transaction) = self.current.take() else {
            tracing::trace!("no transaction to store");
            return;
        };
        let aggregate_queue = std::mem::take(&mut self.aggregate_queue);
        if transaction.mpdu.header.frame_type.is_control() {
            tracing::debug!("not storing control frame {}", transaction.mpdu);
            self.notifications.push(MacLowNotification::TxCancelled { mpdus: vec![transaction.mpdu] });
            return;
        }

        let key = (self.address, transaction.mpdu.header.receiver);
        tracing::debug!(
            ts = %sched.now(),
            "storing {} ampdu={} with {} queued subframes for {}",
            transaction.mpdu,
            transaction.is_ampdu,
            aggregate_queue.len(),
            key.1
        );
        let entry = SuspendedTransmission { transaction, aggregate_queue };
        if let Some(old) = self.stored.insert(key, entry) {
            tracing::warn!("replacing stored transmission for {}", key.1);
            self.notifications.push(MacLowNotification::TxCancelled { mpdus: old.into_mpdus() });
        }
    }

    /// Picks up the parked transaction of the flow towards `receiver`, or the
    /// first one of ours when `receiver` is `None` (broadcast CBAP), and
    /// retries it with `duration` as the new budget.
    pub fn resume_transmission(
        &mut self,
        sched: &mut dyn EventScheduler<MacLowEvent>,
        receiver: Option<MacAddr>,
        duration: SimDuration,
    ) -> ResumeOutcome {
        self.transmission_suspended = false;
        let key = match receiver {
            Some(r) => (self.address, r),
            None => match self.stored.keys().find(|(src, _)| *src == self.address) {
                Some(key) => *key,
                None => return ResumeOutcome::NothingStored,
            },
        };
        let now = sched.now();

        if self.has_stored_ampdu_expired(key.0, key.1, now) {
            if let Some(stale) = self.remove_current_allocation(key.0, key.1) {
                let tid = stale.transaction.mpdu.header.tid;
                tracing::debug!(ts = %now, "stored A-MPDU for {} expired, dropping {} mpdus", key.1, stale.len());
                self.notifications.push(MacLowNotification::StoredTransmissionExpired { recipient: key.1, tid, mpdus: stale.len() });
            }
            return ResumeOutcome::Expired;
        }
        let Some(mut entry) = self.stored.remove(&key) else {
            return ResumeOutcome::NothingStored;
        };
        let before = entry.len();
        let tid = entry.transaction.mpdu.header.tid;
        if !entry.prune_expired(now, self.lifetime) {
            tracing::debug!(ts = %now, "stored transmission for {} expired", key.1);
            self.notifications.push(MacLowNotification::StoredTransmissionExpired { recipient: key.1, tid, mpdus: before });
            return ResumeOutcome::Expired;
        }

        self.cancel_timers(sched);
        let SuspendedTransmission { mut transaction, aggregate_queue } = entry;
        transaction.params.max_transmission_duration = Some(duration);
        tracing::debug!(ts = %now, "resuming {} for {} with {} budget", transaction.mpdu, key.1, duration);
        let rts = transaction.params.rts;
        self.current = Some(transaction);
        self.aggregate_queue = aggregate_queue;

        match self.current_transaction_duration() {
            Some(needed) if needed <= duration => {
                if rts {
                    self.send_rts(sched);
                } else {
                    self.send_data_packet(sched);
                }
                ResumeOutcome::Resumed
            }
            _ => {
                tracing::debug!(ts = %now, "still not enough time for {}", key.1);
                self.store_allocation_parameters(sched);
                self.transmission_suspended = true;
                ResumeOutcome::Suspended
            }
        }
    }

    fn cancel_timers(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>) {
        for id in self.timers.all() {
            sched.cancel(id);
        }
        self.timers = Timers::default();
    }

    /// Aborts everything in flight. The MPDUs of an interrupted transaction
    /// are handed back through `TxCancelled`; calling this again is a no-op.
    pub fn cancel_all_events(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>) {
        self.cancel_timers(sched);
        if let Some(tr) = self.current.take() {
            tracing::debug!(ts = %sched.now(), "cancelling transaction {}", tr.mpdu);
            let mut mpdus = vec![tr.mpdu];
            mpdus.extend(self.aggregate_queue.drain(..));
            self.notifications.push(MacLowNotification::TxCancelled { mpdus });
        }
    }


    /* Timers */

    pub fn handle_event(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>, ev: MacLowEvent) {
        match ev {
            MacLowEvent::CtsTimeout => {
                self.timers.cts_timeout = EventId::NONE;
                self.cts_timeout(sched.now());
            }
            MacLowEvent::AckTimeout => {
                self.timers.ack_timeout = EventId::NONE;
                self.normal_ack_timeout(sched.now());
            }
            MacLowEvent::BlockAckTimeout => {
                self.timers.block_ack_timeout = EventId::NONE;
                self.block_ack_timeout(sched.now());
            }
            MacLowEvent::SendCts { to, duration_us } => {
                self.timers.send_cts = EventId::NONE;
                self.send_control(sched, Mpdu::control(FrameType::Cts, to, self.address, duration_us));
            }
            MacLowEvent::SendAck { to, duration_us } => {
                self.timers.send_ack = EventId::NONE;
                self.send_control(sched, Mpdu::control(FrameType::Ack, to, self.address, duration_us));
            }
            MacLowEvent::SendBlockAck { to, info } => {
                self.timers.send_block_ack = EventId::NONE;
                let mut ba = Mpdu::control(FrameType::BlockAck, to, self.address, 0);
                ba.header.tid = info.tid;
                ba.body = FrameBody::BlockAck(info);
                self.send_control(sched, ba);
            }
            MacLowEvent::SendDataAfterCts => {
                self.timers.send_data = EventId::NONE;
                self.send_data_packet(sched);
            }
            MacLowEvent::EndTxNoAck => {
                self.timers.end_tx_no_ack = EventId::NONE;
                if let Some(tr) = self.current.take() {
                    let mut mpdus = vec![tr.mpdu];
                    mpdus.extend(self.aggregate_queue.drain(..));
                    self.notifications.push(MacLowNotification::EndTxNoAck { mpdus });
                }
            }
        }
    }

    fn cts_timeout(&mut self, now: SimTime) {
        let Some(tr) = self.current.take() else {
            return;
        };
        let receiver = tr.mpdu.header.receiver;
        tracing::debug!(ts = %now, "CTS timeout for {}", receiver);
        self.station_manager.report_rts_failed(receiver);
        let mut mpdus = vec![tr.mpdu];
        mpdus.extend(self.aggregate_queue.drain(..));
        self.notifications.push(MacLowNotification::MissedCts { mpdus });
    }

    fn normal_ack_timeout(&mut self, now: SimTime) {
        let Some(tr) = self.current.take() else {
            return;
        };
        tracing::debug!(ts = %now, "ACK timeout for {}", tr.mpdu);
        self.station_manager.report_data_failed(tr.mpdu.header.receiver);
        self.aggregate_queue.clear();
        self.notifications.push(MacLowNotification::MissedAck { mpdu: tr.mpdu });
    }

    fn block_ack_timeout(&mut self, now: SimTime) {
        let Some(tr) = self.current.take() else {
            return;
        };
        let recipient = tr.mpdu.header.receiver;
        let tid = block_ack_tid(&tr.mpdu);
        tracing::debug!(ts = %now, "Block Ack timeout for {} tid={}", recipient, tid);
        self.station_manager.report_data_failed(recipient);
        let mut mpdus = vec![tr.mpdu];
        mpdus.extend(self.aggregate_queue.drain(..));
        self.notifications.push(MacLowNotification::MissedBlockAck { recipient, tid, mpdus });
    }


    /* Reception */

    /// Entry point for everything the PHY decoded
    pub fn receive(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>, rx: RxPsdu) {
        if rx.is_ampdu {
            self.deaggregate_ampdu_and_receive(sched, rx);
            return;
        }
        for sub in rx.mpdus {
            if sub.fcs_ok {
                self.receive_ok(sched, sub.mpdu, false);
            } else {
                tracing::trace!(ts = %sched.now(), "rx error {} snr={:.1}dB", sub.mpdu, rx.snr_db);
            }
        }
    }

    fn deaggregate_ampdu_and_receive(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>, rx: RxPsdu) {
        let mut originator = None;
        let total = rx.mpdus.len();
        let mut ok = 0;
        for sub in rx.mpdus {
            if !sub.fcs_ok {
                continue;
            }
            ok += 1;
            let hdr = &sub.mpdu.header;
            if hdr.receiver == self.address && hdr.is_qos_data() && hdr.ack_policy == AckPolicy::Normal {
                originator = Some((hdr.transmitter, hdr.tid));
            }
            self.receive_ok(sched, sub.mpdu, true);
        }
        tracing::trace!(ts = %sched.now(), "A-MPDU: {}/{} subframes passed FCS", ok, total);

        let Some((from, tid)) = originator else {
            return;
        };
        let Some(rec) = self.recipients.get(&(from, tid)) else {
            tracing::warn!("A-MPDU from {} tid={} without Block Ack agreement", from, tid);
            return;
        };
        let starting_seq = rec.buffer.win_start();
        let info = BlockAckInfo { tid, starting_seq, bitmap: rec.buffer.bitmap(starting_seq) };
        self.reserve_response(sched.now(), BLOCK_ACK_LEN, from);
        self.timers.send_block_ack = sched.schedule(SIFS, MacLowEvent::SendBlockAck { to: from, info });
    }

    fn receive_ok(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>, mpdu: Mpdu, in_ampdu: bool) {
        let now = sched.now();
        let hdr = &mpdu.header;
        if hdr.receiver != self.address && !hdr.receiver.is_group() {
            let nav = now + SimDuration::from_micros(hdr.duration_us as u64);
            if nav > self.nav_end {
                tracing::trace!(ts = %now, "NAV set to {} by {}", nav, mpdu);
                self.nav_end = nav;
            }
            return;
        }
        let from = hdr.transmitter;

        match hdr.frame_type {
            FrameType::Rts => {
                if self.is_nav_busy(now) {
                    tracing::debug!(ts = %now, "NAV busy, not answering RTS from {}", from);
                    return;
                }
                let control = self.station_manager.dmg_control_tx_vector(from);
                let cts = self.phy.calculate_tx_duration(CTS_LEN, &control);
                let remaining = SimDuration::from_micros(hdr.duration_us as u64).saturating_sub(SIFS + cts);
                self.reserve_response(now, CTS_LEN, from);
                self.timers.send_cts = sched.schedule(SIFS, MacLowEvent::SendCts { to: from, duration_us: duration_id(remaining) });
            }
            FrameType::Cts => {
                if self.current.is_some() && sched.is_pending(self.timers.cts_timeout) {
                    sched.cancel(self.timers.cts_timeout);
                    self.timers.cts_timeout = EventId::NONE;
                    self.station_manager.report_rts_ok(from);
                    self.timers.send_data = sched.schedule(SIFS, MacLowEvent::SendDataAfterCts);
                } else {
                    tracing::debug!(ts = %now, "unexpected CTS from {}", from);
                }
            }
            FrameType::Ack => {
                let expected = self.current.as_ref().is_some_and(|tr| !tr.is_ampdu) && sched.is_pending(self.timers.ack_timeout);
                if !expected {
                    tracing::debug!(ts = %now, "unexpected ACK from {}", from);
                    return;
                }
                sched.cancel(self.timers.ack_timeout);
                self.timers.ack_timeout = EventId::NONE;
                self.station_manager.report_data_ok(from);
                if let Some(tr) = self.current.take() {
                    tracing::trace!(ts = %now, "got ACK for {}", tr.mpdu);
                    self.notifications.push(MacLowNotification::GotAck { mpdu: tr.mpdu });
                }
            }
            FrameType::BlockAck => {
                let FrameBody::BlockAck(info) = mpdu.body else {
                    tracing::warn!("Block Ack from {} without body", from);
                    return;
                };
                if self.current.is_none() || !sched.is_pending(self.timers.block_ack_timeout) {
                    tracing::debug!(ts = %now, "unexpected Block Ack from {}", from);
                    return;
                }
                sched.cancel(self.timers.block_ack_timeout);
                self.timers.block_ack_timeout = EventId::NONE;
                self.got_block_ack(now, from, info);
            }
            FrameType::BlockAckReq => {
                let FrameBody::BlockAckReq { tid, starting_seq } = mpdu.body else {
                    return;
                };
                let Some(rec) = self.recipients.get_mut(&(from, tid)) else {
                    tracing::debug!(ts = %now, "BAR from {} tid={} without agreement", from, tid);
                    return;
                };
                rec.agreement.touch(now);
                let released = rec.buffer.flush_before(starting_seq);
                let win_start = rec.buffer.win_start();
                let info = BlockAckInfo { tid, starting_seq: win_start, bitmap: rec.buffer.bitmap(win_start) };
                self.forward_up(from, released);
                self.reserve_response(now, BLOCK_ACK_LEN, from);
                self.timers.send_block_ack = sched.schedule(SIFS, MacLowEvent::SendBlockAck { to: from, info });
            }
            FrameType::QosData => {
                self.receive_data(sched, mpdu, in_ampdu);
            }
            FrameType::Beacon => {
                if let FrameBody::Management(body) = mpdu.body {
                    self.notifications.push(MacLowNotification::RxBeacon { from, body });
                }
            }
            FrameType::Action => {
                let key = (from, Tid::MAX);
                let duplicate = hdr.retry && self.last_rx_seq.get(&key) == Some(&hdr.seq);
                self.last_rx_seq.insert(key, hdr.seq);
                if !hdr.receiver.is_group() {
                    self.reserve_response(now, ACK_LEN, from);
                    self.timers.send_ack = sched.schedule(SIFS, MacLowEvent::SendAck { to: from, duration_us: 0 });
                }
                if duplicate {
                    tracing::debug!(ts = %now, "duplicate action frame from {}", from);
                } else if let FrameBody::Management(body) = mpdu.body {
                    self.notifications.push(MacLowNotification::RxManagement { from, body });
                }
            }
        }
    }

    fn got_block_ack(&mut self, now: SimTime, from: MacAddr, info: BlockAckInfo) {
        let Some(tr) = self.current.take() else {
            return;
        };
        if let Some(ba) = self.originators.get_mut(&(from, info.tid)) {
            ba.touch(now);
        }

        if tr.mpdu.header.frame_type == FrameType::BlockAckReq {
            tracing::trace!(ts = %now, "BAR to {} answered, ssn={}", from, info.starting_seq);
            self.station_manager.report_data_ok(from);
            self.notifications.push(MacLowNotification::GotBlockAck { recipient: from, tid: info.tid, acked: Vec::new(), missed: Vec::new() });
            return;
        }

        let (acked, missed): (Vec<Mpdu>, Vec<Mpdu>) = std::iter::once(tr.mpdu)
            .chain(self.aggregate_queue.drain(..))
            .partition(|m| info.is_received(m.header.seq));
        tracing::debug!(ts = %now, "Block Ack from {}: {} acked, {} missed", from, acked.len(), missed.len());
        if acked.is_empty() {
            self.station_manager.report_data_failed(from);
        } else {
            self.station_manager.report_data_ok(from);
        }
        self.notifications.push(MacLowNotification::GotBlockAck { recipient: from, tid: info.tid, acked, missed });
    }

    fn receive_data(&mut self, sched: &mut dyn EventScheduler<MacLowEvent>, mpdu: Mpdu, in_ampdu: bool) {
        let now = sched.now();
        let from = mpdu.header.transmitter;
        let key = (from, mpdu.header.tid);
        let ack_needed = !in_ampdu && mpdu.header.ack_policy == AckPolicy::Normal && !mpdu.header.receiver.is_group();

        let delivered = match self.recipients.get_mut(&key) {
            Some(rec) => {
                rec.agreement.touch(now);
                rec.buffer.receive(mpdu)
            }
            None => {
                let seq = mpdu.header.seq;
                let duplicate = mpdu.header.retry && self.last_rx_seq.get(&key) == Some(&seq);
                self.last_rx_seq.insert(key, seq);
                if duplicate {
                    tracing::debug!(ts = %now, "duplicate {} dropped", mpdu);
                    Vec::new()
                } else {
                    vec![mpdu]
                }
            }
        };
        self.forward_up(from, delivered);

        if ack_needed {
            self.reserve_response(now, ACK_LEN, from);
            self.timers.send_ack = sched.schedule(SIFS, MacLowEvent::SendAck { to: from, duration_us: 0 });
        }
    }

    fn forward_up(&mut self, from: MacAddr, mpdus: Vec<Mpdu>) {
        for mpdu in mpdus {
            for msdu in mpdu.into_msdus() {
                self.notifications.push(MacLowNotification::RxDeliver { from, msdu });
            }
        }
    }
}


/// Duration/ID value covering `d`, rounded up and clamped to the field range
fn duration_id(d: SimDuration) -> u16 {
    d.as_micros_ceil().min(MAX_DURATION_ID_US) as u16
}

fn block_ack_tid(mpdu: &Mpdu) -> Tid {
    match mpdu.body {
        FrameBody::BlockAckReq { tid, .. } => tid,
        _ => mpdu.header.tid,
    }
}


#[cfg(test)]
mod tests {
    use crossbeam_channel::{Receiver, unbounded};
    use dmg_core::{DmgMcs, EventQueue, debug};

    use super::*;
    use crate::aggregation::MsduAggregator;
    use crate::frame::{Msdu, WifiMacHeader};
    use crate::mac_queue::MacQueue;
    use crate::phy::{AirFrame, ChannelPhy, RxMpdu};
    use crate::station_manager::ConstantRateManager;

    const AP: u16 = 0;
    const STA: u16 = 1;

    fn cfg() -> CfgMac {
        CfgMac { max_amsdu_size: 0, ..Default::default() }
    }

    fn mac_low(index: u16, cfg: &CfgMac) -> (MacLow, Receiver<AirFrame>) {
        let (tx, rx) = unbounded();
        let address = MacAddr::from_index(index);
        let mcs = DmgMcs::from_index(12).unwrap();
        let low = MacLow::new(
            address,
            Box::new(ChannelPhy::new(address, tx)),
            Box::new(ConstantRateManager::new(mcs, cfg)),
            cfg,
        );
        (low, rx)
    }

    fn tx_queue(cfg: &CfgMac) -> TxQueue {
        TxQueue::new(
            MacAddr::from_index(STA),
            MacQueue::new(SimDuration::from_micros(cfg.msdu_lifetime_us), 1000),
            MsduAggregator::new(cfg.max_amsdu_size),
        )
    }

    fn msdu(uid: u64) -> Msdu {
        Msdu {
            uid,
            size: 1448,
            source: MacAddr::from_index(STA),
            destination: MacAddr::from_index(AP),
            tid: 0,
            created: SimTime::ZERO,
            enqueued: SimTime::ZERO,
        }
    }

    fn fill(queue: &mut TxQueue, n: u64) {
        for uid in 0..n {
            queue.enqueue_msdu(SimTime::ZERO, msdu(uid));
        }
    }

    #[test]
    fn test_transaction_duration_rounds_up() {
        debug::setup_logging_verbose();
        let (low, _rx) = mac_low(STA, &cfg());
        let ap = MacAddr::from_index(AP);
        let data = SimDuration::from_nanos(12_345_678);
        let params = TxParams::default();

        let total = low.calculate_dmg_transaction_duration(ap, data, &params);
        let ack = DmgMcs::CONTROL.tx_duration(ACK_LEN);
        assert_eq!(total.as_nanos() % 1000, 0, "whole microseconds");
        assert!(total >= data + SIFS + ack, "never under-estimates");
        assert!(total < data + SIFS + ack + SimDuration::from_micros(1));

        let no_ack = low.calculate_dmg_transaction_duration(ap, data, &TxParams::no_ack());
        assert_eq!(no_ack, SimDuration::from_micros(12_346));
        let fast = low.calculate_dmg_transaction_duration(ap, data, &TxParams { ack: AckType::Fast, ..Default::default() });
        assert_eq!(fast, SimDuration::from_micros(12_346 + 8));
    }

    #[test]
    fn test_suspend_when_budget_too_short_then_resume() {
        debug::setup_logging_verbose();
        let cfg = cfg();
        let (mut low, air) = mac_low(STA, &cfg);
        let mut q = EventQueue::new();
        let mut queue = tx_queue(&cfg);
        fill(&mut queue, 1);
        let ap = MacAddr::from_index(AP);

        low.set_allocation_end(Some(SimTime::ZERO + SimDuration::from_micros(2)));
        let mpdu = queue.dequeue_first(SimTime::ZERO).unwrap();
        let original = mpdu.clone();
        low.start_transmission(&mut q, mpdu, TxParams::default(), &mut queue);

        assert!(air.try_recv().is_err(), "nothing may go on air");
        assert!(low.current_transaction().is_none(), "current packet cleared");
        assert!(low.is_transmission_suspended());
        assert_eq!(low.stored_count(), 1);
        let stored = low.stored_transmission(low.address(), ap).expect("entry for the flow");
        assert_eq!(stored.transaction.mpdu, original);
        assert!(matches!(
            low.take_notifications().as_slice(),
            [MacLowNotification::TxSuspended { recipient }] if *recipient == ap
        ));

        low.set_allocation_end(None);
        let outcome = low.resume_transmission(&mut q, Some(ap), SimDuration::from_millis(1));
        assert_eq!(outcome, ResumeOutcome::Resumed);
        assert_eq!(low.stored_count(), 0, "entry cleared on resume");
        let frame = air.try_recv().expect("resumed frame on air");
        assert_eq!(frame.psdu.mpdus[0].header.seq, original.header.seq);
        assert_eq!(frame.psdu.mpdus[0].body, original.body);
    }

    #[test]
    fn test_resume_with_short_budget_parks_again() {
        debug::setup_logging_verbose();
        let cfg = cfg();
        let (mut low, air) = mac_low(STA, &cfg);
        let mut q = EventQueue::new();
        let mut queue = tx_queue(&cfg);
        fill(&mut queue, 1);
        let ap = MacAddr::from_index(AP);

        low.set_allocation_end(Some(SimTime::ZERO + SimDuration::from_micros(1)));
        let mpdu = queue.dequeue_first(SimTime::ZERO).unwrap();
        low.start_transmission(&mut q, mpdu, TxParams::default(), &mut queue);

        assert_eq!(low.resume_transmission(&mut q, Some(ap), SimDuration::from_micros(1)), ResumeOutcome::Suspended);
        assert_eq!(low.stored_count(), 1);
        assert_eq!(low.resume_transmission(&mut q, Some(MacAddr::from_index(7)), SimDuration::from_millis(1)), ResumeOutcome::NothingStored);
        assert_eq!(low.resume_transmission(&mut q, None, SimDuration::from_millis(1)), ResumeOutcome::Resumed);
        assert!(air.try_recv().is_ok());
    }

    #[test]
    fn test_ampdu_stored_at_allocation_end_resumes_intact() {
        debug::setup_logging_verbose();
        let cfg = cfg();
        let (mut low, air) = mac_low(STA, &cfg);
        let mut q = EventQueue::new();
        let mut queue = tx_queue(&cfg);
        let ap = MacAddr::from_index(AP);
        low.create_originator_agreement(ap, 0, 64, 0, 0, SimTime::ZERO);
        fill(&mut queue, 10);

        low.set_allocation_end(Some(SimTime::ZERO + SimDuration::from_millis(1)));
        let first = queue.dequeue_first(SimTime::ZERO).unwrap();
        low.start_transmission(&mut q, first, TxParams::default(), &mut queue);

        let sent = air.try_recv().expect("A-MPDU on air");
        assert!(sent.psdu.is_ampdu);
        assert_eq!(sent.psdu.mpdus.len(), 10);
        assert!(!queue.has_frames());

        // Allocation ends before the Block Ack arrives
        low.store_allocation_parameters(&mut q);
        assert!(low.current_transaction().is_none());
        let snapshot = low.stored_transmission(low.address(), ap).cloned().expect("stored A-MPDU");
        assert_eq!(snapshot.aggregate_queue.len(), 9);
        assert!(q.is_empty(), "no timer survives the suspension");

        assert_eq!(low.resume_transmission(&mut q, Some(ap), SimDuration::from_millis(1)), ResumeOutcome::Resumed);
        let resent = air.try_recv().expect("A-MPDU resent");
        assert_eq!(resent.psdu, sent.psdu, "restored bit for bit");
        let tr = low.current_transaction().unwrap();
        assert_eq!(tr.mpdu, snapshot.transaction.mpdu);
        assert_eq!(tr.params.max_transmission_duration, Some(SimDuration::from_millis(1)));
    }

    #[test]
    fn test_expired_stored_ampdu_is_dropped() {
        debug::setup_logging_verbose();
        let cfg = CfgMac { msdu_lifetime_us: 1000, ..cfg() };
        let (mut low, air) = mac_low(STA, &cfg);
        let mut q = EventQueue::new();
        let mut queue = tx_queue(&cfg);
        let ap = MacAddr::from_index(AP);
        low.create_originator_agreement(ap, 0, 64, 0, 0, SimTime::ZERO);
        fill(&mut queue, 4);

        let first = queue.dequeue_first(SimTime::ZERO).unwrap();
        low.start_transmission(&mut q, first, TxParams::default(), &mut queue);
        let _ = air.try_recv();
        low.store_allocation_parameters(&mut q);
        low.take_notifications();

        // Let the clock run past the lifetime
        q.schedule(SimDuration::from_millis(2), MacLowEvent::EndTxNoAck);
        q.pop_next();
        assert!(low.has_stored_ampdu_expired(low.address(), ap, q.now()));

        assert_eq!(low.resume_transmission(&mut q, Some(ap), SimDuration::from_millis(10)), ResumeOutcome::Expired);
        assert_eq!(low.stored_count(), 0);
        assert!(air.try_recv().is_err());
        assert!(matches!(
            low.take_notifications().as_slice(),
            [MacLowNotification::StoredTransmissionExpired { mpdus: 4, .. }]
        ));
    }

    #[test]
    fn test_cancel_all_events_is_idempotent() {
        debug::setup_logging_verbose();
        let cfg = cfg();
        let (mut low, _air) = mac_low(STA, &cfg);
        let mut q = EventQueue::new();
        let mut queue = tx_queue(&cfg);
        fill(&mut queue, 1);

        let mpdu = queue.dequeue_first(SimTime::ZERO).unwrap();
        low.start_transmission(&mut q, mpdu, TxParams::default(), &mut queue);
        assert_eq!(q.len(), 1, "ack timeout armed");

        low.cancel_all_events(&mut q);
        low.cancel_all_events(&mut q);
        assert!(q.is_empty());
        let cancelled = low
            .take_notifications()
            .into_iter()
            .filter(|n| matches!(n, MacLowNotification::TxCancelled { .. }))
            .count();
        assert_eq!(cancelled, 1, "mpdu handed back exactly once");
    }

    #[test]
    fn test_ack_timeout_reports_failure() {
        debug::setup_logging_verbose();
        let cfg = CfgMac { max_slrc: 1, ..cfg() };
        let (mut low, _air) = mac_low(STA, &cfg);
        let mut q = EventQueue::new();
        let mut queue = tx_queue(&cfg);
        fill(&mut queue, 1);
        let ap = MacAddr::from_index(AP);

        let mpdu = queue.dequeue_first(SimTime::ZERO).unwrap();
        low.start_transmission(&mut q, mpdu, TxParams::default(), &mut queue);
        let (_, ev) = q.pop_next().unwrap();
        assert_eq!(ev, MacLowEvent::AckTimeout);
        low.handle_event(&mut q, ev);

        assert!(low.current_transaction().is_none());
        assert!(!low.station_manager().need_data_retransmission(ap), "slrc reached the limit");
        assert!(matches!(low.take_notifications().as_slice(), [MacLowNotification::MissedAck { .. }]));
    }

    #[test]
    fn test_data_reception_acks_and_delivers() {
        debug::setup_logging_verbose();
        let cfg = cfg();
        let (mut ap_low, air) = mac_low(AP, &cfg);
        let mut q = EventQueue::new();
        let sta = MacAddr::from_index(STA);

        let mut hdr = WifiMacHeader::qos_data(ap_low.address(), sta, 0);
        hdr.seq = 5;
        let mpdu = Mpdu::new(hdr, FrameBody::Msdu(msdu(42)));
        let rx = RxPsdu { mpdus: vec![RxMpdu { mpdu: mpdu.clone(), fcs_ok: true }], is_ampdu: false, tx_vector: TxVector::control(), snr_db: 20.0 };
        ap_low.receive(&mut q, rx);
        assert!(ap_low.is_busy(q.now()), "ACK pending");

        let (_, ev) = q.pop_next().unwrap();
        ap_low.handle_event(&mut q, ev);
        let ack = air.try_recv().expect("ACK sent");
        assert_eq!(ack.psdu.mpdus[0].header.frame_type, FrameType::Ack);
        assert_eq!(ack.psdu.mpdus[0].header.receiver, sta);

        // A retransmission of the same frame is acked but not delivered twice
        let mut retry = mpdu;
        retry.header.retry = true;
        let rx = RxPsdu { mpdus: vec![RxMpdu { mpdu: retry, fcs_ok: true }], is_ampdu: false, tx_vector: TxVector::control(), snr_db: 20.0 };
        ap_low.receive(&mut q, rx);
        let delivered = ap_low
            .take_notifications()
            .into_iter()
            .filter(|n| matches!(n, MacLowNotification::RxDeliver { .. }))
            .count();
        assert_eq!(delivered, 1);
    }

    #[test]
    fn test_ampdu_reception_answers_with_bitmap() {
        debug::setup_logging_verbose();
        let cfg = cfg();
        let (mut ap_low, air) = mac_low(AP, &cfg);
        let mut q = EventQueue::new();
        let sta = MacAddr::from_index(STA);
        ap_low.create_recipient_agreement(sta, 0, 64, 0, 0, SimTime::ZERO);

        let mpdus = (0..4u16)
            .map(|seq| {
                let mut hdr = WifiMacHeader::qos_data(ap_low.address(), sta, 0);
                hdr.seq = seq;
                RxMpdu { mpdu: Mpdu::new(hdr, FrameBody::Msdu(msdu(seq as u64))), fcs_ok: seq != 1 }
            })
            .collect();
        ap_low.receive(&mut q, RxPsdu { mpdus, is_ampdu: true, tx_vector: TxVector::control(), snr_db: 20.0 });

        let (_, ev) = q.pop_next().unwrap();
        assert_eq!(
            ev,
            MacLowEvent::SendBlockAck { to: sta, info: BlockAckInfo { tid: 0, starting_seq: 1, bitmap: 0b110 } }
        );
        ap_low.handle_event(&mut q, ev);
        assert_eq!(air.try_recv().unwrap().psdu.mpdus[0].header.frame_type, FrameType::BlockAck);
        assert_eq!(ap_low.recipient_total_received(sta, 0), Some(3));
        let delivered: Vec<u64> = ap_low
            .take_notifications()
            .into_iter()
            .filter_map(|n| match n {
                MacLowNotification::RxDeliver { msdu, .. } => Some(msdu.uid),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![0], "seq 2 and 3 wait for seq 1");
    }

    #[test]
    fn test_block_ack_splits_acked_and_missed() {
        debug::setup_logging_verbose();
        let cfg = cfg();
        let (mut low, _air) = mac_low(STA, &cfg);
        let mut q = EventQueue::new();
        let mut queue = tx_queue(&cfg);
        let ap = MacAddr::from_index(AP);
        low.create_originator_agreement(ap, 0, 64, 0, 0, SimTime::ZERO);
        fill(&mut queue, 4);

        let first = queue.dequeue_first(SimTime::ZERO).unwrap();
        low.start_transmission(&mut q, first, TxParams::default(), &mut queue);

        let mut ba = Mpdu::control(FrameType::BlockAck, low.address(), ap, 0);
        ba.body = FrameBody::BlockAck(BlockAckInfo { tid: 0, starting_seq: 1, bitmap: 0b101 });
        low.receive(&mut q, RxPsdu { mpdus: vec![RxMpdu { mpdu: ba, fcs_ok: true }], is_ampdu: false, tx_vector: TxVector::control(), snr_db: 20.0 });

        let notes = low.take_notifications();
        let [MacLowNotification::GotBlockAck { acked, missed, .. }] = notes.as_slice() else {
            panic!("expected a Block Ack outcome, got {:?}", notes);
        };
        let seqs = |m: &Vec<Mpdu>| m.iter().map(|m| m.header.seq).collect::<Vec<_>>();
        assert_eq!(seqs(acked), vec![0, 1, 3]);
        assert_eq!(seqs(missed), vec![2]);
        assert!(q.is_empty(), "Block Ack timeout cancelled");
    }
}
