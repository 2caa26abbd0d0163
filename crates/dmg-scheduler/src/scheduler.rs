use std::collections::HashMap;

use crossbeam_channel::Sender;

use dmg_config::SharedConfig;
use dmg_core::{
    AID_BROADCAST, Aid, AllocationId, BROADCAST_CBAP, ChannelAccessPeriod, EventId, EventScheduler, GUARD_TIME, MAX_ALLOCATION_ID,
    MAX_CBAP_BLOCK_DURATION, MAX_NUM_BLOCKS, MAX_SP_BLOCK_DURATION, MBIFS, MacAddr, SimDuration, SimTime,
};
use dmg_elements::{
    AllocationField, AllocationFieldList, AllocationType, BfControlField, DmgAllocationInfo, DmgTspecElement, StatusCode,
};

use crate::allocation_error::AllocationError;
use crate::policy::{SchedulerPolicy, new_policy};

/// Default length of a beamforming training SP, in microseconds
pub const BEAMFORMING_SP_DURATION: u32 = 2000;

/// Identifies a granted request: allocation id plus the two endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationKey {
    pub allocation_id: AllocationId,
    pub source_aid: Aid,
    pub destination_aid: Aid,
}

impl AllocationKey {
    pub fn new(allocation_id: AllocationId, source_aid: Aid, destination_aid: Aid) -> Self {
        Self { allocation_id, source_aid, destination_aid }
    }

    pub fn from_request(source_aid: Aid, info: &DmgAllocationInfo) -> Self {
        Self::new(info.allocation_id, source_aid, info.destination_aid)
    }

    fn matches(&self, field: &AllocationField) -> bool {
        field.allocation_id == self.allocation_id
            && field.source_aid == self.source_aid
            && field.destination_aid == self.destination_aid
    }
}

/// ADDTS request buffered until the end of the beacon interval
#[derive(Debug, Clone)]
pub struct AddtsRequest {
    pub source_addr: MacAddr,
    pub source_aid: Aid,
    pub tspec: DmgTspecElement,
}

/// Timers owned by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    AtiStarted,
    BeaconIntervalEnded,
}

/// Outputs of the scheduler, consumed by the AP MAC
#[derive(Debug, Clone)]
pub enum SchedulerNotification {
    AddtsResponse {
        destination: MacAddr,
        aid: Aid,
        status: StatusCode,
        tspec: DmgTspecElement,
    },
    /// Allocation list to announce for the next beacon interval
    ScheduleUpdated { allocations: AllocationFieldList },
}

/// Bookkeeping shared by every policy. All offsets and durations are in
/// microseconds relative to the DTI start.
pub struct SchedulerState {
    pub beacon_interval: u32,
    pub bhi_duration: u32,
    pub ati_duration: u32,
    pub dti_duration: u32,
    pub current_period: ChannelAccessPeriod,
    pub period_start: SimTime,
    /// First free offset, for policies that pack allocations
    pub allocation_start_time: u32,
    pub remaining_dti_time: u32,
    pub guard_time: u32,
    /// SPs granted so far, without broadcast CBAPs
    pub addts_allocation_list: AllocationFieldList,
    /// Last published schedule
    pub allocation_list: AllocationFieldList,
    pub allocated_requests: HashMap<AllocationKey, DmgTspecElement>,
    addts_requests: Vec<AddtsRequest>,
}

impl SchedulerState {
    pub fn new(beacon_interval: u32, bhi_duration: u32, ati_duration: u32) -> Self {
        let dti_duration = beacon_interval.saturating_sub(bhi_duration);
        Self {
            beacon_interval,
            bhi_duration,
            ati_duration,
            dti_duration,
            current_period: ChannelAccessPeriod::Bhi,
            period_start: SimTime::ZERO,
            allocation_start_time: 0,
            remaining_dti_time: dti_duration,
            guard_time: GUARD_TIME,
            addts_allocation_list: Vec::new(),
            allocation_list: Vec::new(),
            allocated_requests: HashMap::new(),
            addts_requests: Vec::new(),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.addts_requests.len()
    }

    fn check_block(allocation_type: AllocationType, allocation_id: AllocationId, duration: u32) -> Result<(), AllocationError> {
        if allocation_id > MAX_ALLOCATION_ID || (allocation_type == AllocationType::ServicePeriod && allocation_id == BROADCAST_CBAP) {
            return Err(AllocationError::InvalidAllocationId { id: allocation_id });
        }
        let limit = match allocation_type {
            AllocationType::ServicePeriod => MAX_SP_BLOCK_DURATION,
            AllocationType::Cbap => MAX_CBAP_BLOCK_DURATION,
        };
        if duration > limit {
            return Err(AllocationError::BlockTooLong { duration, limit });
        }
        Ok(())
    }

    /// Appends one block and returns the first offset usable after it,
    /// guard time included
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_single_contiguous_block(
        &mut self,
        allocation_id: AllocationId,
        allocation_type: AllocationType,
        pseudo_static: bool,
        source_aid: Aid,
        destination_aid: Aid,
        allocation_start: u32,
        block_duration: u32,
    ) -> Result<u32, AllocationError> {
        Self::check_block(allocation_type, allocation_id, block_duration)?;
        self.addts_allocation_list.push(AllocationField {
            allocation_id,
            allocation_type,
            pseudo_static,
            source_aid,
            destination_aid,
            allocation_start,
            block_duration: block_duration as u16,
            ..Default::default()
        });
        Ok(allocation_start + block_duration + self.guard_time)
    }

    /// Appends `blocks` back-to-back blocks of `block_duration`
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_multiple_contiguous_blocks(
        &mut self,
        allocation_id: AllocationId,
        allocation_type: AllocationType,
        pseudo_static: bool,
        source_aid: Aid,
        destination_aid: Aid,
        allocation_start: u32,
        block_duration: u32,
        blocks: u8,
    ) -> Result<u32, AllocationError> {
        Self::check_block(allocation_type, allocation_id, block_duration)?;
        self.addts_allocation_list.push(AllocationField {
            allocation_id,
            allocation_type,
            pseudo_static,
            source_aid,
            destination_aid,
            allocation_start,
            block_duration: block_duration as u16,
            number_of_blocks: blocks,
            block_period: block_duration as u16,
            ..Default::default()
        });
        Ok(allocation_start + blocks as u32 * block_duration + self.guard_time)
    }

    /// Appends `blocks` blocks repeating every `sp_interval`
    #[allow(clippy::too_many_arguments)]
    pub fn add_allocation_period(
        &mut self,
        allocation_id: AllocationId,
        allocation_type: AllocationType,
        pseudo_static: bool,
        source_aid: Aid,
        destination_aid: Aid,
        allocation_start: u32,
        block_duration: u32,
        sp_interval: u32,
        blocks: u8,
    ) -> Result<(), AllocationError> {
        Self::check_block(allocation_type, allocation_id, block_duration)?;
        let block_period = if blocks > 1 {
            u16::try_from(sp_interval).map_err(|_| AllocationError::BlockTooLong {
                duration: sp_interval,
                limit: u16::MAX as u32,
            })?
        } else {
            0
        };
        self.addts_allocation_list.push(AllocationField {
            allocation_id,
            allocation_type,
            pseudo_static,
            source_aid,
            destination_aid,
            allocation_start,
            block_duration: block_duration as u16,
            number_of_blocks: blocks,
            block_period,
            ..Default::default()
        });
        Ok(())
    }

    /// Reserves a broadcast CBAP, split into as many fields as the 16-bit
    /// duration needs. Returns the end of the period.
    pub fn allocate_cbap_period(&mut self, pseudo_static: bool, allocation_start: u32, duration: u32) -> u32 {
        let fields = get_broadcast_cbap_allocation(pseudo_static, allocation_start, duration);
        self.addts_allocation_list.extend(fields);
        allocation_start + duration
    }

    /// Turns the whole DTI into 255 back-to-back SP blocks between two stations
    pub fn allocate_dti_as_service_period(
        &mut self,
        allocation_id: AllocationId,
        source_aid: Aid,
        destination_aid: Aid,
    ) -> Result<u32, AllocationError> {
        let sp_duration = self.dti_duration / MAX_NUM_BLOCKS as u32;
        Self::check_block(AllocationType::ServicePeriod, allocation_id, sp_duration)?;
        self.addts_allocation_list.push(AllocationField {
            allocation_id,
            allocation_type: AllocationType::ServicePeriod,
            pseudo_static: true,
            source_aid,
            destination_aid,
            allocation_start: 0,
            block_duration: sp_duration as u16,
            number_of_blocks: MAX_NUM_BLOCKS,
            block_period: sp_duration as u16,
            ..Default::default()
        });
        Ok(sp_duration * MAX_NUM_BLOCKS as u32)
    }

    pub fn allocate_beamforming_service_period(
        &mut self,
        source_aid: Aid,
        destination_aid: Aid,
        allocation_start: u32,
        is_txss: bool,
    ) -> Result<u32, AllocationError> {
        self.allocate_beamforming_service_period_with(
            source_aid,
            destination_aid,
            allocation_start,
            BEAMFORMING_SP_DURATION,
            is_txss,
            is_txss,
        )
    }

    /// Beamforming training SP with explicit duration and sweep types. The
    /// lowest allocation id not used by another SP is taken.
    pub fn allocate_beamforming_service_period_with(
        &mut self,
        source_aid: Aid,
        destination_aid: Aid,
        allocation_start: u32,
        duration: u32,
        initiator_txss: bool,
        responder_txss: bool,
    ) -> Result<u32, AllocationError> {
        let allocation_id = self.free_allocation_id().ok_or(AllocationError::NoFreeAllocationId)?;
        Self::check_block(AllocationType::ServicePeriod, allocation_id, duration)?;
        tracing::debug!(
            "beamforming SP {} AID {} -> AID {} at {}us for {}us",
            allocation_id,
            source_aid,
            destination_aid,
            allocation_start,
            duration
        );
        self.addts_allocation_list.push(AllocationField {
            allocation_id,
            allocation_type: AllocationType::ServicePeriod,
            bf_control: BfControlField {
                beamform_training: true,
                initiator_txss,
                responder_txss,
            },
            source_aid,
            destination_aid,
            allocation_start,
            block_duration: duration as u16,
            ..Default::default()
        });
        Ok(allocation_start + duration + self.guard_time)
    }

    fn free_allocation_id(&self) -> Option<AllocationId> {
        (1..=MAX_ALLOCATION_ID).find(|id| {
            !self
                .addts_allocation_list
                .iter()
                .any(|f| f.allocation_type == AllocationType::ServicePeriod && f.allocation_id == *id)
        })
    }

    /// Index of the granted allocation matching `key`
    pub fn find_allocation(&self, key: &AllocationKey) -> Option<usize> {
        self.addts_allocation_list.iter().position(|f| key.matches(f))
    }
}

/// Broadcast CBAP fields covering `[allocation_start, allocation_start + duration)`,
/// in chunks of at most `MAX_CBAP_BLOCK_DURATION`
pub fn get_broadcast_cbap_allocation(pseudo_static: bool, allocation_start: u32, duration: u32) -> AllocationFieldList {
    let mut fields = Vec::new();
    let mut start = allocation_start;
    let mut left = duration;
    while left > 0 {
        let chunk = left.min(MAX_CBAP_BLOCK_DURATION);
        fields.push(AllocationField {
            allocation_id: BROADCAST_CBAP,
            allocation_type: AllocationType::Cbap,
            pseudo_static,
            source_aid: AID_BROADCAST,
            destination_aid: AID_BROADCAST,
            allocation_start: start,
            block_duration: chunk as u16,
            ..Default::default()
        });
        start += chunk;
        left -= chunk;
    }
    fields
}

/// AP-side scheduler: tracks the beacon interval phases, buffers ADDTS
/// requests and re-plans the DTI at every beacon interval end.
pub struct DmgWifiScheduler {
    config: SharedConfig,
    state: SchedulerState,
    policy: Box<dyn SchedulerPolicy>,
    notify: Sender<SchedulerNotification>,
    ap_address: MacAddr,
    bi_end_event: EventId,
}

impl DmgWifiScheduler {
    pub fn new(config: SharedConfig, mut policy: Box<dyn SchedulerPolicy>, notify: Sender<SchedulerNotification>) -> Self {
        let cfg = config.config();
        let sc = &cfg.scenario;
        let mut state = SchedulerState::new(sc.beacon_interval_us, sc.bhi_duration_us, sc.ati_duration_us);

        // Schedule for the first beacon interval, before any request arrived
        policy.update_start_and_remaining_time(&mut state);
        policy.add_broadcast_cbap_allocations(&mut state);
        tracing::info!("{} scheduler, BI {}us, DTI {}us", policy.name(), state.beacon_interval, state.dti_duration);

        Self {
            config,
            state,
            policy,
            notify,
            ap_address: MacAddr::default(),
            bi_end_event: EventId::NONE,
        }
    }

    pub fn from_config(config: SharedConfig, notify: Sender<SchedulerNotification>) -> Self {
        let policy = new_policy(&config);
        Self::new(config, policy, notify)
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Direct access to the allocation primitives. Call `rebuild_schedule`
    /// afterwards to publish the result.
    pub fn state_mut(&mut self) -> &mut SchedulerState {
        &mut self.state
    }

    /// Schedule announced for the current beacon interval
    pub fn allocation_list(&self) -> &AllocationFieldList {
        &self.state.allocation_list
    }

    pub fn current_period(&self) -> ChannelAccessPeriod {
        self.state.current_period
    }

    pub fn beacon_interval_started(
        &mut self,
        sched: &mut dyn EventScheduler<SchedulerEvent>,
        ap_address: MacAddr,
        bhi_duration: SimDuration,
        ati_duration: SimDuration,
    ) {
        self.ap_address = ap_address;
        self.state.current_period = ChannelAccessPeriod::Bhi;
        self.state.period_start = sched.now();
        self.state.bhi_duration = bhi_duration.as_micros_floor() as u32;
        self.state.ati_duration = ati_duration.as_micros_floor() as u32;
        tracing::trace!(ts = %sched.now(), "BHI started at {}, {}", ap_address, bhi_duration);

        if !ati_duration.is_zero() {
            let delay = bhi_duration.saturating_sub(ati_duration).saturating_sub(MBIFS);
            sched.schedule(delay, SchedulerEvent::AtiStarted);
        }
    }

    pub fn data_transfer_interval_started(
        &mut self,
        sched: &mut dyn EventScheduler<SchedulerEvent>,
        ap_address: MacAddr,
        dti_duration: SimDuration,
    ) {
        self.ap_address = ap_address;
        self.state.current_period = ChannelAccessPeriod::Dti;
        self.state.period_start = sched.now();
        self.state.dti_duration = dti_duration.as_micros_floor() as u32;
        tracing::trace!(ts = %sched.now(), "DTI started at {}, {}", ap_address, dti_duration);

        sched.cancel(self.bi_end_event);
        self.bi_end_event = sched.schedule(dti_duration, SchedulerEvent::BeaconIntervalEnded);
    }

    pub fn handle_event(&mut self, sched: &mut dyn EventScheduler<SchedulerEvent>, ev: SchedulerEvent) {
        match ev {
            SchedulerEvent::AtiStarted => {
                self.state.current_period = ChannelAccessPeriod::Ati;
                self.state.period_start = sched.now();
                tracing::trace!(ts = %sched.now(), "ATI started");
            }
            SchedulerEvent::BeaconIntervalEnded => {
                self.bi_end_event = EventId::NONE;
                tracing::debug!(ts = %sched.now(), "beacon interval ended");
                self.beacon_interval_ended();
            }
        }
    }

    /// Time left in the running access period
    pub fn remaining_in_period(&self, now: SimTime) -> SimDuration {
        let length = match self.state.current_period {
            ChannelAccessPeriod::Dti => self.state.dti_duration,
            ChannelAccessPeriod::Ati => self.state.ati_duration,
            _ => self.state.bhi_duration,
        };
        let elapsed = now.since(self.state.period_start);
        SimDuration::from_micros(length as u64).saturating_sub(elapsed)
    }

    /// Buffers the request; it is answered at the end of the beacon interval
    pub fn receive_addts_request(&mut self, request: AddtsRequest) {
        tracing::debug!(
            "ADDTS from {} (AID {}): {}",
            request.source_addr,
            request.source_aid,
            request.tspec
        );
        self.state.addts_requests.push(request);
    }

    /// Tears down a granted allocation and hands its time back
    pub fn receive_delts(&mut self, source_aid: Aid, info: &DmgAllocationInfo) -> Result<(), AllocationError> {
        let key = AllocationKey::from_request(source_aid, info);
        let Some(index) = self.state.find_allocation(&key) else {
            return Err(AllocationError::UnknownAllocation {
                id: key.allocation_id,
                source: key.source_aid,
                destination: key.destination_aid,
            });
        };
        let removed = self.state.addts_allocation_list.remove(index);
        tracing::info!("DELTS from AID {}, releasing {}", source_aid, removed);

        let released = removed.block_duration as u32 + self.state.guard_time;
        self.policy.adjust_existing_allocations(&mut self.state, index, released, false);
        self.policy.release_allocation(&mut self.state, &removed);
        self.policy.update_start_and_remaining_time(&mut self.state);
        self.state.allocated_requests.remove(&key);
        Ok(())
    }

    /// Re-derives the published schedule after direct primitive calls
    pub fn rebuild_schedule(&mut self) {
        self.policy.update_start_and_remaining_time(&mut self.state);
        self.policy.add_broadcast_cbap_allocations(&mut self.state);
        self.publish();
    }

    fn beacon_interval_ended(&mut self) {
        self.cleanup_allocations();
        if self.state.pending_requests() > 0 {
            self.manage_addts_requests();
        }
        self.policy.add_broadcast_cbap_allocations(&mut self.state);
        self.publish();
    }

    /// Drops every allocation that is not pseudo-static; those only live for
    /// one beacon interval
    fn cleanup_allocations(&mut self) {
        let (kept, expired): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.state.addts_allocation_list).into_iter().partition(|f| f.pseudo_static);
        self.state.addts_allocation_list = kept;

        for field in &expired {
            let key = AllocationKey::new(field.allocation_id, field.source_aid, field.destination_aid);
            self.state.allocated_requests.remove(&key);
            self.policy.release_allocation(&mut self.state, field);
            tracing::debug!("expired {}", field);
        }
        self.policy.update_start_and_remaining_time(&mut self.state);
    }

    fn manage_addts_requests(&mut self) {
        let requests = std::mem::take(&mut self.state.addts_requests);
        for req in requests {
            let info = req.tspec.allocation_info;
            let key = AllocationKey::from_request(req.source_aid, &info);

            let result = if info.allocation_id == BROADCAST_CBAP || info.allocation_id > MAX_ALLOCATION_ID {
                Err(AllocationError::InvalidAllocationId { id: info.allocation_id })
            } else if self.state.allocated_requests.contains_key(&key) {
                self.policy.modify_existing_allocation(&mut self.state, req.source_aid, &req.tspec)
            } else {
                self.policy.add_new_allocation(&mut self.state, req.source_aid, &req.tspec)
            };

            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("ADDTS from AID {} rejected: {}", req.source_aid, e);
                    StatusCode::Failure
                }
            };

            {
                let mut st = self.config.state_write();
                if status.is_success() {
                    st.addts_accepted += 1;
                } else {
                    st.addts_rejected += 1;
                }
            }
            if status.is_success() {
                self.state.allocated_requests.insert(key, req.tspec.clone());
            }
            tracing::info!("ADDTS response to {} (AID {}): {}", req.source_addr, req.source_aid, status);
            self.send(SchedulerNotification::AddtsResponse {
                destination: req.source_addr,
                aid: req.source_aid,
                status,
                tspec: req.tspec,
            });
        }
    }

    fn publish(&mut self) {
        for field in &self.state.allocation_list {
            tracing::trace!("schedule: {}", field);
        }
        let allocations = self.state.allocation_list.clone();
        self.send(SchedulerNotification::ScheduleUpdated { allocations });
    }

    fn send(&self, notification: SchedulerNotification) {
        if let Err(e) = self.notify.send(notification) {
            tracing::warn!("scheduler notification dropped: {}", e);
        }
    }
}
