use core::fmt;

use dmg_core::Aid;
use dmg_elements::{AllocationField, AllocationFormat, DmgTspecElement, StatusCode};

use crate::allocation_error::AllocationError;
use crate::policy::SchedulerPolicy;
use crate::scheduler::{AllocationKey, SchedulerState, get_broadcast_cbap_allocation};

/// Free interval of the DTI, `[start, end)` in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: u32,
    pub end: u32,
}

impl Slot {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Places periodic SPs, `allocation_period` of them per beacon interval and
/// evenly spaced, into the free slots of the DTI. Aperiodic requests take the
/// first slot they fit in. Whatever stays free becomes broadcast CBAP.
#[derive(Debug)]
pub struct PeriodicPolicy {
    min_broadcast_cbap_duration: u32,
    inter_allocation_distance: u32,
    available_slots: Vec<Slot>,
}

impl PeriodicPolicy {
    pub fn new(min_broadcast_cbap_duration: u32, inter_allocation_distance: u32) -> Self {
        Self {
            min_broadcast_cbap_duration,
            inter_allocation_distance,
            available_slots: Vec::new(),
        }
    }

    pub fn available_slots(&self) -> &[Slot] {
        &self.available_slots
    }

    /// Time kept free after every SP block
    fn gap(&self, state: &SchedulerState) -> u32 {
        self.inter_allocation_distance.max(state.guard_time)
    }

    fn requested_duration(&self, tspec: &DmgTspecElement) -> u32 {
        let min = tspec.minimum_allocation as u32;
        match tspec.allocation_info.allocation_format {
            AllocationFormat::Isochronous => self.get_allocation_duration(min, tspec.maximum_allocation as u32),
            AllocationFormat::Asynchronous => min,
        }
    }

    /// Walks the free slots looking for up to `max_blocks` SP instances of
    /// `needed` microseconds spaced `sp_interval` apart. Returns the first
    /// instance's start and how many instances fit before periodicity breaks.
    pub fn verify_available_slots(&self, needed: u32, sp_interval: u32, max_blocks: u8) -> (u32, u8) {
        let slots = &self.available_slots;
        let Some(first) = slots.first() else {
            return (0, 0);
        };
        let mut start = first.start;
        let mut first_start = start;
        let mut blocks = 0u8;
        let mut i = 0;

        while i < slots.len() && blocks < max_blocks {
            let slot = slots[i];
            if slot.end <= start {
                i += 1;
                continue;
            }
            if start < slot.start {
                if blocks > 0 {
                    // Next instance would land inside an allocation
                    break;
                }
                start = slot.start;
            }

            if needed > slot.end - start {
                if blocks == 0 {
                    i += 1;
                    continue;
                }
                break;
            }

            if blocks == 0 {
                first_start = start;
            }
            blocks += 1;
            start += sp_interval;

            if start == slot.end {
                break;
            } else if start < slot.end {
                if start + needed > slot.end {
                    break;
                }
            } else {
                i += 1;
            }
        }
        (first_start, blocks)
    }

    /// Removes `[start, end)` from the free slots
    pub fn reserve_slot(&mut self, start: u32, end: u32) {
        let mut slots = Vec::with_capacity(self.available_slots.len() + 1);
        for slot in &self.available_slots {
            if slot.start >= end || slot.end <= start {
                slots.push(*slot);
                continue;
            }
            if slot.start < start {
                slots.push(Slot::new(slot.start, start));
            }
            if slot.end > end {
                slots.push(Slot::new(end, slot.end));
            }
        }
        self.available_slots = slots;
        tracing::trace!("reserved [{}, {}), free: {:?}", start, end, self.available_slots);
    }

    /// Returns `[start, end)` to the free slots, merging with neighbours
    pub fn release_slot(&mut self, start: u32, end: u32) {
        if end <= start {
            return;
        }
        self.available_slots.push(Slot::new(start, end));
        self.available_slots.sort_by_key(|s| s.start);

        let mut merged: Vec<Slot> = Vec::with_capacity(self.available_slots.len());
        for slot in self.available_slots.drain(..) {
            match merged.last_mut() {
                Some(last) if slot.start <= last.end => last.end = last.end.max(slot.end),
                _ => merged.push(slot),
            }
        }
        self.available_slots = merged;
        tracing::trace!("released [{}, {}), free: {:?}", start, end, self.available_slots);
    }

    fn free_time(&self) -> u32 {
        self.available_slots.iter().map(Slot::len).sum()
    }

    fn add_periodic(
        &mut self,
        state: &mut SchedulerState,
        source_aid: Aid,
        tspec: &DmgTspecElement,
        duration: u32,
    ) -> Result<StatusCode, AllocationError> {
        let info = &tspec.allocation_info;
        let period = tspec.allocation_period;
        if tspec.period_multiple_bi {
            return Err(AllocationError::MultipleBiPeriod);
        }

        let sp_interval = state.beacon_interval / period as u32;
        if duration > sp_interval || sp_interval - duration < self.min_broadcast_cbap_duration {
            return Err(AllocationError::CbapNotGuaranteed {
                sp_interval,
                duration,
                min_cbap: self.min_broadcast_cbap_duration,
            });
        }
        tracing::debug!("AID {}: {} SPs of {}us, one every {}us", source_aid, period, duration, sp_interval);

        let needed = duration + self.gap(state);
        let max_blocks = period.min(u8::MAX as u16) as u8;
        let (first_start, blocks) = self.verify_available_slots(needed, sp_interval, max_blocks);
        if blocks < max_blocks {
            tracing::debug!("only {} of {} periodic SPs fit", blocks, period);
            return Ok(StatusCode::Failure);
        }
        let reserved = blocks as u32 * needed;
        if self.free_time().saturating_sub(reserved) < self.min_broadcast_cbap_duration {
            tracing::debug!("{}us more SP time would cut into the CBAP floor", reserved);
            return Ok(StatusCode::Failure);
        }

        state.add_allocation_period(
            info.allocation_id,
            info.allocation_type,
            info.pseudo_static,
            source_aid,
            info.destination_aid,
            first_start,
            duration,
            sp_interval,
            blocks,
        )?;
        let mut start = first_start;
        for _ in 0..blocks {
            self.reserve_slot(start, start + needed);
            start += sp_interval;
        }
        state.remaining_dti_time = state.remaining_dti_time.saturating_sub(reserved);
        Ok(StatusCode::Success)
    }

    fn add_aperiodic(
        &mut self,
        state: &mut SchedulerState,
        source_aid: Aid,
        tspec: &DmgTspecElement,
        duration: u32,
    ) -> Result<StatusCode, AllocationError> {
        let info = &tspec.allocation_info;
        let needed = duration + self.gap(state);
        if self.free_time().saturating_sub(needed) < self.min_broadcast_cbap_duration {
            tracing::debug!("AID {}: {}us would cut into the CBAP floor", source_aid, duration);
            return Ok(StatusCode::Failure);
        }
        let Some(slot) = self.available_slots.iter().find(|s| s.len() >= needed).copied() else {
            tracing::debug!("AID {}: no free slot of {}us", source_aid, needed);
            return Ok(StatusCode::Failure);
        };

        state.allocate_single_contiguous_block(
            info.allocation_id,
            info.allocation_type,
            info.pseudo_static,
            source_aid,
            info.destination_aid,
            slot.start,
            duration,
        )?;
        self.reserve_slot(slot.start, slot.start + needed);
        state.remaining_dti_time = state.remaining_dti_time.saturating_sub(needed);
        Ok(StatusCode::Success)
    }
}

impl SchedulerPolicy for PeriodicPolicy {
    fn name(&self) -> &'static str {
        "Periodic"
    }

    fn update_start_and_remaining_time(&mut self, state: &mut SchedulerState) {
        if state.addts_allocation_list.is_empty() {
            self.available_slots = vec![Slot::new(0, state.dti_duration)];
        }
        state.remaining_dti_time = self.free_time();
        state.allocation_start_time = self.available_slots.first().map_or(state.dti_duration, |s| s.start);
    }

    fn get_allocation_duration(&self, min_allocation: u32, max_allocation: u32) -> u32 {
        (min_allocation + max_allocation) / 2
    }

    fn add_new_allocation(
        &mut self,
        state: &mut SchedulerState,
        source_aid: Aid,
        tspec: &DmgTspecElement,
    ) -> Result<StatusCode, AllocationError> {
        let duration = self.requested_duration(tspec);
        if tspec.allocation_period != 0 {
            self.add_periodic(state, source_aid, tspec, duration)
        } else {
            self.add_aperiodic(state, source_aid, tspec, duration)
        }
    }

    /// Shrinking is applied in place to every block; growing is refused
    fn modify_existing_allocation(
        &mut self,
        state: &mut SchedulerState,
        source_aid: Aid,
        tspec: &DmgTspecElement,
    ) -> Result<StatusCode, AllocationError> {
        let key = AllocationKey::from_request(source_aid, &tspec.allocation_info);
        let index = state.find_allocation(&key).ok_or(AllocationError::UnknownAllocation {
            id: key.allocation_id,
            source: key.source_aid,
            destination: key.destination_aid,
        })?;

        let requested = self.requested_duration(tspec);
        let current = state.addts_allocation_list[index].block_duration as u32;
        if requested == current {
            return Ok(StatusCode::Success);
        }
        if requested > current {
            tracing::debug!("allocation {} cannot grow from {}us to {}us", key.allocation_id, current, requested);
            return Ok(StatusCode::Failure);
        }

        let gap = self.gap(state);
        let starts: Vec<u32> = state.addts_allocation_list[index].block_starts().collect();
        for s in starts {
            self.release_slot(s + requested + gap, s + current + gap);
        }
        state.addts_allocation_list[index].block_duration = requested as u16;
        self.update_start_and_remaining_time(state);
        Ok(StatusCode::Success)
    }

    fn adjust_existing_allocations(&mut self, _state: &mut SchedulerState, _from_index: usize, _duration: u32, _is_added: bool) {}

    fn add_broadcast_cbap_allocations(&mut self, state: &mut SchedulerState) {
        let mut list = state.addts_allocation_list.clone();
        for slot in &self.available_slots {
            list.extend(get_broadcast_cbap_allocation(true, slot.start, slot.len()));
        }
        list.sort_by_key(|f| f.allocation_start);
        state.allocation_list = list;
    }

    fn release_allocation(&mut self, state: &mut SchedulerState, allocation: &AllocationField) {
        let gap = self.gap(state);
        let duration = allocation.block_duration as u32;
        for s in allocation.block_starts() {
            let end = (s + duration + gap).min(state.dti_duration);
            self.release_slot(s, end);
        }
    }
}
