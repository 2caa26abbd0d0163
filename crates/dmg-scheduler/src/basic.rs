use dmg_core::{Aid, assert_warn};
use dmg_elements::{AllocationFormat, DmgTspecElement, StatusCode};

use crate::allocation_error::AllocationError;
use crate::policy::SchedulerPolicy;
use crate::scheduler::{AllocationKey, SchedulerState, get_broadcast_cbap_allocation};

/// Packs one aperiodic SP per request back to back from the DTI start and
/// keeps at least `min_broadcast_cbap_duration` free for contention. When
/// time allows, a short CBAP of `inter_allocation_distance` separates
/// consecutive SPs.
#[derive(Debug)]
pub struct BasicPolicy {
    min_broadcast_cbap_duration: u32,
    inter_allocation_distance: u32,
}

impl BasicPolicy {
    pub fn new(min_broadcast_cbap_duration: u32, inter_allocation_distance: u32) -> Self {
        Self {
            min_broadcast_cbap_duration,
            inter_allocation_distance,
        }
    }

    /// Requested duration: midpoint for isochronous traffic, the minimum for
    /// asynchronous traffic whose maximum field is reserved
    fn requested_duration(&self, tspec: &DmgTspecElement) -> u32 {
        let min = tspec.minimum_allocation as u32;
        match tspec.allocation_info.allocation_format {
            AllocationFormat::Isochronous => self.get_allocation_duration(min, tspec.maximum_allocation as u32),
            AllocationFormat::Asynchronous => min,
        }
    }

    /// DTI time that can still be granted without eating into the minimum CBAP
    fn budget(&self, state: &SchedulerState) -> u32 {
        state.remaining_dti_time.saturating_sub(self.min_broadcast_cbap_duration)
    }
}

impl SchedulerPolicy for BasicPolicy {
    fn name(&self) -> &'static str {
        "Basic"
    }

    fn update_start_and_remaining_time(&mut self, state: &mut SchedulerState) {
        match state.addts_allocation_list.last() {
            None => {
                state.allocation_start_time = 0;
                state.remaining_dti_time = state.dti_duration;
            }
            Some(last) => {
                state.allocation_start_time = last.first_block_end() + state.guard_time;
                state.remaining_dti_time = state.dti_duration.saturating_sub(state.allocation_start_time);
            }
        }
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
        if tspec.allocation_period != 0 {
            return Err(AllocationError::PeriodNotSupported {
                period: tspec.allocation_period,
            });
        }
        let info = &tspec.allocation_info;
        let requested = self.requested_duration(tspec);
        let minimum = tspec.minimum_allocation as u32;

        let granted = if requested <= self.budget(state) {
            requested
        } else if info.allocation_format == AllocationFormat::Isochronous && minimum <= self.budget(state) {
            tracing::debug!("AID {} gets minimum allocation {}us instead of {}us", source_aid, minimum, requested);
            minimum
        } else {
            tracing::debug!(
                "AID {} asks {}us, only {}us left above the CBAP floor",
                source_aid,
                requested,
                self.budget(state)
            );
            return Ok(StatusCode::Failure);
        };

        state.allocation_start_time = state.allocate_single_contiguous_block(
            info.allocation_id,
            info.allocation_type,
            info.pseudo_static,
            source_aid,
            info.destination_aid,
            state.allocation_start_time,
            granted,
        )?;
        state.remaining_dti_time = state.remaining_dti_time.saturating_sub(granted + state.guard_time);
        Ok(StatusCode::Success)
    }

    fn modify_existing_allocation(
        &mut self,
        state: &mut SchedulerState,
        source_aid: Aid,
        tspec: &DmgTspecElement,
    ) -> Result<StatusCode, AllocationError> {
        if tspec.allocation_period != 0 {
            return Err(AllocationError::PeriodNotSupported {
                period: tspec.allocation_period,
            });
        }
        let info = &tspec.allocation_info;
        let key = AllocationKey::from_request(source_aid, info);
        let index = state.find_allocation(&key).ok_or(AllocationError::UnknownAllocation {
            id: key.allocation_id,
            source: key.source_aid,
            destination: key.destination_aid,
        })?;

        let requested = self.requested_duration(tspec);
        let minimum = tspec.minimum_allocation as u32;
        let current = state.addts_allocation_list[index].block_duration as u32;
        tracing::debug!("modifying allocation {}: {}us -> {}us", key.allocation_id, current, requested);

        if requested <= current {
            let diff = current - requested;
            state.addts_allocation_list[index].block_duration = requested as u16;
            self.adjust_existing_allocations(state, index + 1, diff, false);
            self.update_start_and_remaining_time(state);
            return Ok(StatusCode::Success);
        }

        let budget = self.budget(state);
        let mut candidates = vec![requested];
        if info.allocation_format == AllocationFormat::Isochronous && minimum > current {
            candidates.push(minimum);
        }
        for new_duration in candidates {
            let diff = new_duration - current;
            if diff <= budget {
                state.addts_allocation_list[index].block_duration = new_duration as u16;
                self.adjust_existing_allocations(state, index + 1, diff, true);
                self.update_start_and_remaining_time(state);
                return Ok(StatusCode::Success);
            }
        }

        // Old duration stays in place
        Ok(StatusCode::Failure)
    }

    fn adjust_existing_allocations(&mut self, state: &mut SchedulerState, from_index: usize, duration: u32, is_added: bool) {
        for field in state.addts_allocation_list.iter_mut().skip(from_index) {
            field.allocation_start = if is_added {
                field.allocation_start + duration
            } else {
                field.allocation_start.saturating_sub(duration)
            };
        }
    }

    fn add_broadcast_cbap_allocations(&mut self, state: &mut SchedulerState) {
        let guard = state.guard_time;
        let gap = self.inter_allocation_distance;
        let mut remaining = state.remaining_dti_time;
        let mut cursor = 0u32;
        let mut total_cbap = 0u32;
        let mut list = Vec::with_capacity(state.addts_allocation_list.len() * 2 + 2);

        let count = state.addts_allocation_list.len();
        for (i, sp) in state.addts_allocation_list.iter().enumerate() {
            let mut field = sp.clone();
            field.allocation_start = cursor;
            cursor += field.block_duration as u32 + guard;
            list.push(field);

            // Short CBAP between two SPs, never at the cost of the CBAP floor
            let is_last = i + 1 == count;
            if !is_last && gap > 0 && remaining >= gap + guard + self.min_broadcast_cbap_duration {
                list.extend(get_broadcast_cbap_allocation(true, cursor, gap));
                cursor += gap + guard;
                remaining -= gap + guard;
                total_cbap += gap;
            }
        }

        let tail = state.dti_duration.saturating_sub(cursor);
        if tail > 0 {
            list.extend(get_broadcast_cbap_allocation(true, cursor, tail));
            cursor += tail;
            total_cbap += tail;
        }

        assert_warn!(
            total_cbap >= self.min_broadcast_cbap_duration,
            "broadcast CBAP time {}us below the {}us floor",
            total_cbap,
            self.min_broadcast_cbap_duration
        );
        assert_warn!(
            cursor == state.dti_duration,
            "DTI not fully allocated: schedule ends at {}us, DTI is {}us",
            cursor,
            state.dti_duration
        );
        state.allocation_list = list;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmg_core::{GUARD_TIME, debug};
    use dmg_elements::AllocationType;

    use crate::service_period::build_dmg_tspec;

    fn setup() -> (SchedulerState, BasicPolicy) {
        let mut state = SchedulerState::new(102_400, 3_000, 0);
        let mut policy = BasicPolicy::new(4096, 10);
        policy.update_start_and_remaining_time(&mut state);
        (state, policy)
    }

    #[test]
    fn test_packs_from_dti_start() {
        debug::setup_logging_verbose();
        let (mut state, mut policy) = setup();
        let a = build_dmg_tspec(1, true, 10_000, 20_000, 0).unwrap();
        let b = build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap();
        assert_eq!(policy.add_new_allocation(&mut state, 1, &a), Ok(StatusCode::Success));
        assert_eq!(policy.add_new_allocation(&mut state, 2, &b), Ok(StatusCode::Success));

        let list = &state.addts_allocation_list;
        assert_eq!(list[0].block_duration, 15_000, "midpoint of [10000, 20000]");
        assert_eq!(list[1].allocation_start, 15_000 + GUARD_TIME);
        assert_eq!(state.allocation_start_time, 15_000 + GUARD_TIME + 5_000 + GUARD_TIME);
        assert_eq!(state.remaining_dti_time, 99_400 - state.allocation_start_time);
    }

    #[test]
    fn test_falls_back_to_minimum() {
        debug::setup_logging_verbose();
        let (mut state, mut policy) = setup();
        state.remaining_dti_time = 4096 + 12_000;
        let tspec = build_dmg_tspec(1, true, 10_000, 20_000, 0).unwrap();
        assert_eq!(policy.add_new_allocation(&mut state, 1, &tspec), Ok(StatusCode::Success));
        assert_eq!(state.addts_allocation_list[0].block_duration, 10_000);

        let tspec = build_dmg_tspec(2, true, 10_000, 20_000, 0).unwrap();
        assert_eq!(policy.add_new_allocation(&mut state, 2, &tspec), Ok(StatusCode::Failure));
        assert_eq!(state.addts_allocation_list.len(), 1);
    }

    #[test]
    fn test_rejects_periodic_request() {
        debug::setup_logging_verbose();
        let (mut state, mut policy) = setup();
        let tspec = build_dmg_tspec(1, true, 8_000, 8_000, 4).unwrap();
        assert_eq!(
            policy.add_new_allocation(&mut state, 1, &tspec),
            Err(AllocationError::PeriodNotSupported { period: 4 })
        );
    }

    #[test]
    fn test_modify_shifts_followers() {
        debug::setup_logging_verbose();
        let (mut state, mut policy) = setup();
        for aid in 1..=3u8 {
            let tspec = build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap();
            policy.add_new_allocation(&mut state, aid, &tspec).unwrap();
        }
        let grow = build_dmg_tspec(1, true, 7_000, 7_000, 0).unwrap();
        assert_eq!(policy.modify_existing_allocation(&mut state, 2, &grow), Ok(StatusCode::Success));
        assert_eq!(state.addts_allocation_list[1].block_duration, 7_000);
        assert_eq!(state.addts_allocation_list[2].allocation_start, 5_000 + GUARD_TIME + 7_000 + GUARD_TIME);

        let shrink = build_dmg_tspec(1, true, 1_000, 1_000, 0).unwrap();
        assert_eq!(policy.modify_existing_allocation(&mut state, 1, &shrink), Ok(StatusCode::Success));
        assert_eq!(state.addts_allocation_list[1].allocation_start, 1_000 + GUARD_TIME);
        assert_eq!(state.allocation_start_time, 1_000 + 7_000 + 5_000 + 3 * GUARD_TIME);

        let unknown = build_dmg_tspec(9, true, 1_000, 1_000, 0).unwrap();
        assert!(policy.modify_existing_allocation(&mut state, 1, &unknown).is_err());
    }

    #[test]
    fn test_cbap_layout_covers_dti() {
        debug::setup_logging_verbose();
        let (mut state, mut policy) = setup();
        policy.add_broadcast_cbap_allocations(&mut state);
        assert_eq!(state.allocation_list.len(), 2, "empty schedule is one CBAP in two chunks");
        assert!(state.allocation_list.iter().all(|f| f.is_broadcast_cbap()));

        for aid in 1..=2u8 {
            let tspec = build_dmg_tspec(1, true, 20_000, 20_000, 0).unwrap();
            policy.add_new_allocation(&mut state, aid, &tspec).unwrap();
        }
        policy.add_broadcast_cbap_allocations(&mut state);
        let list = &state.allocation_list;
        tracing::info!("{:?}", list);
        assert_eq!(list[0].allocation_type, AllocationType::ServicePeriod);
        assert!(list[1].is_broadcast_cbap(), "gap CBAP between the two SPs");
        assert_eq!(list[1].block_duration, 10);
        assert_eq!(list[2].allocation_start, 20_000 + GUARD_TIME + 10 + GUARD_TIME);
        let last = list.last().unwrap();
        assert_eq!(last.first_block_end(), state.dti_duration, "schedule ends with the DTI");
        let cbap: u32 = list.iter().filter(|f| f.is_broadcast_cbap()).map(|f| f.block_duration as u32).sum();
        assert!(cbap >= 4096);
    }
}
