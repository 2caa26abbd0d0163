use dmg_core::Aid;
use dmg_elements::{DmgTspecElement, StatusCode};

use crate::allocation_error::AllocationError;
use crate::policy::SchedulerPolicy;
use crate::scheduler::{SchedulerState, get_broadcast_cbap_allocation};

/// Leaves the whole DTI to contention. Every ADDTS request is refused.
#[derive(Debug, Default)]
pub struct CbapOnlyPolicy;

impl CbapOnlyPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl SchedulerPolicy for CbapOnlyPolicy {
    fn name(&self) -> &'static str {
        "CbapOnly"
    }

    fn update_start_and_remaining_time(&mut self, state: &mut SchedulerState) {
        state.allocation_start_time = 0;
        state.remaining_dti_time = state.dti_duration;
    }

    fn get_allocation_duration(&self, _min_allocation: u32, _max_allocation: u32) -> u32 {
        0
    }

    fn add_new_allocation(
        &mut self,
        _state: &mut SchedulerState,
        source_aid: Aid,
        _tspec: &DmgTspecElement,
    ) -> Result<StatusCode, AllocationError> {
        tracing::debug!("refusing SP for AID {}, CBAP only", source_aid);
        Ok(StatusCode::Failure)
    }

    fn modify_existing_allocation(
        &mut self,
        _state: &mut SchedulerState,
        _source_aid: Aid,
        _tspec: &DmgTspecElement,
    ) -> Result<StatusCode, AllocationError> {
        Ok(StatusCode::Failure)
    }

    fn adjust_existing_allocations(&mut self, _state: &mut SchedulerState, _from_index: usize, _duration: u32, _is_added: bool) {}

    fn add_broadcast_cbap_allocations(&mut self, state: &mut SchedulerState) {
        state.allocation_list = get_broadcast_cbap_allocation(true, 0, state.dti_duration);
    }
}
