use dmg_config::{SchedulerType, SharedConfig};
use dmg_core::Aid;
use dmg_elements::{AllocationField, DmgTspecElement, StatusCode};

use crate::allocation_error::AllocationError;
use crate::basic::BasicPolicy;
use crate::cbap_only::CbapOnlyPolicy;
use crate::periodic::PeriodicPolicy;
use crate::scheduler::SchedulerState;

/// Admission and layout strategy plugged into `DmgWifiScheduler`.
///
/// The scheduler owns the event flow and the allocation bookkeeping; a policy
/// decides where SPs go and what is left over for contention.
pub trait SchedulerPolicy: Send {
    fn name(&self) -> &'static str;

    /// Recomputes the policy's view of free DTI time from the current
    /// allocation list
    fn update_start_and_remaining_time(&mut self, state: &mut SchedulerState);

    /// Duration to grant for a request bounded by `[min, max]`
    fn get_allocation_duration(&self, min_allocation: u32, max_allocation: u32) -> u32;

    fn add_new_allocation(
        &mut self,
        state: &mut SchedulerState,
        source_aid: Aid,
        tspec: &DmgTspecElement,
    ) -> Result<StatusCode, AllocationError>;

    fn modify_existing_allocation(
        &mut self,
        state: &mut SchedulerState,
        source_aid: Aid,
        tspec: &DmgTspecElement,
    ) -> Result<StatusCode, AllocationError>;

    /// Shifts the allocations from `from_index` on by `duration`, later when
    /// `is_added`, earlier otherwise
    fn adjust_existing_allocations(&mut self, state: &mut SchedulerState, from_index: usize, duration: u32, is_added: bool);

    /// Builds the published allocation list: granted SPs plus broadcast CBAPs
    /// covering the free DTI time
    fn add_broadcast_cbap_allocations(&mut self, state: &mut SchedulerState);

    /// Hands the time of a removed allocation back to the policy
    fn release_allocation(&mut self, _state: &mut SchedulerState, _allocation: &AllocationField) {}
}

/// Instantiates the policy selected in the configuration
pub fn new_policy(config: &SharedConfig) -> Box<dyn SchedulerPolicy> {
    let cfg = config.config();
    let sched = &cfg.scheduler;
    match sched.scheduler_type {
        SchedulerType::CbapOnly => Box::new(CbapOnlyPolicy::new()),
        SchedulerType::Basic => Box::new(BasicPolicy::new(sched.min_broadcast_cbap_duration, sched.inter_allocation_distance)),
        SchedulerType::Periodic => Box::new(PeriodicPolicy::new(sched.min_broadcast_cbap_duration, sched.inter_allocation_distance)),
    }
}
