use crossbeam_channel::{Receiver, unbounded};

use dmg_config::{SchedulerType, SharedConfig, SimConfig};
use dmg_core::{Aid, EventQueue, MacAddr, ScopedScheduler, SimDuration};
use dmg_elements::{AllocationFieldList, DmgTspecElement, StatusCode};
use dmg_scheduler::{AddtsRequest, DmgWifiScheduler, SchedulerEvent, SchedulerNotification};

/// Default config for scheduler tests, adjustable before building the harness
pub fn test_config(scheduler_type: SchedulerType) -> SimConfig {
    let mut cfg = SimConfig::default();
    cfg.scheduler.scheduler_type = scheduler_type;
    cfg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestEvent {
    BeaconIntervalStarted,
    DtiStarted,
    Scheduler(SchedulerEvent),
}

/// Drives a scheduler through whole beacon intervals on its own timeline
pub struct SchedulerTest {
    pub config: SharedConfig,
    pub queue: EventQueue<TestEvent>,
    pub scheduler: DmgWifiScheduler,
    notifications: Receiver<SchedulerNotification>,
    pub ap: MacAddr,
}

impl SchedulerTest {
    pub fn new(cfg: SimConfig) -> Self {
        let config = SharedConfig::from_config(cfg);
        let (tx, rx) = unbounded();
        let scheduler = DmgWifiScheduler::from_config(config.clone(), tx);
        Self {
            config,
            queue: EventQueue::new(),
            scheduler,
            notifications: rx,
            ap: MacAddr::from_index(0),
        }
    }

    pub fn submit_addts(&mut self, aid: Aid, tspec: DmgTspecElement) {
        self.scheduler.receive_addts_request(AddtsRequest {
            source_addr: MacAddr::from_index(aid as u16),
            source_aid: aid,
            tspec,
        });
    }

    /// BHI, then DTI, up to and including the beacon interval end. Returns
    /// every notification emitted on the way.
    pub fn run_beacon_interval(&mut self) -> Vec<SchedulerNotification> {
        let cfg = self.config.config();
        let bhi = SimDuration::from_micros(cfg.scenario.bhi_duration_us as u64);
        let ati = SimDuration::from_micros(cfg.scenario.ati_duration_us as u64);
        let dti = SimDuration::from_micros(cfg.scenario.dti_duration_us() as u64);

        self.queue.schedule(SimDuration::ZERO, TestEvent::BeaconIntervalStarted);
        while let Some((_, ev)) = self.queue.pop_next() {
            let mut sched = ScopedScheduler::new(&mut self.queue, TestEvent::Scheduler);
            match ev {
                TestEvent::BeaconIntervalStarted => {
                    self.scheduler.beacon_interval_started(&mut sched, self.ap, bhi, ati);
                    self.queue.schedule(bhi, TestEvent::DtiStarted);
                }
                TestEvent::DtiStarted => {
                    self.scheduler.data_transfer_interval_started(&mut sched, self.ap, dti);
                }
                TestEvent::Scheduler(ev) => {
                    self.scheduler.handle_event(&mut sched, ev);
                    if ev == SchedulerEvent::BeaconIntervalEnded {
                        break;
                    }
                }
            }
        }
        self.notifications.try_iter().collect()
    }
}

pub fn addts_responses(notifications: &[SchedulerNotification]) -> Vec<(Aid, StatusCode)> {
    notifications
        .iter()
        .filter_map(|n| match n {
            SchedulerNotification::AddtsResponse { aid, status, .. } => Some((*aid, *status)),
            _ => None,
        })
        .collect()
}

pub fn schedule_updates(notifications: &[SchedulerNotification]) -> Vec<AllocationFieldList> {
    notifications
        .iter()
        .filter_map(|n| match n {
            SchedulerNotification::ScheduleUpdated { allocations } => Some(allocations.clone()),
            _ => None,
        })
        .collect()
}
