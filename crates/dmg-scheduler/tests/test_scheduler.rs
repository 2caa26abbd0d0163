mod common;

use dmg_config::SchedulerType;
use dmg_core::{ChannelAccessPeriod, DmgMcs, GUARD_TIME, MAX_SP_BLOCK_DURATION, ScopedScheduler, SimDuration, debug};
use dmg_elements::{AllocationType, StatusCode};
use dmg_scheduler::{build_dmg_tspec, compute_service_period_duration, split_service_period};

use common::{SchedulerTest, TestEvent, addts_responses, schedule_updates, test_config};

fn cbap_time(list: &dmg_elements::AllocationFieldList) -> u32 {
    list.iter().filter(|f| f.is_broadcast_cbap()).map(|f| f.block_duration as u32).sum()
}

#[test]
fn test_cbap_only_rejects_and_keeps_dti_open() {
    debug::setup_logging_verbose();
    let mut test = SchedulerTest::new(test_config(SchedulerType::CbapOnly));
    test.submit_addts(1, build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap());

    let notes = test.run_beacon_interval();
    assert_eq!(addts_responses(&notes), vec![(1, StatusCode::Failure)]);

    let schedules = schedule_updates(&notes);
    assert_eq!(schedules.len(), 1, "one schedule per beacon interval");
    let dti = test.config.config().scenario.dti_duration_us();
    assert_eq!(cbap_time(&schedules[0]), dti, "whole DTI is contention time");
    assert_eq!(test.config.state_read().addts_rejected, 1);
}

#[test]
fn test_periodic_end_to_end() {
    debug::setup_logging_verbose();
    let mut cfg = test_config(SchedulerType::Periodic);
    cfg.scenario.allocation_period = 4;
    let mut test = SchedulerTest::new(cfg);

    // 300 Mbps over MCS12 with the 1% margin
    let mcs = DmgMcs::from_index(12).unwrap();
    let duration = compute_service_period_duration(300e6, mcs.data_rate_bps(), 102_400, 1.01);
    let back = duration as f64 * mcs.data_rate_bps() as f64 / 300e6;
    assert!((back / 102_400.0 - 1.0).abs() <= 0.011, "d * phy / app ~ BI, got {}", back);

    let requests = split_service_period(1, true, duration, 4).unwrap();
    assert_eq!(requests.len(), 1, "per-SP share fits one block");
    for tspec in requests {
        test.submit_addts(1, tspec);
    }

    let notes = test.run_beacon_interval();
    assert_eq!(addts_responses(&notes), vec![(1, StatusCode::Success)]);
    let schedule = schedule_updates(&notes).pop().unwrap();
    let sp: Vec<_> = schedule.iter().filter(|f| f.allocation_type == AllocationType::ServicePeriod).collect();
    assert_eq!(sp.len(), 1);
    assert_eq!(sp[0].number_of_blocks, 4);
    assert_eq!(sp[0].block_period, 25_600);
    assert_eq!(sp[0].block_duration as u32, duration / 4);
    assert!(cbap_time(&schedule) >= 4096);
    assert_eq!(test.config.state_read().addts_accepted, 1);

    // Pseudo-static allocation survives the next beacon interval untouched
    let notes = test.run_beacon_interval();
    let schedule = schedule_updates(&notes).pop().unwrap();
    assert_eq!(schedule.iter().filter(|f| !f.is_broadcast_cbap()).count(), 1);
}

#[test]
fn test_long_request_is_split() {
    debug::setup_logging_verbose();
    let mut test = SchedulerTest::new(test_config(SchedulerType::Basic));
    let requests = split_service_period(3, true, 50_000, 0).unwrap();
    assert_eq!(requests.len(), 2);
    for tspec in requests {
        assert!(tspec.maximum_allocation as u32 <= MAX_SP_BLOCK_DURATION);
        test.submit_addts(1, tspec);
    }

    let notes = test.run_beacon_interval();
    assert_eq!(addts_responses(&notes), vec![(1, StatusCode::Success), (1, StatusCode::Success)]);
    let ids: Vec<u8> = test.scheduler.state().addts_allocation_list.iter().map(|f| f.allocation_id).collect();
    assert_eq!(ids, vec![3, 4]);
}

#[test]
fn test_admission_keeps_cbap_floor() {
    debug::setup_logging_verbose();
    let mut cfg = test_config(SchedulerType::Periodic);
    cfg.scheduler.inter_allocation_distance = 50;
    let mut test = SchedulerTest::new(cfg);
    for aid in 1..=12u8 {
        test.submit_addts(aid, build_dmg_tspec(1, true, 12_000, 12_000, 4).unwrap());
    }

    let notes = test.run_beacon_interval();
    let responses = addts_responses(&notes);
    let accepted = responses.iter().filter(|(_, s)| s.is_success()).count();
    tracing::info!("{} of {} accepted", accepted, responses.len());
    assert!(accepted > 0 && accepted < 12, "some accepted, rest refused");

    let state = test.scheduler.state();
    let used: u32 = state
        .addts_allocation_list
        .iter()
        .map(|f| f.number_of_blocks as u32 * (f.block_duration as u32 + 50))
        .sum();
    assert!(used <= state.dti_duration - 4096, "SP time {}us leaves the CBAP floor", used);
    assert!(cbap_time(&state.allocation_list) >= 4096);
}

#[test]
fn test_non_static_allocation_expires() {
    debug::setup_logging_verbose();
    let mut test = SchedulerTest::new(test_config(SchedulerType::Basic));
    test.submit_addts(1, build_dmg_tspec(1, false, 5_000, 5_000, 0).unwrap());
    test.submit_addts(2, build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap());

    let notes = test.run_beacon_interval();
    assert_eq!(addts_responses(&notes).len(), 2);
    assert_eq!(test.scheduler.state().addts_allocation_list.len(), 2);

    test.run_beacon_interval();
    let state = test.scheduler.state();
    assert_eq!(state.addts_allocation_list.len(), 1, "only the pseudo-static SP is kept");
    assert_eq!(state.addts_allocation_list[0].source_aid, 2);
    assert_eq!(state.allocated_requests.len(), 1);
}

#[test]
fn test_repeated_request_modifies() {
    debug::setup_logging_verbose();
    let mut test = SchedulerTest::new(test_config(SchedulerType::Basic));
    test.submit_addts(1, build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap());
    test.submit_addts(2, build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap());
    test.run_beacon_interval();

    test.submit_addts(1, build_dmg_tspec(1, true, 8_000, 8_000, 0).unwrap());
    let notes = test.run_beacon_interval();
    assert_eq!(addts_responses(&notes), vec![(1, StatusCode::Success)]);
    let list = &test.scheduler.state().addts_allocation_list;
    assert_eq!(list.len(), 2, "modified in place, not added");
    assert_eq!(list[0].block_duration, 8_000);
    assert_eq!(list[1].allocation_start, 8_000 + GUARD_TIME);
}

#[test]
fn test_delts_releases_time() {
    debug::setup_logging_verbose();
    let mut test = SchedulerTest::new(test_config(SchedulerType::Basic));
    for aid in 1..=3u8 {
        test.submit_addts(aid, build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap());
    }
    test.run_beacon_interval();

    let info = build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap().allocation_info;
    test.scheduler.receive_delts(2, &info).unwrap();
    let state = test.scheduler.state();
    assert_eq!(state.addts_allocation_list.len(), 2);
    assert_eq!(state.addts_allocation_list[1].source_aid, 3);
    assert_eq!(state.addts_allocation_list[1].allocation_start, 5_000 + GUARD_TIME, "follower moved up");
    assert_eq!(state.allocation_start_time, 2 * (5_000 + GUARD_TIME));

    assert!(test.scheduler.receive_delts(2, &info).is_err(), "already released");
}

#[test]
fn test_periodic_delts_frees_slots() {
    debug::setup_logging_verbose();
    let mut test = SchedulerTest::new(test_config(SchedulerType::Periodic));
    test.submit_addts(1, build_dmg_tspec(1, true, 20_000, 20_000, 4).unwrap());
    test.run_beacon_interval();
    let dti = test.scheduler.state().dti_duration;
    assert!(test.scheduler.state().remaining_dti_time < dti);

    let info = build_dmg_tspec(1, true, 20_000, 20_000, 4).unwrap().allocation_info;
    test.scheduler.receive_delts(1, &info).unwrap();
    assert_eq!(test.scheduler.state().remaining_dti_time, dti);
}

#[test]
fn test_invalid_allocation_id_refused() {
    debug::setup_logging_verbose();
    let mut test = SchedulerTest::new(test_config(SchedulerType::Basic));
    let mut tspec = build_dmg_tspec(1, true, 5_000, 5_000, 0).unwrap();
    tspec.allocation_info.allocation_id = 0;
    test.submit_addts(1, tspec);
    let notes = test.run_beacon_interval();
    assert_eq!(addts_responses(&notes), vec![(1, StatusCode::Failure)]);
    assert!(test.scheduler.state().addts_allocation_list.is_empty());
}

#[test]
fn test_ati_phase_tracked() {
    debug::setup_logging_verbose();
    let mut cfg = test_config(SchedulerType::CbapOnly);
    cfg.scenario.ati_duration_us = 500;
    let mut test = SchedulerTest::new(cfg);

    {
        let mut sched = ScopedScheduler::new(&mut test.queue, TestEvent::Scheduler);
        test.scheduler.beacon_interval_started(
            &mut sched,
            test.ap,
            SimDuration::from_micros(3_000),
            SimDuration::from_micros(500),
        );
    }
    assert_eq!(test.scheduler.current_period(), ChannelAccessPeriod::Bhi);

    let (at, ev) = test.queue.pop_next().unwrap();
    assert_eq!(at.as_nanos(), SimDuration::from_micros(3_000 - 500 - 3).as_nanos(), "ATI starts MBIFS early");
    let TestEvent::Scheduler(ev) = ev else { panic!("unexpected {:?}", ev) };
    let mut sched = ScopedScheduler::new(&mut test.queue, TestEvent::Scheduler);
    test.scheduler.handle_event(&mut sched, ev);
    assert_eq!(test.scheduler.current_period(), ChannelAccessPeriod::Ati);
}
