//! Station-side helpers for sizing service periods and building the DMG
//! TSPEC elements that request them.

use dmg_core::{AID_AP, AllocationId, MAX_ALLOCATION_ID, MAX_SP_BLOCK_DURATION};
use dmg_elements::{AllocationFormat, AllocationType, DmgAllocationInfo, DmgTspecElement};

use crate::allocation_error::AllocationError;


/// SP time per beacon interval, in microseconds, needed to carry
/// `app_rate_bps` over a PHY running at `phy_rate_bps`, inflated by `margin`
/// to absorb preamble and ACK overhead.
pub fn compute_service_period_duration(app_rate_bps: f64, phy_rate_bps: u64, beacon_interval_us: u32, margin: f64) -> u32 {
    let ratio = app_rate_bps / phy_rate_bps as f64;
    let airtime = (ratio * beacon_interval_us as f64).ceil();
    (airtime * margin) as u32
}

/// Builds a DMG TSPEC requesting an isochronous SP towards the AP.
///
/// With `period > 0` the requested durations are per-BI totals, divided over
/// `period` SPs inside each beacon interval.
pub fn build_dmg_tspec(
    allocation_id: AllocationId,
    pseudo_static: bool,
    min_allocation: u32,
    max_allocation: u32,
    period: u16,
) -> Result<DmgTspecElement, AllocationError> {
    if allocation_id == 0 || allocation_id > MAX_ALLOCATION_ID {
        return Err(AllocationError::InvalidAllocationId { id: allocation_id });
    }
    if min_allocation > max_allocation {
        return Err(AllocationError::MinExceedsMax {
            min: min_allocation,
            max: max_allocation,
        });
    }

    let (min, max) = if period > 0 {
        (min_allocation / period as u32, max_allocation / period as u32)
    } else {
        (min_allocation, max_allocation)
    };
    if max > MAX_SP_BLOCK_DURATION {
        return Err(AllocationError::BlockTooLong {
            duration: max,
            limit: MAX_SP_BLOCK_DURATION,
        });
    }

    let allocation_info = DmgAllocationInfo {
        allocation_id,
        allocation_type: AllocationType::ServicePeriod,
        allocation_format: AllocationFormat::Isochronous,
        pseudo_static,
        destination_aid: AID_AP,
        ..Default::default()
    };

    Ok(DmgTspecElement {
        allocation_info,
        allocation_period: period,
        period_multiple_bi: false,
        minimum_allocation: min as u16,
        maximum_allocation: max as u16,
        minimum_duration: min as u16,
        ..Default::default()
    })
}

/// Splits `total_duration` into as many equal SP requests as needed to keep
/// every block within the 15-bit duration field. The requests use
/// consecutive allocation ids starting at `base_id`; the whole split is
/// rejected before anything is built if those ids would run past 15.
pub fn split_service_period(
    base_id: AllocationId,
    pseudo_static: bool,
    total_duration: u32,
    period: u16,
) -> Result<Vec<DmgTspecElement>, AllocationError> {
    if base_id == 0 || base_id > MAX_ALLOCATION_ID {
        return Err(AllocationError::InvalidAllocationId { id: base_id });
    }
    let per_sp = if period > 0 { total_duration / period as u32 } else { total_duration };
    let blocks = per_sp.div_ceil(MAX_SP_BLOCK_DURATION).max(1);
    if base_id as u32 + blocks - 1 > MAX_ALLOCATION_ID as u32 {
        return Err(AllocationError::IdOverflow { base: base_id, blocks });
    }

    let sub_duration = total_duration / blocks;
    if blocks > 1 {
        tracing::debug!(
            "splitting {}us into {} requests of {}us, ids {}..={}",
            total_duration,
            blocks,
            sub_duration,
            base_id,
            base_id as u32 + blocks - 1
        );
    }
    (0..blocks)
        .map(|i| build_dmg_tspec(base_id + i as u8, pseudo_static, sub_duration, sub_duration, period))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmg_core::debug;

    #[test]
    fn test_sp_duration_covers_offered_load() {
        debug::setup_logging_verbose();
        // 300 Mbps over MCS12 (4620 Mbps) in a 102.4 ms BI
        let d = compute_service_period_duration(300e6, 4_620_000_000, 102_400, 1.0);
        assert_eq!(d, 6650, "airtime ceil(0.0649 * 102400)");
        let with_margin = compute_service_period_duration(300e6, 4_620_000_000, 102_400, 1.3);
        assert_eq!(with_margin, 8645);

        // d * phy / app approximates the beacon interval
        let bi = d as f64 * 4_620e6 / 300e6;
        assert!((bi - 102_400.0).abs() < 20.0, "reconstructed BI {}", bi);
    }

    #[test]
    fn test_tspec_divides_by_period() {
        debug::setup_logging_verbose();
        let tspec = build_dmg_tspec(3, true, 20_000, 20_000, 4).unwrap();
        tracing::info!("{}", tspec);
        assert_eq!(tspec.minimum_allocation, 5_000, "per-SP share of the BI total");
        assert_eq!(tspec.maximum_allocation, 5_000);
        assert_eq!(tspec.minimum_duration, 5_000);
        assert_eq!(tspec.allocation_period, 4);
        assert!(!tspec.period_multiple_bi);
        assert_eq!(tspec.allocation_info.allocation_id, 3);
        assert_eq!(tspec.allocation_info.destination_aid, AID_AP);
        assert_eq!(tspec.allocation_info.allocation_format, AllocationFormat::Isochronous);
    }

    #[test]
    fn test_tspec_validation() {
        debug::setup_logging_verbose();
        assert_eq!(
            build_dmg_tspec(1, false, 200, 100, 0),
            Err(AllocationError::MinExceedsMax { min: 200, max: 100 })
        );
        assert_eq!(
            build_dmg_tspec(1, false, 100, 40_000, 0),
            Err(AllocationError::BlockTooLong {
                duration: 40_000,
                limit: MAX_SP_BLOCK_DURATION
            })
        );
        assert!(build_dmg_tspec(1, false, 100, 40_000, 2).is_ok(), "per-SP share fits the field");
        assert_eq!(build_dmg_tspec(0, false, 10, 10, 0), Err(AllocationError::InvalidAllocationId { id: 0 }));
        assert_eq!(build_dmg_tspec(16, false, 10, 10, 0), Err(AllocationError::InvalidAllocationId { id: 16 }));
    }

    #[test]
    fn test_split_long_service_period() {
        debug::setup_logging_verbose();
        let reqs = split_service_period(2, true, 80_000, 0).unwrap();
        assert_eq!(reqs.len(), 3, "ceil(80000 / 32767) sub-blocks");
        let ids: Vec<u8> = reqs.iter().map(|t| t.allocation_info.allocation_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        for t in &reqs {
            assert_eq!(t.maximum_allocation as u32, 80_000 / 3);
        }

        let single = split_service_period(5, false, 1_000, 0).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].maximum_allocation, 1_000);
    }

    #[test]
    fn test_split_rejects_id_overflow() {
        debug::setup_logging_verbose();
        // 3 sub-blocks from id 14 would need ids 14, 15, 16
        assert_eq!(
            split_service_period(14, false, 80_000, 0),
            Err(AllocationError::IdOverflow { base: 14, blocks: 3 })
        );
        assert!(split_service_period(13, false, 80_000, 0).is_ok());
    }
}
