//! The filtering decision. Monotone: once a region is `deletable` it stays
//! that way. Called after a region's counters have just been updated,
//! either on the primary's own exit or while draining a worker's shadow
//! table at `team_end`.

use std::collections::HashMap;

use crate::config::FilterMode;
use crate::region::{RegionId, RegionRecord};

/// `capture_exit_site` is only ever `Some` when the caller is the primary
/// location's own `exit_region` callback, because only that stack is the
/// stack of the actual exit-hook call. A drain at `team_end` runs on a
/// different stack and must pass `None`; if the decision flips to
/// `deletable` there, `exit_site_addr` is simply left unset and captured
/// on a later primary exit of the same region instead (the "deferred
/// capture" rule).
pub fn apply_decision(
    records: &mut HashMap<RegionId, RegionRecord>,
    region_id: RegionId,
    mode: FilterMode,
    threshold_ticks: u64,
    capture_exit_site: Option<&dyn Fn() -> Option<usize>>,
) {
    let was_deletable = match records.get(&region_id) {
        Some(record) => record.deletable,
        None => return,
    };

    if !was_deletable {
        recompute_and_decide(records, region_id, mode, threshold_ticks);
    }

    if let Some(capture) = capture_exit_site {
        if let Some(record) = records.get_mut(&region_id) {
            if record.deletable && record.exit_site_addr.is_none() {
                if let Some(addr) = capture() {
                    record.exit_site_addr = Some(addr);
                }
            }
        }
    }
}

fn recompute_and_decide(
    records: &mut HashMap<RegionId, RegionRecord>,
    region_id: RegionId,
    mode: FilterMode,
    threshold_ticks: u64,
) {
    let mean = {
        let record = match records.get_mut(&region_id) {
            Some(record) => record,
            None => return,
        };
        if record.call_count == 0 {
            return;
        }
        record.mean_duration = record.total_duration as f64 / record.call_count as f64;
        record.mean_duration
    };

    let becomes_deletable = match mode {
        FilterMode::Absolute => mean < threshold_ticks as f64,
        FilterMode::Relative => {
            let mean_of_means = mean_of_means(records);
            match mean_of_means {
                Some(m) => mean < m - threshold_ticks as f64,
                None => false,
            }
        }
    };

    if becomes_deletable {
        if let Some(record) = records.get_mut(&region_id) {
            record.deletable = true;
        }
    }
}

/// Average of the mean durations of every region that has been entered at
/// least once. The source divides by a counter that is initialized to one
/// and never incremented, which makes the "mean of means" equal the raw
/// sum instead — treated here as a bug and corrected.
fn mean_of_means(records: &HashMap<RegionId, RegionRecord>) -> Option<f64> {
    let (sum, count) = records
        .values()
        .filter(|r| r.call_count > 0)
        .fold((0.0_f64, 0_u64), |(sum, count), r| {
            (sum + r.mean_duration, count + 1)
        });
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
